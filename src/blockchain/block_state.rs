//! Block state: the in-memory overlay for one uncommitted (or just
//! committed) block's pending writes (spec.md §3, §4.7).
//!
//! Grounded in spec.md §9's "Ref-counted disposables" pattern: `BlockLease`
//! is the typed lease handle, backed by an `AtomicIsize` counter on
//! [`BlockState`] plus a `Drop` impl that disposes the block's dictionaries,
//! ancestor leases and leased read-only batch exactly once, when the count
//! reaches zero. `try_acquire` refuses to resurrect an already-disposed
//! block (spec.md §5).

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::atomic::{AtomicI64, AtomicIsize, Ordering};
use std::sync::Arc;
use twox_hash::XxHash64;

use super::BlockHash;
use crate::bloom::{MutableBloom, XorFilter};
use crate::nibble::{Key, KeyKind, NibblePath};
use crate::pool::BufferPool;
use crate::span::{EntryMetadata, SpanDictionary};
use crate::store::{PageSource, ReadOnlyBatch};

fn key_hash(bytes: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0x1357_2468_1357_2468);
    h.write(bytes);
    h.finish()
}

/// Per-block read-through cache budget (spec.md §4.8). A read that hits at
/// `depth >= cache_from_depth` may be written back into the reading block's
/// own dictionary, tagged `Cached` while the counter is still positive and
/// `UseOnce` once it's exhausted; the pre-commit hook decides what to do
/// with either tag.
pub struct CacheBudget {
    entries_remaining: AtomicI64,
    cache_from_depth: u8,
}

impl CacheBudget {
    pub fn new(entries_per_block: i64, cache_from_depth: u8) -> Self {
        CacheBudget {
            entries_remaining: AtomicI64::new(entries_per_block),
            cache_from_depth,
        }
    }

    fn metadata_for_depth(&self, depth: u8) -> EntryMetadata {
        if depth < self.cache_from_depth {
            return EntryMetadata::Normal;
        }
        let prev = self.entries_remaining.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            EntryMetadata::Cached
        } else {
            EntryMetadata::UseOnce
        }
    }
}

enum LocalOutcome {
    Destroyed,
    Hit(Vec<u8>),
    Miss,
}

struct Inner {
    state: Option<SpanDictionary>,
    storage: Option<SpanDictionary>,
    pre_commit: Option<SpanDictionary>,
    destroyed: HashSet<[u8; 32]>,
    bloom: MutableBloom,
    bloom_keys: Vec<Vec<u8>>,
    filter: Option<XorFilter>,
    ancestors: Vec<BlockLease>,
    ro_batch: Option<ReadOnlyBatch>,
    hash: Option<BlockHash>,
    block_number: Option<u32>,
    committed: bool,
}

/// An in-memory overlay of pending writes for one block, keyed logically by
/// `(block_number, hash)` once committed (spec.md §3's "Block State").
pub struct BlockState {
    parent_hash: BlockHash,
    pool: Arc<BufferPool>,
    cache_budget: CacheBudget,
    lease_count: AtomicIsize,
    inner: Mutex<Inner>,
}

impl BlockState {
    pub(crate) fn new(
        parent_hash: BlockHash,
        ancestors: Vec<BlockLease>,
        ro_batch: ReadOnlyBatch,
        pool: Arc<BufferPool>,
        cache_entries_per_block: i64,
        cache_from_depth: u8,
    ) -> (Arc<Self>, BlockLease) {
        let inner = Inner {
            state: Some(SpanDictionary::new(Arc::clone(&pool), false)),
            storage: Some(SpanDictionary::new(Arc::clone(&pool), false)),
            pre_commit: Some(SpanDictionary::new(Arc::clone(&pool), false)),
            destroyed: HashSet::new(),
            bloom: MutableBloom::new(),
            bloom_keys: Vec::new(),
            filter: None,
            ancestors,
            ro_batch: Some(ro_batch),
            hash: None,
            block_number: None,
            committed: false,
        };
        let arc = Arc::new(BlockState {
            parent_hash,
            pool,
            cache_budget: CacheBudget::new(cache_entries_per_block, cache_from_depth),
            lease_count: AtomicIsize::new(1),
            inner: Mutex::new(inner),
        });
        crate::metrics::record_block_started();
        let lease = BlockLease(Some(Arc::clone(&arc)));
        (arc, lease)
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.parent_hash
    }

    pub fn hash(&self) -> Option<BlockHash> {
        self.inner.lock().hash
    }

    pub fn block_number(&self) -> Option<u32> {
        self.inner.lock().block_number
    }

    pub fn is_committed(&self) -> bool {
        self.inner.lock().committed
    }

    /// Every account this block has `destroy_account`'d.
    pub(crate) fn destroyed_accounts(&self) -> Vec<[u8; 32]> {
        self.inner.lock().destroyed.iter().copied().collect()
    }

    fn local_outcome(&self, account: [u8; 32], key_bytes: &[u8], hash: u64, is_account: bool) -> LocalOutcome {
        let inner = self.inner.lock();
        if inner.destroyed.contains(&account) {
            return LocalOutcome::Destroyed;
        }
        let possibly_present = match &inner.filter {
            Some(f) => f.may_contain(key_bytes),
            None => inner.bloom.may_contain(key_bytes),
        };
        if !possibly_present {
            return LocalOutcome::Miss;
        }
        if let Some(pc) = &inner.pre_commit {
            if let Some(v) = pc.try_get(key_bytes, hash) {
                return LocalOutcome::Hit(v);
            }
        }
        let dict = if is_account { &inner.state } else { &inner.storage };
        if let Some(d) = dict {
            if let Some(v) = d.try_get(key_bytes, hash) {
                return LocalOutcome::Hit(v);
            }
        }
        LocalOutcome::Miss
    }

    fn maybe_cache(&self, key_bytes: &[u8], hash: u64, is_account: bool, value: &[u8], depth: u8) {
        let metadata = self.cache_budget.metadata_for_depth(depth);
        if matches!(metadata, EntryMetadata::Normal) {
            return;
        }
        let mut inner = self.inner.lock();
        let dict = if is_account { inner.state.as_mut() } else { inner.storage.as_mut() };
        if let Some(d) = dict {
            let _ = d.set(key_bytes, hash, value, metadata);
        }
    }

    /// The `try_get_local` ladder (spec.md §4.7): self, then ancestors
    /// youngest-first, then the leased read-only store snapshot. A
    /// `destroy_account` recorded anywhere along the way shadows
    /// everything older and stops the search immediately.
    fn read_ladder(&self, account: [u8; 32], key_bytes: &[u8], is_account: bool) -> Result<Option<Vec<u8>>> {
        let hash = key_hash(key_bytes);

        match self.local_outcome(account, key_bytes, hash, is_account) {
            LocalOutcome::Destroyed => return Ok(None),
            LocalOutcome::Hit(v) => return Ok(Some(v)),
            LocalOutcome::Miss => {}
        }

        let ancestors = self.inner.lock().ancestors.clone();
        for (i, lease) in ancestors.iter().enumerate() {
            let depth = (i + 1) as u8;
            match lease.block().local_outcome(account, key_bytes, hash, is_account) {
                LocalOutcome::Destroyed => return Ok(None),
                LocalOutcome::Hit(v) => {
                    self.maybe_cache(key_bytes, hash, is_account, &v, depth);
                    return Ok(Some(v));
                }
                LocalOutcome::Miss => continue,
            }
        }

        let ro = self.inner.lock().ro_batch.clone();
        if let Some(ro) = ro {
            let path = crate::nibble::OwnedNibblePath::from_full_bytes(key_bytes.to_vec());
            if let Some(v) = crate::trie::try_get(&ro, ro.root_data_addr(), &path.as_ref())? {
                let depth = ancestors.len() as u8 + 1;
                self.maybe_cache(key_bytes, hash, is_account, &v, depth);
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub fn get_account(&self, account: [u8; 32]) -> Result<Option<Vec<u8>>> {
        let key = Key::account(NibblePath::full(&account));
        let mut buf = Vec::new();
        key.encode(&mut buf);
        self.read_ladder(account, &buf, true)
    }

    pub fn get_storage(&self, account: [u8; 32], slot: [u8; 32]) -> Result<Option<Vec<u8>>> {
        let key = Key::storage_cell(NibblePath::full(&account), NibblePath::full(&slot));
        let mut buf = Vec::new();
        key.encode(&mut buf);
        self.read_ladder(account, &buf, false)
    }

    fn write_local(&self, key_bytes: &[u8], value: &[u8], is_account: bool) -> Result<()> {
        let hash = key_hash(key_bytes);
        let mut inner = self.inner.lock();
        inner.bloom.insert(key_bytes);
        inner.bloom_keys.push(key_bytes.to_vec());
        let dict = if is_account { inner.state.as_mut() } else { inner.storage.as_mut() };
        dict.ok_or_else(|| anyhow!("block state already disposed"))?
            .set(key_bytes, hash, value, EntryMetadata::Normal)
    }

    pub fn set_account(&self, account: [u8; 32], value: &[u8]) -> Result<()> {
        let key = Key::account(NibblePath::full(&account));
        let mut buf = Vec::new();
        key.encode(&mut buf);
        self.write_local(&buf, value, true)
    }

    pub fn set_storage(&self, account: [u8; 32], slot: [u8; 32], value: &[u8]) -> Result<()> {
        let key = Key::storage_cell(NibblePath::full(&account), NibblePath::full(&slot));
        let mut buf = Vec::new();
        key.encode(&mut buf);
        self.write_local(&buf, value, false)
    }

    /// `destroy_account(a)` (spec.md §4.7, §9's resolved open question):
    /// records `a` as destroyed (shadowing all older state through
    /// `read_ladder`) and purges this block's own pending writes for `a` —
    /// the account entry itself, every storage cell under it, and any
    /// matching `_pre_commit` entries.
    pub fn destroy_account(&self, account: [u8; 32]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.destroyed.insert(account);

        let acct_path = NibblePath::full(&account);
        let mut acct_bytes = Vec::new();
        Key::account(acct_path.clone()).encode(&mut acct_bytes);

        let mut storage_prefix = Vec::new();
        storage_prefix.push(KeyKind::StorageCell as u8);
        acct_path.encode(&mut storage_prefix);

        if let Some(s) = &inner.state {
            s.remove(&acct_bytes, key_hash(&acct_bytes));
        }
        if let Some(storage) = &inner.storage {
            for (k, _, _, _) in storage.iter() {
                if k.starts_with(&storage_prefix) {
                    storage.remove(&k, key_hash(&k));
                }
            }
        }
        if let Some(pc) = &inner.pre_commit {
            for (k, _, _, _) in pc.iter() {
                if k == acct_bytes || k.starts_with(&storage_prefix) {
                    pc.remove(&k, key_hash(&k));
                }
            }
        }
        Ok(())
    }

    /// Commit-view accessors used by [`super::precommit::CommitView`].
    pub(crate) fn get_local_raw(&self, key: &Key) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        key.encode(&mut buf);
        let hash = key_hash(&buf);
        let inner = self.inner.lock();
        if let Some(pc) = &inner.pre_commit {
            if let Some(v) = pc.try_get(&buf, hash) {
                return Some(v);
            }
        }
        let dict = match key.kind {
            KeyKind::Account => &inner.state,
            KeyKind::StorageCell => &inner.storage,
            KeyKind::Merkle | KeyKind::Deleted => &inner.pre_commit,
        };
        dict.as_ref().and_then(|d| d.try_get(&buf, hash))
    }

    pub(crate) fn set_pre_commit_raw(&self, key: &Key, value: &[u8]) {
        let mut buf = Vec::new();
        key.encode(&mut buf);
        let hash = key_hash(&buf);
        let mut inner = self.inner.lock();
        if let Some(pc) = inner.pre_commit.as_mut() {
            let _ = pc.set(&buf, hash, value, EntryMetadata::Normal);
        }
    }

    pub(crate) fn written_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        if let Some(s) = &inner.state {
            out.extend(s.iter().into_iter().map(|(k, v, _, _)| (k, v)));
        }
        if let Some(s) = &inner.storage {
            out.extend(s.iter().into_iter().map(|(k, v, _, _)| (k, v)));
        }
        out
    }

    /// Flusher-facing accessors: the raw `(routing_path_bytes, value)` pairs
    /// to be applied into the paged store's trie.
    pub(crate) fn state_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .lock()
            .state
            .as_ref()
            .map(|d| d.iter().into_iter().map(|(k, v, _, _)| (k, v)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn storage_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .lock()
            .storage
            .as_ref()
            .map(|d| d.iter().into_iter().map(|(k, v, _, _)| (k, v)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn pre_commit_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .lock()
            .pre_commit
            .as_ref()
            .map(|d| d.iter().into_iter().map(|(k, v, _, _)| (k, v)).collect())
            .unwrap_or_default()
    }

    /// Commit (block level, spec.md §4.7): run the pre-commit hook, freeze
    /// the bloom into an immutable XOR filter, and release the ancestor/
    /// read-only-batch leases — once committed this block only ever answers
    /// `local_outcome` queries issued by a *descendant's* ancestor walk, so
    /// it no longer needs its own chain of leases.
    pub(crate) fn commit(&self, hook: &dyn super::precommit::PreCommitHook, block_number: u32) -> Result<BlockHash> {
        if self.inner.lock().committed {
            return Err(anyhow!("block already committed"));
        }
        let hash = hook.compute_hash(&super::precommit::CommitView::new(self));

        let mut inner = self.inner.lock();
        inner.hash = Some(hash);
        inner.block_number = Some(block_number);
        inner.committed = true;
        let keys = std::mem::take(&mut inner.bloom_keys);
        inner.filter = Some(MutableBloom::freeze(&keys));
        inner.bloom.clear();
        inner.ancestors.clear();
        inner.ro_batch = None;
        Ok(hash)
    }

    /// `reset()` (spec.md §6.5, §7): discard this block's pending writes
    /// and start over, used after a pre-commit hook failure leaves the
    /// block in "uncommitted" state.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.committed {
            return Err(anyhow!("cannot reset an already-committed block"));
        }
        inner.state = Some(SpanDictionary::new(Arc::clone(&self.pool), false));
        inner.storage = Some(SpanDictionary::new(Arc::clone(&self.pool), false));
        inner.pre_commit = Some(SpanDictionary::new(Arc::clone(&self.pool), false));
        inner.destroyed.clear();
        inner.bloom = MutableBloom::new();
        inner.bloom_keys.clear();
        Ok(())
    }

    fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.state = None;
        inner.storage = None;
        inner.pre_commit = None;
        inner.ancestors.clear();
        inner.ro_batch = None;
    }
}

/// A ref-counted handle keeping a [`BlockState`] alive (spec.md §9's
/// `RefCountingDisposable`). `clone` increments the count; `drop`
/// decrements it and disposes the block's dictionaries/leases the instant
/// the count reaches zero.
pub struct BlockLease(Option<Arc<BlockState>>);

impl BlockLease {
    pub(crate) fn block(&self) -> &BlockState {
        self.0.as_ref().expect("BlockLease used after being dropped")
    }

    pub(crate) fn parent_hash(&self) -> BlockHash {
        self.block().parent_hash()
    }

    /// "try-acquire-lease": fails once the count has already reached zero,
    /// preventing resurrection of a disposed block (spec.md §5).
    pub(crate) fn try_acquire(arc: &Arc<BlockState>) -> Option<BlockLease> {
        loop {
            let cur = arc.lease_count.load(Ordering::Acquire);
            if cur <= 0 {
                return None;
            }
            if arc
                .lease_count
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(BlockLease(Some(Arc::clone(arc))));
            }
        }
    }
}

impl Clone for BlockLease {
    fn clone(&self) -> Self {
        if let Some(a) = &self.0 {
            a.lease_count.fetch_add(1, Ordering::AcqRel);
        }
        BlockLease(self.0.clone())
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        if let Some(a) = self.0.take() {
            if a.lease_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                a.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;

    fn fresh(pool: &Arc<BufferPool>, store: &Store, parent: BlockHash) -> (Arc<BlockState>, BlockLease) {
        let ro = store.begin_read_only_batch().unwrap();
        BlockState::new(parent, Vec::new(), ro, Arc::clone(pool), 10_000, 2)
    }

    #[test]
    fn round_trip_set_then_get() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let pool = Arc::new(BufferPool::with_leak_check(true));
        let (state, _lease) = fresh(&pool, &store, [0u8; 32]);
        state.set_account([1u8; 32], b"balance=5").unwrap();
        assert_eq!(state.get_account([1u8; 32]).unwrap(), Some(b"balance=5".to_vec()));
        assert_eq!(state.get_account([2u8; 32]).unwrap(), None);
    }

    #[test]
    fn destroy_shadows_own_and_future_reads() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let pool = Arc::new(BufferPool::with_leak_check(true));
        let (state, _lease) = fresh(&pool, &store, [0u8; 32]);
        state.set_account([1u8; 32], b"balance=5").unwrap();
        state.set_storage([1u8; 32], [9u8; 32], b"slot-value").unwrap();
        state.destroy_account([1u8; 32]).unwrap();
        assert_eq!(state.get_account([1u8; 32]).unwrap(), None);
        assert_eq!(state.get_storage([1u8; 32], [9u8; 32]).unwrap(), None);
    }

    #[test]
    fn dispose_releases_ancestor_lease_transitively() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let pool = Arc::new(BufferPool::with_leak_check(true));
        let (parent, parent_lease) = fresh(&pool, &store, [0u8; 32]);
        assert_eq!(parent.lease_count.load(Ordering::Acquire), 1);
        let ro = store.begin_read_only_batch().unwrap();
        let (_child, child_lease) =
            BlockState::new([1u8; 32], vec![parent_lease.clone()], ro, Arc::clone(&pool), 10_000, 2);
        assert_eq!(parent.lease_count.load(Ordering::Acquire), 2);
        drop(parent_lease);
        assert_eq!(parent.lease_count.load(Ordering::Acquire), 1);
        drop(child_lease);
        assert_eq!(parent.lease_count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn try_acquire_fails_once_disposed() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let pool = Arc::new(BufferPool::with_leak_check(true));
        let (state, lease) = fresh(&pool, &store, [0u8; 32]);
        drop(lease);
        assert!(BlockLease::try_acquire(&state).is_none());
    }
}
