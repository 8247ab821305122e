//! The blockchain overlay (spec.md §4.7): an in-memory DAG of uncommitted
//! blocks, a finalization channel, and an asynchronous flusher that applies
//! finalized blocks to the paged store.
//!
//! Grounded in Design Notes §9's "Block DAG with weak parent references"
//! (parents are leased strong handles for the duration of a descendant's
//! life, never a raw pointer) and "Finalization as a channel" (a dedicated
//! consumer, cancellation via channel-complete). The teacher crate has no
//! async/background-task precedent of its own (it is a synchronous,
//! CLI-driven embedded library), so the flusher here is a plain
//! `std::thread::spawn` consumer draining a `crossbeam_channel`, matching
//! SPEC_FULL.md §4.7's resolution of that gap.

pub mod block_state;
pub mod precommit;

pub use block_state::{BlockLease, BlockState, CacheBudget};
pub use precommit::{CommitView, NoopPreCommit, PreCommitHook};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::nibble::{Key, NibblePath};
use crate::pool::BufferPool;
use crate::store::{CommitOptions, Store};

/// A block hash — opaque to this core beyond equality/hashing; in practice
/// the output of the pluggable pre-commit hook (spec.md §9).
pub type BlockHash = [u8; 32];

/// Sentinel parent hash meaning "the store's current root, no in-memory
/// parent block" — the root of the chain the overlay is built on top of.
pub const GENESIS_HASH: BlockHash = [0u8; 32];

/// A single block queued for finalization: everything the flusher needs to
/// apply it to the paged store, plus the lease keeping its dictionaries
/// alive until the flusher is done with them.
struct FinalizeItem {
    hash: BlockHash,
    block_number: u32,
    lease: BlockLease,
}

struct ChainState {
    blocks_by_hash: HashMap<BlockHash, BlockLease>,
    blocks_by_number: HashMap<u32, Vec<BlockHash>>,
    last_finalized: Option<(u32, BlockHash)>,
}

struct ChainInner {
    store: Arc<Store>,
    pool: Arc<BufferPool>,
    hook: Arc<dyn PreCommitHook>,
    cache_entries_per_block: i64,
    cache_from_depth: u8,
    min_flush_delay: Duration,
    state: Mutex<ChainState>,
    finalize_tx: Mutex<Option<Sender<FinalizeItem>>>,
    flusher: Mutex<Option<JoinHandle<Result<()>>>>,
    last_flushed: AtomicU32,
    listeners: Mutex<Vec<Box<dyn Fn(u32) + Send + Sync>>>,
}

/// Block DAG + finalization queue + flusher task over a [`Store`]
/// (spec.md §4.7). Cheaply cloneable: every clone shares the same
/// underlying state, matching the teacher crate's `Db`/`Arc<DbInner>`
/// handle idiom.
#[derive(Clone)]
pub struct Blockchain {
    inner: Arc<ChainInner>,
}

impl Blockchain {
    /// Open a blockchain overlay over `store`, spawning its flusher thread.
    pub fn open(store: Arc<Store>, config: &EngineConfig, hook: Arc<dyn PreCommitHook>) -> Self {
        let (tx, rx) = match config.finalization_queue_limit {
            Some(limit) => bounded(limit.max(1)),
            None => unbounded(),
        };

        let inner = Arc::new(ChainInner {
            store,
            pool: Arc::new(BufferPool::new()),
            hook,
            cache_entries_per_block: config.cache_entries_per_block,
            cache_from_depth: config.cache_from_depth,
            min_flush_delay: config.min_flush_delay,
            state: Mutex::new(ChainState {
                blocks_by_hash: HashMap::new(),
                blocks_by_number: HashMap::new(),
                last_finalized: None,
            }),
            finalize_tx: Mutex::new(Some(tx)),
            flusher: Mutex::new(None),
            last_flushed: AtomicU32::new(0),
            listeners: Mutex::new(Vec::new()),
        });

        info!(
            "blockchain: opened, finalization_queue_limit={:?} min_flush_delay={:?}",
            config.finalization_queue_limit, config.min_flush_delay
        );

        let flusher_inner = Arc::clone(&inner);
        let handle = std::thread::spawn(move || flusher_loop(flusher_inner, rx));
        *inner.flusher.lock() = Some(handle);

        Blockchain { inner }
    }

    /// `Store.has_state(hash)` (spec.md §6.5), lifted to the overlay: the
    /// hash is live either as an in-memory block or as the store's current
    /// (already flushed) root.
    pub fn has_state(&self, hash: BlockHash) -> bool {
        if self.inner.state.lock().blocks_by_hash.contains_key(&hash) {
            return true;
        }
        self.inner
            .store
            .begin_read_only_batch()
            .map(|ro| ro.block_hash == hash)
            .unwrap_or(false)
    }

    /// Block number of the most recently flushed block (the `flushed`
    /// event's payload, polled instead of pushed — see `on_flushed`).
    pub fn flushed_block_number(&self) -> u32 {
        self.inner.last_flushed.load(Ordering::Acquire)
    }

    /// Register a callback invoked (on the flusher thread) every time a
    /// batch of finalized blocks has been flushed, with the highest block
    /// number in that batch — the `Blockchain.flushed` event of spec.md §6.5.
    pub fn on_flushed(&self, listener: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    fn open_overlay(&self, parent_hash: BlockHash) -> EngineResult<(Arc<BlockState>, BlockLease)> {
        let state = self.inner.state.lock();
        let mut ancestors = Vec::new();
        let mut cur = parent_hash;
        loop {
            match state.blocks_by_hash.get(&cur) {
                Some(lease) => {
                    // The map itself keeps this lease's refcount above zero,
                    // so a plain clone (not a fallible try-acquire) is safe.
                    let acquired = lease.clone();
                    let next = acquired.parent_hash();
                    ancestors.push(acquired);
                    cur = next;
                }
                None => break,
            }
        }
        drop(state);

        // `cur` is now the oldest in-memory ancestor's parent (or
        // `parent_hash` itself if nothing was in memory) — it must name
        // either the genesis sentinel over an empty store, or the store's
        // current committed root.
        let ro = self
            .inner
            .store
            .begin_read_only_batch()
            .map_err(EngineError::Internal)?;
        let matches_store_root = cur == ro.block_hash || (cur == GENESIS_HASH && self.inner.store.current_counter() == 0);
        if !matches_store_root {
            return Err(EngineError::MissingParent(parent_hash));
        }

        let (arc, lease) = BlockState::new(
            parent_hash,
            ancestors,
            ro,
            Arc::clone(&self.inner.pool),
            self.inner.cache_entries_per_block,
            self.inner.cache_from_depth,
        );
        Ok((arc, lease))
    }

    /// `Blockchain.start_new(parent_hash) -> WorldState` (spec.md §6.5).
    pub fn start_new(&self, parent_hash: BlockHash) -> EngineResult<WorldState> {
        let (_arc, lease) = self.open_overlay(parent_hash)?;
        Ok(WorldState {
            chain: self.clone(),
            lease,
        })
    }

    /// `Blockchain.start_read_only(parent_hash) -> ReadOnlyWorldState`.
    pub fn start_read_only(&self, parent_hash: BlockHash) -> EngineResult<ReadOnlyWorldState> {
        let (_arc, lease) = self.open_overlay(parent_hash)?;
        Ok(ReadOnlyWorldState { lease })
    }

    fn commit_block(&self, lease: BlockLease, block_number: u32) -> EngineResult<BlockHash> {
        if lease.block().is_committed() {
            let hash = lease.block().hash().expect("committed block always has a hash");
            return Err(EngineError::DoubleCommit(hash));
        }
        let hash = lease
            .block()
            .commit(self.inner.hook.as_ref(), block_number)
            .map_err(EngineError::Internal)?;

        let mut state = self.inner.state.lock();
        state.blocks_by_hash.insert(hash, lease.clone());
        state.blocks_by_number.entry(block_number).or_default().push(hash);
        crate::metrics::record_block_committed();
        debug!("blockchain: committed block_number={block_number} hash={hash:02x?}");
        Ok(hash)
    }

    /// `Blockchain.finalize(hash)` (spec.md §4.7, §6.5): walk from `hash`
    /// back through parents up to `last_finalized`, push the chain (oldest
    /// first) to the flusher. Idempotent: finalizing an already-finalized
    /// hash is a no-op; finalizing a lower block number than the current
    /// `last_finalized` is rejected.
    pub fn finalize(&self, hash: BlockHash) -> EngineResult<()> {
        let chain = {
            let mut state = self.inner.state.lock();

            if let Some((_, last_hash)) = state.last_finalized {
                if last_hash == hash {
                    return Ok(()); // already finalized — idempotent no-op
                }
            }

            let mut chain = Vec::new();
            let mut cur = hash;
            loop {
                if let Some((_, last_hash)) = state.last_finalized {
                    if cur == last_hash {
                        break;
                    }
                }
                let lease = state
                    .blocks_by_hash
                    .get(&cur)
                    .cloned()
                    .ok_or(EngineError::MissingBlock(hash))?;
                let block_number = lease
                    .block()
                    .block_number()
                    .expect("block reachable via blocks_by_hash is always committed");
                let parent = lease.parent_hash();
                chain.push((cur, block_number, lease));
                if parent == GENESIS_HASH && state.last_finalized.is_none() {
                    break;
                }
                cur = parent;
            }
            chain.reverse(); // oldest first

            if let (Some((last_number, _)), Some(&(_, first_number, _))) =
                (state.last_finalized, chain.first())
            {
                if first_number <= last_number {
                    return Err(EngineError::Internal(anyhow!(
                        "finalize: descending block number {first_number} <= last finalized {last_number}"
                    )));
                }
            }

            if let Some(&(last_hash_in_chain, last_number_in_chain, _)) = chain.last() {
                state.last_finalized = Some((last_number_in_chain, last_hash_in_chain));
            }
            chain
        };

        debug!("blockchain: finalize hash={hash:02x?} queuing {} block(s)", chain.len());

        let tx_guard = self.inner.finalize_tx.lock();
        let tx = tx_guard
            .as_ref()
            .ok_or_else(|| EngineError::Internal(anyhow!("blockchain is shut down")))?;
        for (block_hash, block_number, lease) in chain {
            let mut item = FinalizeItem {
                hash: block_hash,
                block_number,
                lease,
            };
            // Hard spin on a full bounded channel (spec.md §5's intentional
            // back-pressure into block production) rather than blocking on
            // `send`, which would also work but masks the "spin" contract.
            let mut warned = false;
            loop {
                match tx.try_send(item) {
                    Ok(()) => break,
                    Err(crossbeam_channel::TrySendError::Full(back)) => {
                        if !warned {
                            warn!(
                                "blockchain: finalization queue full, spinning on block_number={block_number}"
                            );
                            warned = true;
                        }
                        item = back;
                        std::hint::spin_loop();
                    }
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                        return Err(EngineError::Internal(anyhow!("flusher thread has exited")));
                    }
                }
            }
            crate::metrics::record_block_finalized();
        }
        Ok(())
    }

    /// `dispose_async`: signal the finalization channel as complete (drop
    /// the sender) and join the flusher thread, surfacing any error it
    /// terminated with.
    pub fn shutdown(&self) -> EngineResult<()> {
        info!("blockchain: shutdown requested, closing finalization channel");
        self.inner.finalize_tx.lock().take();
        if let Some(handle) = self.inner.flusher.lock().take() {
            match handle.join() {
                Ok(Ok(())) => {
                    info!("blockchain: flusher thread joined cleanly");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!("blockchain: flusher thread terminated with error: {e:?}");
                    Err(EngineError::Internal(e))
                }
                Err(_) => {
                    error!("blockchain: flusher thread panicked");
                    Err(EngineError::Internal(anyhow!("flusher thread panicked")))
                }
            }
        } else {
            Ok(())
        }
    }
}

fn flusher_loop(inner: Arc<ChainInner>, rx: Receiver<FinalizeItem>) -> Result<()> {
    info!("blockchain: flusher thread started");
    loop {
        let first = match rx.recv() {
            Ok(item) => item,
            Err(_) => {
                info!("blockchain: flusher thread exiting, finalization channel closed");
                return Ok(());
            }
        };

        let mut batch_items = vec![first];
        let deadline = Instant::now() + inner.min_flush_delay;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(item) => batch_items.push(item),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("blockchain: flusher applying {} finalized block(s)", batch_items.len());

        let mut last_number = 0u32;
        for item in &batch_items {
            if let Err(e) = apply_finalized_block(&inner.store, item, inner.hook.as_ref()) {
                error!(
                    "blockchain: flusher failed applying block_number={} hash={:02x?}: {e:?}",
                    item.block_number, item.hash
                );
                return Err(e);
            }
            last_number = item.block_number;

            let mut state = inner.state.lock();
            state.blocks_by_hash.remove(&item.hash);
            if let Some(v) = state.blocks_by_number.get_mut(&item.block_number) {
                v.retain(|h| *h != item.hash);
                if v.is_empty() {
                    state.blocks_by_number.remove(&item.block_number);
                }
            }
            crate::metrics::record_block_flushed();
        }

        if let Err(e) = inner.store.flush() {
            error!("blockchain: flusher's store.flush() failed: {e:?}");
            return Err(e);
        }
        info!("blockchain: flushed up to block_number={last_number}");

        inner.last_flushed.store(last_number, Ordering::Release);
        for listener in inner.listeners.lock().iter() {
            listener(last_number);
        }
    }
}

/// Apply one finalized block's accumulated writes to a fresh writer batch
/// and commit it without flushing (spec.md §4.7's flusher contract: batches
/// commit via `DangerNoFlush`, durability is amortized by one `flush_data()`
/// after the whole ready batch of blocks has been applied).
fn apply_finalized_block(store: &Store, item: &FinalizeItem, hook: &dyn PreCommitHook) -> Result<()> {
    debug!(
        "blockchain: applying block_number={} hash={:02x?} to paged store",
        item.block_number, item.hash
    );
    let block = item.lease.block();
    let mut batch = store.begin_next_batch()?;
    let mut root = batch.root_data_addr();

    for (k, v) in block.state_entries() {
        hook.inspect_before_apply(&k, &v);
        let path = crate::nibble::OwnedNibblePath::from_full_bytes(k);
        root = crate::trie::set(&mut batch, root, &path.as_ref(), &v)?;
        batch.set_root_data_addr(root);
    }
    for (k, v) in block.storage_entries() {
        hook.inspect_before_apply(&k, &v);
        let path = crate::nibble::OwnedNibblePath::from_full_bytes(k);
        root = crate::trie::set(&mut batch, root, &path.as_ref(), &v)?;
        batch.set_root_data_addr(root);
    }
    for (k, v) in block.pre_commit_entries() {
        hook.inspect_before_apply(&k, &v);
        let path = crate::nibble::OwnedNibblePath::from_full_bytes(k);
        root = crate::trie::set(&mut batch, root, &path.as_ref(), &v)?;
        batch.set_root_data_addr(root);
    }
    for account in block.destroyed_accounts() {
        let acct_path = NibblePath::full(&account);
        let acct_key = Key::account(acct_path.clone()).routing_path();
        root = crate::trie::delete_subtree(&mut batch, root, &acct_key.as_ref())?;
        batch.set_root_data_addr(root);
        let storage_prefix = Key::storage_prefix(acct_path);
        root = crate::trie::delete_subtree(&mut batch, root, &storage_prefix.as_ref())?;
        batch.set_root_data_addr(root);
    }

    batch.set_block_info(item.block_number, item.hash);
    batch.commit(CommitOptions::DangerNoFlush)?;
    Ok(())
}

/// A writer overlay for one block under construction (spec.md §6.5). Reads
/// walk this block, then ancestors, then the leased read-only store
/// snapshot; writes accumulate locally until `commit`.
pub struct WorldState {
    chain: Blockchain,
    lease: BlockLease,
}

impl WorldState {
    pub fn parent_hash(&self) -> BlockHash {
        self.lease.parent_hash()
    }

    pub fn get_account(&self, account: [u8; 32]) -> EngineResult<Option<Vec<u8>>> {
        self.lease.block().get_account(account).map_err(EngineError::Internal)
    }

    pub fn set_account(&self, account: [u8; 32], value: &[u8]) -> EngineResult<()> {
        self.lease.block().set_account(account, value).map_err(EngineError::Internal)
    }

    pub fn get_storage(&self, account: [u8; 32], slot: [u8; 32]) -> EngineResult<Option<Vec<u8>>> {
        self.lease
            .block()
            .get_storage(account, slot)
            .map_err(EngineError::Internal)
    }

    pub fn set_storage(&self, account: [u8; 32], slot: [u8; 32], value: &[u8]) -> EngineResult<()> {
        self.lease
            .block()
            .set_storage(account, slot, value)
            .map_err(EngineError::Internal)
    }

    pub fn destroy_account(&self, account: [u8; 32]) -> EngineResult<()> {
        self.lease.block().destroy_account(account).map_err(EngineError::Internal)
    }

    /// `commit(block_number) -> Hash` (spec.md §6.5): runs the pre-commit
    /// hook, publishes the block into the overlay's DAG indices.
    pub fn commit(self, block_number: u32) -> EngineResult<BlockHash> {
        self.chain.commit_block(self.lease, block_number)
    }

    /// `reset()`: discard pending writes, e.g. after a failed pre-commit
    /// hook left the block uncommitted (spec.md §7's failure semantics).
    pub fn reset(&self) -> EngineResult<()> {
        self.lease.block().reset().map_err(EngineError::Internal)
    }
}

/// A read-only overlay view (spec.md §6.5's `ReadOnlyWorldState`):
/// identical ladder as `WorldState` but exposes no mutators.
pub struct ReadOnlyWorldState {
    lease: BlockLease,
}

impl ReadOnlyWorldState {
    pub fn get_account(&self, account: [u8; 32]) -> EngineResult<Option<Vec<u8>>> {
        self.lease.block().get_account(account).map_err(EngineError::Internal)
    }

    pub fn get_storage(&self, account: [u8; 32], slot: [u8; 32]) -> EngineResult<Option<Vec<u8>>> {
        self.lease
            .block()
            .get_storage(account, slot)
            .map_err(EngineError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::time::Duration;

    fn chain(max_pages: u32) -> (Blockchain, Arc<Store>) {
        let store = Arc::new(
            Store::open(
                EngineConfig::default()
                    .with_max_pages(max_pages)
                    .with_min_flush_delay(Duration::from_millis(1)),
            )
            .unwrap(),
        );
        let cfg = EngineConfig::default().with_min_flush_delay(Duration::from_millis(1));
        let bc = Blockchain::open(Arc::clone(&store), &cfg, Arc::new(NoopPreCommit));
        (bc, store)
    }

    fn wait_flushed(bc: &Blockchain, at_least: u32) {
        for _ in 0..2000 {
            if bc.flushed_block_number() >= at_least {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for flush to reach block {at_least}");
    }

    #[test]
    fn commit_then_finalize_then_flush_is_visible_on_reopen() {
        let (bc, _store) = chain(4096);
        let ws = bc.start_new(GENESIS_HASH).unwrap();
        ws.set_account([7u8; 32], b"balance=10").unwrap();
        let hash = ws.commit(1).unwrap();
        bc.finalize(hash).unwrap();
        wait_flushed(&bc, 1);
        bc.shutdown().unwrap();

        let ro = _store.begin_read_only_batch().unwrap();
        let acct = [7u8; 32];
        let key = Key::account(NibblePath::full(&acct));
        let path = key.routing_path();
        let got = crate::trie::try_get(&ro, ro.root_data_addr(), &path.as_ref()).unwrap();
        assert_eq!(got, Some(b"balance=10".to_vec()));
    }

    #[test]
    fn sibling_blocks_see_independent_state_s2() {
        let (bc, _store) = chain(4096);
        let ws1 = bc.start_new(GENESIS_HASH).unwrap();
        let b1 = ws1.commit(1).unwrap();

        let ws2 = bc.start_new(b1).unwrap();
        ws2.set_account([1u8; 32], b"balance=10").unwrap();
        let b2 = ws2.commit(2).unwrap();

        bc.finalize(b1).unwrap();

        let on_b2 = bc.start_new(b2).unwrap();
        assert_eq!(on_b2.get_account([1u8; 32]).unwrap(), Some(b"balance=10".to_vec()));

        let on_b1 = bc.start_new(b1).unwrap();
        assert_eq!(on_b1.get_account([1u8; 32]).unwrap(), None);
        bc.shutdown().unwrap();
    }

    #[test]
    fn destroy_shadows_but_sibling_unaffected_s3() {
        let (bc, _store) = chain(4096);
        let ws0 = bc.start_new(GENESIS_HASH).unwrap();
        ws0.set_account([5u8; 32], b"balance=5").unwrap();
        let b0 = ws0.commit(1).unwrap();
        bc.finalize(b0).unwrap();
        wait_flushed(&bc, 1);

        let wsa = bc.start_new(b0).unwrap();
        wsa.destroy_account([5u8; 32]).unwrap();
        assert_eq!(wsa.get_account([5u8; 32]).unwrap(), None);

        let wsb = bc.start_new(b0).unwrap();
        assert_eq!(wsb.get_account([5u8; 32]).unwrap(), Some(b"balance=5".to_vec()));
        bc.shutdown().unwrap();
    }

    #[test]
    fn missing_parent_is_rejected() {
        let (bc, _store) = chain(256);
        let err = bc.start_new([0xFFu8; 32]).unwrap_err();
        assert!(matches!(err, EngineError::MissingParent(_)));
        bc.shutdown().unwrap();
    }

    #[test]
    fn finalize_unknown_hash_is_rejected() {
        let (bc, _store) = chain(256);
        let err = bc.finalize([0xAAu8; 32]).unwrap_err();
        assert!(matches!(err, EngineError::MissingBlock(_)));
        bc.shutdown().unwrap();
    }

    #[test]
    fn double_commit_is_rejected() {
        let (bc, _store) = chain(256);
        let ws = bc.start_new(GENESIS_HASH).unwrap();
        let lease_clone = ws.lease.clone();
        let _hash = ws.commit(1).unwrap();
        let err = bc.commit_block(lease_clone, 1).unwrap_err();
        assert!(matches!(err, EngineError::DoubleCommit(_)));
        bc.shutdown().unwrap();
    }

    #[test]
    fn finalize_is_idempotent() {
        let (bc, _store) = chain(4096);
        let ws = bc.start_new(GENESIS_HASH).unwrap();
        let hash = ws.commit(1).unwrap();
        bc.finalize(hash).unwrap();
        bc.finalize(hash).unwrap(); // second call is a no-op, not an error
        wait_flushed(&bc, 1);
        bc.shutdown().unwrap();
    }
}
