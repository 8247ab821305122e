//! Pre-commit hook interface (SPEC_FULL.md §4.9, grounded in spec.md §9's
//! "Pre-commit hook as an interface abstraction").
//!
//! spec.md treats Merkle root computation as an external collaborator;
//! this module ships the shape of the interface it plugs into plus a
//! deterministic no-op implementation so the engine is runnable end to end
//! without a real Merkle tree, the way the teacher crate ships a
//! pass-through codec next to its pluggable compression backends.

use std::hash::Hasher;
use twox_hash::XxHash64;

use super::block_state::BlockState;
use super::BlockHash;
use crate::nibble::Key;

/// A commit-like view over one block's pending writes, handed to a
/// [`PreCommitHook`] at commit time. Exposes `get`/`set`/`visit`/
/// `get_child` per spec.md §9 — `set` writes into the block's `_pre_commit`
/// dictionary (so later reads through the normal ladder see hook-rewritten
/// values), `visit` walks every `_state`/`_storage` entry written so far,
/// and `get_child` returns a view over the same block (this core has no
/// separate child-commit concept; a real Merkle hook would use it to
/// recurse into sub-tries).
pub struct CommitView<'a> {
    block: &'a BlockState,
}

impl<'a> CommitView<'a> {
    pub(crate) fn new(block: &'a BlockState) -> Self {
        CommitView { block }
    }

    pub fn get(&self, key: &Key) -> Option<Vec<u8>> {
        self.block.get_local_raw(key)
    }

    pub fn set(&self, key: &Key, value: &[u8]) {
        self.block.set_pre_commit_raw(key, value);
    }

    pub fn visit(&self, mut f: impl FnMut(&[u8], &[u8])) {
        for (k, v) in self.block.written_entries() {
            f(&k, &v);
        }
    }

    pub fn get_child(&self) -> CommitView<'a> {
        CommitView { block: self.block }
    }
}

/// Computes the hash that names a committed block.
pub trait PreCommitHook: Send + Sync {
    fn compute_hash(&self, view: &CommitView) -> BlockHash;

    /// Observability hook the flusher calls once per entry as it applies a
    /// finalized block to the paged store. No-op by default; a real Merkle
    /// hook might use this to recompute proofs incrementally.
    fn inspect_before_apply(&self, _key: &[u8], _value: &[u8]) {}
}

/// Deterministic identity hash over the block's destroyed-account set and
/// written keys/values, used when no real Merkle implementation is plugged
/// in. Not cryptographically meaningful; exists so the engine is testable
/// end to end without one.
pub struct NoopPreCommit;

impl PreCommitHook for NoopPreCommit {
    fn compute_hash(&self, view: &CommitView) -> BlockHash {
        let mut hasher = XxHash64::with_seed(0xA5A5_A5A5_A5A5_A5A5);
        view.visit(|k, v| {
            hasher.write(k);
            hasher.write(v);
        });
        for account in view.block.destroyed_accounts() {
            hasher.write(&account);
            hasher.write(b"destroyed");
        }
        hasher.write(&view.block.parent_hash());
        let h = hasher.finish();
        let mut out = [0u8; 32];
        out[0..8].copy_from_slice(&h.to_le_bytes());
        out[8..16].copy_from_slice(&h.rotate_left(17).to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block_state::BlockState;
    use crate::config::EngineConfig;
    use crate::pool::BufferPool;
    use crate::store::Store;
    use std::sync::Arc;

    #[test]
    fn noop_hash_is_deterministic_for_same_writes() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let pool = Arc::new(BufferPool::with_leak_check(true));
        let ro = store.begin_read_only_batch().unwrap();
        let (state1, _lease1) =
            BlockState::new([0u8; 32], Vec::new(), ro.clone(), Arc::clone(&pool), 10, 2);
        state1.set_account([1u8; 32], b"v").unwrap();
        let ro2 = store.begin_read_only_batch().unwrap();
        let (state2, _lease2) = BlockState::new([0u8; 32], Vec::new(), ro2, Arc::clone(&pool), 10, 2);
        state2.set_account([1u8; 32], b"v").unwrap();

        let h1 = NoopPreCommit.compute_hash(&CommitView::new(&state1));
        let h2 = NoopPreCommit.compute_hash(&CommitView::new(&state2));
        assert_eq!(h1, h2);
    }
}
