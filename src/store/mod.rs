//! The paged store (spec.md §4.2): N metadata headers, a root-counter page,
//! and copy-on-write writer batches.
//!
//! Grounded in the teacher crate's directory/free-list idioms (`dir.rs`,
//! `free/mod.rs` — bucket-head-style indirection and a push/pop free list)
//! but restructured around spec.md §6.1's on-disk layout: page 0 is the
//! root counter, pages `1..=H` are metadata slots, and the abandoned-page
//! list lives inline in each metadata page rather than in its own file.

mod batch;
mod meta;

pub use batch::{Batch, CommitOptions, PageSource, ReadOnlyBatch};
pub use meta::Metadata;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::pager::{first_data_addr, first_metadata_addr, Pager, ROOT_PAGE_ADDR};

/// The store's internal, lock-protected state: the pager and the current
/// root counter. `Arc`-shared so `ReadOnlyBatch` handles can outlive the
/// `Store` value they were created from (spec.md §3's "reference-counted
/// so concurrent readers hold it alive past the writer's advance").
pub(crate) struct Inner {
    pub(crate) pager: Mutex<Pager>,
    pub(crate) history_depth: u16,
    pub(crate) max_pages: u32,
    /// Mirrors the on-disk root counter; bumped only on commit.
    pub(crate) counter: AtomicU64,
    /// Enforces "one writer batch at a time" (spec.md §5) without a lock
    /// that a forgetful caller could deadlock on: `begin_next_batch` does a
    /// compare-exchange and a dropped `Batch` clears the flag.
    pub(crate) writer_active: AtomicBool,
}

pub struct Store {
    pub(crate) inner: Arc<Inner>,
}

impl Store {
    /// `open(path, options) -> Store` (spec.md §6.5). `path = None` opens an
    /// anonymous, non-durable store (used by tests and pure in-memory use).
    pub fn open(config: EngineConfig) -> Result<Self> {
        let history_depth = config.history_depth;
        if history_depth < 2 {
            return Err(anyhow!("history_depth must be >= 2"));
        }
        let max_pages = config.max_pages;
        if max_pages <= first_data_addr(history_depth) {
            return Err(anyhow!("max_pages too small for history_depth={history_depth}"));
        }

        let mut pager = match &config.path {
            Some(p) => Pager::open_file(p, max_pages)?,
            None => Pager::open_anon(max_pages)?,
        };

        let counter = Self::recover_counter(&mut pager, history_depth)?;
        info!(
            "store: opened history_depth={history_depth} max_pages={max_pages} counter={counter}"
        );

        Ok(Store {
            inner: Arc::new(Inner {
                pager: Mutex::new(pager),
                history_depth,
                max_pages,
                counter: AtomicU64::new(counter),
                writer_active: AtomicBool::new(false),
            }),
        })
    }

    pub fn open_path(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Self::open(config.with_path(path.as_ref().to_path_buf()))
    }

    /// Crash recovery (spec.md §6.1): read page 0's counter; validate the
    /// metadata it selects; if invalid, fall back one slot.
    fn recover_counter(pager: &mut Pager, history_depth: u16) -> Result<u64> {
        let root = pager.page_at(ROOT_PAGE_ADDR)?;
        let counter = meta::read_root_counter(root);
        if counter == 0 {
            // Fresh store: initialize metadata slot 0 as an empty trie.
            Self::init_fresh(pager, history_depth)?;
            return Ok(0);
        }
        let idx = (counter % history_depth as u64) as u32;
        let addr = first_metadata_addr() + idx;
        let page = pager.page_at(addr)?;
        match meta::Metadata::read(page) {
            Ok(m) if m.root_data_page < pager.max_pages() => Ok(counter),
            _ => {
                let fallback = counter.saturating_sub(1);
                warn!(
                    "store: metadata slot {idx} for counter {counter} failed validation, \
                     falling back to counter={fallback}"
                );
                Ok(fallback)
            }
        }
    }

    fn init_fresh(pager: &mut Pager, history_depth: u16) -> Result<()> {
        info!("store: initializing fresh store at counter=0");
        let data_addr = first_data_addr(history_depth);
        {
            let page = pager.page_at_mut(data_addr)?;
            crate::trie::init_data_page(page, 0);
        }
        let m = Metadata {
            next_free_page: data_addr + 1,
            root_data_page: data_addr,
            block_number: 0,
            block_hash: [0u8; 32],
            abandoned: Vec::new(),
        };
        {
            let addr = first_metadata_addr();
            let page = pager.page_at_mut(addr)?;
            m.write(page, 0);
        }
        {
            let root = pager.page_at_mut(ROOT_PAGE_ADDR)?;
            meta::write_root_counter(root, 0);
        }
        pager.flush_data()?;
        pager.flush_root()?;
        Ok(())
    }

    pub fn history_depth(&self) -> u16 {
        self.inner.history_depth
    }

    pub fn max_pages(&self) -> u32 {
        self.inner.max_pages
    }

    pub fn current_counter(&self) -> u64 {
        self.inner.counter.load(Ordering::Acquire)
    }

    /// `Store.has_state(hash) -> bool`. The core store only knows about
    /// roots by counter/number, not by hash (hashes are a blockchain-overlay
    /// concept); this checks whether `block_number` is within the window of
    /// metadata slots still physically present.
    pub fn has_block_number(&self, block_number: u32) -> bool {
        let counter = self.current_counter();
        let depth = self.inner.history_depth as u64;
        counter.saturating_sub(block_number as u64) < depth
    }

    /// `Store.begin_next_batch() -> Batch` — at most one live at a time.
    pub fn begin_next_batch(&self) -> Result<Batch<'_>> {
        if self
            .inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(anyhow!("a writer batch is already active"));
        }
        match Batch::open(&self.inner) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                self.inner.writer_active.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// `Store.begin_read_only_batch(name?) -> ReadOnlyBatch` — snapshot of
    /// the current root.
    pub fn begin_read_only_batch(&self) -> Result<ReadOnlyBatch> {
        ReadOnlyBatch::open_current(Arc::clone(&self.inner))
    }

    /// `Store.begin_read_only_batch_or_latest(state_hash, name?)`. The core
    /// store has no hash index (that's the blockchain overlay's job), so
    /// this always opens the latest root; the overlay layer is responsible
    /// for routing by hash before falling back here.
    pub fn begin_read_only_batch_or_latest(&self) -> Result<ReadOnlyBatch> {
        self.begin_read_only_batch()
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.pager.lock().flush_data().context("flush()")
    }

    pub fn force_flush(&self) -> Result<()> {
        let mut pager = self.inner.pager.lock();
        pager.flush_data()?;
        pager.flush_root()
    }

    /// Snapshot of the process-wide engine counters (`crate::metrics`),
    /// mirroring the teacher crate's `Db::metrics()` / `metrics::snapshot()`
    /// pairing. The counters are global, not per-`Store`, since a process
    /// hosts at most one `Store` in practice (spec.md §9's "one `Store` per
    /// database; no process-wide singletons" refers to state, not counters).
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        crate::metrics::snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_starts_at_counter_zero_with_empty_root() {
        let store = Store::open(EngineConfig::default().with_max_pages(64)).unwrap();
        assert_eq!(store.current_counter(), 0);
    }

    #[test]
    fn only_one_writer_batch_may_be_active() {
        let store = Store::open(EngineConfig::default().with_max_pages(64)).unwrap();
        let b1 = store.begin_next_batch().unwrap();
        assert!(store.begin_next_batch().is_err());
        drop(b1);
        assert!(store.begin_next_batch().is_ok());
    }
}
