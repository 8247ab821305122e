//! Writer batches and read-only snapshots over the paged store (spec.md §4.2).
//!
//! Pages are modeled as opaque `u32` addresses plus owned, page-sized byte
//! buffers (per Design Notes §9: "model pages as opaque handles ... never
//! leak raw pointers across component boundaries"). Every accessor takes
//! only a brief lock on the shared `Pager` to copy bytes in or out, so a
//! long-lived `Batch` never blocks concurrent `ReadOnlyBatch` readers.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::page::{init_page, set_page_batch_id, PAGE_SIZE};
use crate::pager::first_metadata_addr;

use super::meta::Metadata;
use super::Inner;

/// How durably a batch's pages and new root should be persisted
/// (spec.md §4.2's commit protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOptions {
    /// `flush_data()` only — durable data, but the root update itself may
    /// be lost on crash (the old root stays valid and consistent).
    FlushDataOnly,
    /// `flush_data()` then `flush_root()` — fully durable.
    FlushDataAndRoot,
    /// No flush at all; used when the caller (the flusher) will bulk-flush
    /// later. The new root is live in memory for subsequent readers
    /// immediately, but not fsynced.
    DangerNoFlush,
    /// Test mode: identical to `DangerNoFlush` (this store never leaves the
    /// address space anyway unless file-backed and explicitly flushed).
    DangerNoWrite,
}

/// A minimal read interface shared by `Batch` and `ReadOnlyBatch`, used by
/// the trie layer's read path so it doesn't need to care which kind of
/// batch it is walking.
pub trait PageSource {
    fn read_page(&self, addr: u32) -> Result<Vec<u8>>;
    fn root_data_addr(&self) -> u32;
}

/// A writer transaction against the paged store using copy-on-write.
pub struct Batch<'s> {
    inner: &'s Inner,
    /// Root counter value this batch will become if it commits.
    batch_id: u32,
    next_meta_slot: u32,
    meta: Metadata,
    root_data_addr: u32,
    dirtied: HashSet<u32>,
    newly_abandoned: Vec<(u32, u32)>,
    reclaimable: Vec<u32>,
    done: bool,
}

impl<'s> Batch<'s> {
    pub(crate) fn open(inner: &'s Inner) -> Result<Self> {
        let history_depth = inner.history_depth as u64;
        let counter = inner.counter.load(Ordering::Acquire);
        let cur_slot = (counter % history_depth) as u32;
        let next_slot = ((counter + 1) % history_depth) as u32;
        let batch_id = (counter + 1) as u32;

        let mut pager = inner.pager.lock();
        let cur_addr = first_metadata_addr() + cur_slot;
        let cur_meta = Metadata::read(pager.page_at(cur_addr)?)?;

        // The slot we're about to overwrite held metadata from generation
        // `counter + 1 - history_depth`, which is by construction at least
        // `history_depth` generations old — every page it abandoned is safe
        // to reclaim now (spec.md §3's allocate invariant).
        let next_addr = first_metadata_addr() + next_slot;
        let reclaimable = if counter + 1 >= history_depth {
            Metadata::read(pager.page_at(next_addr)?)
                .map(|m| m.abandoned.into_iter().map(|(addr, _)| addr).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        // Copy-on-write the current root data page into a fresh page.
        let new_root_addr = cur_meta.next_free_page;
        if new_root_addr >= pager.max_pages() {
            return Err(anyhow!("store full: cannot allocate COW root data page"));
        }
        {
            let src = pager.page_at(cur_meta.root_data_page)?.to_vec();
            let dst = pager.page_at_mut(new_root_addr)?;
            dst.copy_from_slice(&src);
            set_page_batch_id(dst, batch_id);
        }
        crate::metrics::record_page_allocated();

        let mut dirtied = HashSet::new();
        dirtied.insert(new_root_addr);

        let meta = Metadata {
            next_free_page: new_root_addr + 1,
            root_data_page: new_root_addr,
            block_number: cur_meta.block_number,
            block_hash: cur_meta.block_hash,
            abandoned: Vec::new(),
        };

        Ok(Batch {
            inner,
            batch_id,
            next_meta_slot: next_slot,
            meta,
            root_data_addr: new_root_addr,
            dirtied,
            newly_abandoned: Vec::new(),
            reclaimable,
            done: false,
        })
    }

    pub fn root_data_addr(&self) -> u32 {
        self.root_data_addr
    }

    pub fn set_root_data_addr(&mut self, addr: u32) {
        self.root_data_addr = addr;
        self.meta.root_data_page = addr;
    }

    pub fn set_block_info(&mut self, block_number: u32, hash: [u8; 32]) {
        self.meta.block_number = block_number;
        self.meta.block_hash = hash;
    }

    /// `get_at(addr) -> Page`.
    pub fn get_at(&self, addr: u32) -> Result<Vec<u8>> {
        Ok(self.inner.pager.lock().page_at(addr)?.to_vec())
    }

    /// `get_new_dirty_page() -> (Page, addr)`.
    pub fn get_new_dirty_page(&mut self) -> Result<(u32, Vec<u8>)> {
        let addr = self.allocate()?;
        let mut pager = self.inner.pager.lock();
        let page = pager.page_at_mut(addr)?;
        init_page(page, self.batch_id, 0, 0);
        self.dirtied.insert(addr);
        Ok((addr, page.to_vec()))
    }

    /// `get_writable_copy(page) -> (Page, addr)`: if already dirtied by this
    /// batch, return as-is; else COW a fresh page and schedule `addr` for
    /// abandonment.
    pub fn get_writable_copy(&mut self, addr: u32) -> Result<(u32, Vec<u8>)> {
        if self.dirtied.contains(&addr) {
            return Ok((addr, self.get_at(addr)?));
        }
        let new_addr = self.allocate()?;
        let mut pager = self.inner.pager.lock();
        let src = pager.page_at(addr)?.to_vec();
        let dst = pager.page_at_mut(new_addr)?;
        dst.copy_from_slice(&src);
        set_page_batch_id(dst, self.batch_id);
        self.dirtied.insert(new_addr);
        drop(pager);
        self.abandon(addr);
        Ok((new_addr, src))
    }

    /// Persist a buffer previously obtained from `get_new_dirty_page` or
    /// `get_writable_copy` back to its page.
    pub fn write_back(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if !self.dirtied.contains(&addr) {
            return Err(anyhow!(
                "write_back({addr}): page not owned by this batch (COW violation)"
            ));
        }
        if bytes.len() != PAGE_SIZE {
            return Err(anyhow!("write_back: buffer size {} != PAGE_SIZE", bytes.len()));
        }
        let mut pager = self.inner.pager.lock();
        let dst = pager.page_at_mut(addr)?;
        dst.copy_from_slice(bytes);
        set_page_batch_id(dst, self.batch_id);
        Ok(())
    }

    /// `abandon(page)` — push `addr` into the next metadata's abandoned list.
    pub fn abandon(&mut self, addr: u32) {
        self.newly_abandoned.push((addr, self.batch_id));
        crate::metrics::record_page_abandoned();
    }

    fn allocate(&mut self) -> Result<u32> {
        if let Some(addr) = self.reclaimable.pop() {
            crate::metrics::record_page_reused();
            return Ok(addr);
        }
        let addr = self.meta.next_free_page;
        if addr >= self.inner.max_pages {
            return Err(anyhow!("store full: no free page available within max_page"));
        }
        self.meta.next_free_page += 1;
        crate::metrics::record_page_allocated();
        Ok(addr)
    }

    /// `commit(options)` (spec.md §4.2).
    pub fn commit(mut self, options: CommitOptions) -> Result<u64> {
        self.meta.abandoned = std::mem::take(&mut self.newly_abandoned)
            .into_iter()
            .take(super::meta::MAX_ABANDONED_ENTRIES)
            .collect();

        let meta_addr = first_metadata_addr() + self.next_meta_slot;
        {
            let mut pager = self.inner.pager.lock();
            let page = pager.page_at_mut(meta_addr)?;
            self.meta.write(page, self.batch_id);

            let root_addr = crate::pager::ROOT_PAGE_ADDR;
            let root_page = pager.page_at_mut(root_addr)?;
            super::meta::write_root_counter(root_page, self.batch_id as u64);

            match options {
                CommitOptions::FlushDataOnly => {
                    pager.flush_data()?;
                }
                CommitOptions::FlushDataAndRoot => {
                    pager.flush_data()?;
                    pager.flush_root()?;
                }
                CommitOptions::DangerNoFlush | CommitOptions::DangerNoWrite => {}
            }
        }

        crate::metrics::record_batch_commit();
        self.inner.counter.store(self.batch_id as u64, Ordering::Release);
        self.done = true;
        self.inner.writer_active.store(false, Ordering::Release);
        Ok(self.batch_id as u64)
    }
}

impl<'s> Drop for Batch<'s> {
    fn drop(&mut self) {
        if !self.done {
            // Abort: counter never advances, pages dirtied here stay
            // unreferenced by any metadata and are simply wasted space
            // (never returned to the free list, matching "fatal to the
            // batch, not the store").
            self.inner.writer_active.store(false, Ordering::Release);
        }
    }
}

impl<'s> PageSource for Batch<'s> {
    fn read_page(&self, addr: u32) -> Result<Vec<u8>> {
        self.get_at(addr)
    }
    fn root_data_addr(&self) -> u32 {
        self.root_data_addr
    }
}

/// A reference-counted snapshot view of the store's pages at a particular
/// root (spec.md §3's "Read-Only Batch").
#[derive(Clone)]
pub struct ReadOnlyBatch {
    inner: Arc<Inner>,
    root_data_addr: u32,
    pub block_number: u32,
    pub block_hash: [u8; 32],
    pub counter: u64,
}

impl ReadOnlyBatch {
    pub(crate) fn open_current(inner: Arc<Inner>) -> Result<Self> {
        let history_depth = inner.history_depth as u64;
        let counter = inner.counter.load(Ordering::Acquire);
        let slot = (counter % history_depth) as u32;
        let addr = first_metadata_addr() + slot;
        let pager = inner.pager.lock();
        let meta = Metadata::read(pager.page_at(addr)?)?;
        drop(pager);
        Ok(ReadOnlyBatch {
            inner,
            root_data_addr: meta.root_data_page,
            block_number: meta.block_number,
            block_hash: meta.block_hash,
            counter,
        })
    }

    /// Whether `addr`'s page is still guaranteed present given the store's
    /// *current* counter (i.e. this snapshot has not fallen outside the
    /// history horizon and had its pages reclaimed).
    pub fn is_within_horizon(&self) -> bool {
        let cur = self.inner.counter.load(Ordering::Acquire);
        cur.saturating_sub(self.counter) < self.inner.history_depth as u64
    }
}

impl PageSource for ReadOnlyBatch {
    fn read_page(&self, addr: u32) -> Result<Vec<u8>> {
        Ok(self.inner.pager.lock().page_at(addr)?.to_vec())
    }
    fn root_data_addr(&self) -> u32 {
        self.root_data_addr
    }
}
