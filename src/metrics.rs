//! Process-wide atomic counters, mirroring the teacher crate's `metrics.rs`:
//! a flat set of `AtomicU64`s grouped by subsystem plus a `snapshot()`/
//! `reset()` pair. The export format (HTTP/Prometheus) is out of scope —
//! these counters are just the ambient in-process instrumentation.

use std::sync::atomic::{AtomicU64, Ordering};

static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PAGES_ABANDONED: AtomicU64 = AtomicU64::new(0);
static PAGES_REUSED: AtomicU64 = AtomicU64::new(0);
static BATCH_COMMITS: AtomicU64 = AtomicU64::new(0);
static ROOT_FLUSHES: AtomicU64 = AtomicU64::new(0);
static DATA_FLUSHES: AtomicU64 = AtomicU64::new(0);

static SLOTTED_INSERTS: AtomicU64 = AtomicU64::new(0);
static SLOTTED_DELETES: AtomicU64 = AtomicU64::new(0);
static SLOTTED_DEFRAGMENTS: AtomicU64 = AtomicU64::new(0);

static TRIE_CHILD_SPILLS: AtomicU64 = AtomicU64::new(0);

static SPAN_DICT_APPENDS: AtomicU64 = AtomicU64::new(0);
static SPAN_DICT_INPLACE_UPDATES: AtomicU64 = AtomicU64::new(0);
static SPAN_DICT_TOMBSTONES: AtomicU64 = AtomicU64::new(0);

static BLOCKS_STARTED: AtomicU64 = AtomicU64::new(0);
static BLOCKS_COMMITTED: AtomicU64 = AtomicU64::new(0);
static BLOCKS_FINALIZED: AtomicU64 = AtomicU64::new(0);
static BLOCKS_FLUSHED: AtomicU64 = AtomicU64::new(0);
static FILTER_TESTS: AtomicU64 = AtomicU64::new(0);
static FILTER_NEGATIVES: AtomicU64 = AtomicU64::new(0);

// Explicit record_* fns (kept simple and grep-able, as in the teacher crate).
pub fn record_page_allocated() {
    PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_page_abandoned() {
    PAGES_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_page_reused() {
    PAGES_REUSED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_batch_commit() {
    BATCH_COMMITS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_root_flush() {
    ROOT_FLUSHES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_data_flush() {
    DATA_FLUSHES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_slotted_insert() {
    SLOTTED_INSERTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_slotted_delete() {
    SLOTTED_DELETES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_slotted_defragment() {
    SLOTTED_DEFRAGMENTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_trie_child_spill() {
    TRIE_CHILD_SPILLS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_span_dict_append() {
    SPAN_DICT_APPENDS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_span_dict_inplace_update() {
    SPAN_DICT_INPLACE_UPDATES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_span_dict_tombstone() {
    SPAN_DICT_TOMBSTONES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_block_started() {
    BLOCKS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_block_committed() {
    BLOCKS_COMMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_block_finalized() {
    BLOCKS_FINALIZED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_block_flushed() {
    BLOCKS_FLUSHED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_filter_test(negative: bool) {
    FILTER_TESTS.fetch_add(1, Ordering::Relaxed);
    if negative {
        FILTER_NEGATIVES.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub pages_allocated: u64,
    pub pages_abandoned: u64,
    pub pages_reused: u64,
    pub batch_commits: u64,
    pub root_flushes: u64,
    pub data_flushes: u64,
    pub slotted_inserts: u64,
    pub slotted_deletes: u64,
    pub slotted_defragments: u64,
    pub trie_child_spills: u64,
    pub span_dict_appends: u64,
    pub span_dict_inplace_updates: u64,
    pub span_dict_tombstones: u64,
    pub blocks_started: u64,
    pub blocks_committed: u64,
    pub blocks_finalized: u64,
    pub blocks_flushed: u64,
    pub filter_tests: u64,
    pub filter_negatives: u64,
}

impl MetricsSnapshot {
    /// Fraction of filter tests that returned "definitely absent", i.e. how
    /// much read work the bloom/XOR filter saved.
    pub fn filter_negative_ratio(&self) -> f64 {
        if self.filter_tests == 0 {
            0.0
        } else {
            self.filter_negatives as f64 / self.filter_tests as f64
        }
    }
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        pages_allocated: PAGES_ALLOCATED.load(Ordering::Relaxed),
        pages_abandoned: PAGES_ABANDONED.load(Ordering::Relaxed),
        pages_reused: PAGES_REUSED.load(Ordering::Relaxed),
        batch_commits: BATCH_COMMITS.load(Ordering::Relaxed),
        root_flushes: ROOT_FLUSHES.load(Ordering::Relaxed),
        data_flushes: DATA_FLUSHES.load(Ordering::Relaxed),
        slotted_inserts: SLOTTED_INSERTS.load(Ordering::Relaxed),
        slotted_deletes: SLOTTED_DELETES.load(Ordering::Relaxed),
        slotted_defragments: SLOTTED_DEFRAGMENTS.load(Ordering::Relaxed),
        trie_child_spills: TRIE_CHILD_SPILLS.load(Ordering::Relaxed),
        span_dict_appends: SPAN_DICT_APPENDS.load(Ordering::Relaxed),
        span_dict_inplace_updates: SPAN_DICT_INPLACE_UPDATES.load(Ordering::Relaxed),
        span_dict_tombstones: SPAN_DICT_TOMBSTONES.load(Ordering::Relaxed),
        blocks_started: BLOCKS_STARTED.load(Ordering::Relaxed),
        blocks_committed: BLOCKS_COMMITTED.load(Ordering::Relaxed),
        blocks_finalized: BLOCKS_FINALIZED.load(Ordering::Relaxed),
        blocks_flushed: BLOCKS_FLUSHED.load(Ordering::Relaxed),
        filter_tests: FILTER_TESTS.load(Ordering::Relaxed),
        filter_negatives: FILTER_NEGATIVES.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    for c in [
        &PAGES_ALLOCATED,
        &PAGES_ABANDONED,
        &PAGES_REUSED,
        &BATCH_COMMITS,
        &ROOT_FLUSHES,
        &DATA_FLUSHES,
        &SLOTTED_INSERTS,
        &SLOTTED_DELETES,
        &SLOTTED_DEFRAGMENTS,
        &TRIE_CHILD_SPILLS,
        &SPAN_DICT_APPENDS,
        &SPAN_DICT_INPLACE_UPDATES,
        &SPAN_DICT_TOMBSTONES,
        &BLOCKS_STARTED,
        &BLOCKS_COMMITTED,
        &BLOCKS_FINALIZED,
        &BLOCKS_FLUSHED,
        &FILTER_TESTS,
        &FILTER_NEGATIVES,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}
