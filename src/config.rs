//! Engine configuration: fixed page geometry, history depth and finalization/flush tuning.
//!
//! Mirrors the teacher crate's `QuiverConfig`: a plain struct with `Default`,
//! a fluent `with_*` builder, and a `from_env()` constructor that layers
//! `PAPRIKA_*` environment overrides on top of the defaults. Kept separate
//! from `CommitOptions` (see `crate::store::CommitOptions`), which is a
//! per-commit choice rather than a store-wide setting.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Fixed page size. The spec fixes this at 4 KiB; it is not configurable
/// because slot offsets, the 12-bit `item_address` field and the metadata
/// page layout all assume it.
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the backing file. `None` selects an anonymous (in-memory)
    /// mapping, used by tests and by `DangerNoWrite`-only stores.
    pub path: Option<PathBuf>,
    /// Initial/maximum size of the mapped region, in pages. The region is
    /// fixed-size for the lifetime of the store (see spec.md §4.1).
    pub max_pages: u32,
    /// Number of metadata slots (`H`). Must be ≥ 2 so the writer never
    /// overwrites the metadata a concurrent reader is using.
    pub history_depth: u16,
    /// Upper bound on the finalization channel; `None` means unbounded.
    pub finalization_queue_limit: Option<usize>,
    /// Minimum delay the flusher waits between batches of finalized blocks,
    /// used to coalesce many quick finalizations into one fsync.
    pub min_flush_delay: Duration,
    /// Per-block cache budget defaults (see `crate::blockchain::CacheBudget`).
    pub cache_entries_per_block: i64,
    pub cache_from_depth: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            path: None,
            max_pages: 1 << 20, // 4 GiB region at 4 KiB pages
            history_depth: 16,
            finalization_queue_limit: Some(4096),
            min_flush_delay: Duration::from_millis(50),
            cache_entries_per_block: 10_000,
            cache_from_depth: 2,
        }
    }
}

impl EngineConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_history_depth(mut self, depth: u16) -> Self {
        assert!(depth >= 2, "history_depth must be >= 2");
        self.history_depth = depth;
        self
    }

    pub fn with_finalization_queue_limit(mut self, limit: Option<usize>) -> Self {
        self.finalization_queue_limit = limit;
        self
    }

    pub fn with_min_flush_delay(mut self, delay: Duration) -> Self {
        self.min_flush_delay = delay;
        self
    }

    pub fn with_cache_budget(mut self, entries_per_block: i64, cache_from_depth: u8) -> Self {
        self.cache_entries_per_block = entries_per_block;
        self.cache_from_depth = cache_from_depth;
        self
    }

    /// Layer `PAPRIKA_*` environment overrides on top of `Default::default()`,
    /// matching the teacher crate's `QuiverConfig::from_env()` convention.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        if let Ok(v) = env::var("PAPRIKA_PATH") {
            cfg.path = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("PAPRIKA_MAX_PAGES") {
            if let Ok(n) = v.parse() {
                cfg.max_pages = n;
            }
        }
        if let Ok(v) = env::var("PAPRIKA_HISTORY_DEPTH") {
            if let Ok(n) = v.parse::<u16>() {
                if n >= 2 {
                    cfg.history_depth = n;
                }
            }
        }
        if let Ok(v) = env::var("PAPRIKA_FINALIZATION_QUEUE_LIMIT") {
            cfg.finalization_queue_limit = if v == "unbounded" {
                None
            } else {
                v.parse().ok()
            };
        }
        if let Ok(v) = env::var("PAPRIKA_MIN_FLUSH_DELAY_MS") {
            if let Ok(ms) = v.parse() {
                cfg.min_flush_delay = Duration::from_millis(ms);
            }
        }
        cfg
    }
}
