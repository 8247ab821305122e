//! Public error taxonomy for the engine boundary (`Store`, `Blockchain`, `WorldState`).
//!
//! Internal plumbing (pager, slotted array, span dictionary) keeps returning
//! `anyhow::Result` the way low-level page code always has; this module is
//! only the narrow, semantic surface callers are meant to match on.

use thiserror::Error;

/// Semantic error kinds surfaced across the public API.
///
/// Per the propagation policy: the blockchain overlay only ever hands a
/// caller `MissingParent`, `MissingBlock`, `DoubleCommit` or `IoError`.
/// Everything else (`StoreFull`, `AddressOutOfRange`, `StateMismatch`) is
/// either fatal-to-the-batch or a debug-only invariant check and is wrapped
/// into `Io`/`Internal` once it crosses the boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store is full: no free page available within max_page")]
    StoreFull,

    #[error("address {addr} out of range (max_page={max_page})")]
    AddressOutOfRange { addr: u32, max_page: u32 },

    #[error("missing parent block {0:?}")]
    MissingParent(crate::blockchain::BlockHash),

    #[error("missing block {0:?}")]
    MissingBlock(crate::blockchain::BlockHash),

    #[error("block {0:?} already committed")]
    DoubleCommit(crate::blockchain::BlockHash),

    #[error("state mismatch: overlay and store disagree after apply (debug assertion)")]
    StateMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
