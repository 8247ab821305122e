//! Paprika: a copy-on-write, page-addressable key-value storage engine with
//! a nibble-path trie overlay and a blockchain-style finalization layer for
//! Ethereum-shaped account/storage state.
//!
//! The crate is organized bottom-up: [`pager`] and [`page`] own the raw
//! memory-mapped region; [`store`] layers copy-on-write writer batches and
//! read-only snapshots on top; [`slotted`], [`trie`], [`pool`], [`span`]
//! and [`bloom`] are the data structures that live inside a page or inside
//! the off-heap block overlay; [`account`] and [`nibble`] define the wire
//! shapes written into those structures; [`blockchain`] ties the paged
//! store to an in-memory block DAG with a background flusher.
//!
//! See `DESIGN.md` for how each module is grounded and `SPEC_FULL.md` for
//! the full functional specification this crate implements.

pub mod account;
pub mod blockchain;
pub mod bloom;
pub mod config;
pub mod error;
pub mod metrics;
pub mod nibble;
pub mod page;
pub mod pager;
pub mod pool;
pub mod slotted;
pub mod span;
pub mod store;
pub mod trie;

pub use account::AccountValue;
pub use blockchain::{
    Blockchain, BlockHash, CommitView, NoopPreCommit, PreCommitHook, ReadOnlyWorldState, WorldState,
    GENESIS_HASH,
};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use nibble::{Key, KeyKind, NibblePath, OwnedNibblePath};
pub use store::{CommitOptions, ReadOnlyBatch, Store};
