// S2: sibling blocks finalized independently keep seeing independent state.
// S3: destroy_account shadows the destroying block (and its descendants)
// without affecting a sibling that never destroyed the account.
//
// These exercise the same invariants as the unit tests colocated in
// `src/blockchain/mod.rs`, but through the crate's public API only, the way
// a caller embedding this engine actually would.

use anyhow::Result;
use env_logger::{Builder, Env};
use std::sync::Arc;
use std::time::Duration;

use paprika::{Blockchain, EngineConfig, EngineError, GENESIS_HASH, NoopPreCommit, Store};

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init()
        .ok();
}

fn chain(max_pages: u32) -> Blockchain {
    init_logger();
    let cfg = EngineConfig::default()
        .with_max_pages(max_pages)
        .with_min_flush_delay(Duration::from_millis(1));
    let store = Arc::new(Store::open(cfg.clone()).unwrap());
    Blockchain::open(store, &cfg, Arc::new(NoopPreCommit))
}

fn wait_flushed(bc: &Blockchain, at_least: u32) {
    for _ in 0..5000 {
        if bc.flushed_block_number() >= at_least {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for flush to reach block {at_least}");
}

#[test]
fn s2_sibling_blocks_see_independent_state() -> Result<()> {
    let bc = chain(4096);

    let b1_ws = bc.start_new(GENESIS_HASH)?;
    let b1 = b1_ws.commit(1)?;

    let b2_ws = bc.start_new(b1)?;
    b2_ws.set_account([1u8; 32], b"balance=10")?;
    let b2 = b2_ws.commit(2)?;

    // Only B1 is finalized; B2 stays an in-memory overlay block.
    bc.finalize(b1)?;
    wait_flushed(&bc, 1);

    let on_b2 = bc.start_new(b2)?;
    assert_eq!(on_b2.get_account([1u8; 32])?, Some(b"balance=10".to_vec()));

    let on_b1 = bc.start_new(b1)?;
    assert_eq!(on_b1.get_account([1u8; 32])?, None);

    bc.shutdown()?;
    Ok(())
}

#[test]
fn s3_destroy_shadows_but_sibling_unaffected() -> Result<()> {
    let bc = chain(4096);

    let base = bc.start_new(GENESIS_HASH)?;
    base.set_account([5u8; 32], b"balance=5")?;
    base.set_storage([5u8; 32], [9u8; 32], b"slot-value")?;
    let base_hash = base.commit(1)?;
    bc.finalize(base_hash)?;
    wait_flushed(&bc, 1);

    let destroying = bc.start_new(base_hash)?;
    destroying.destroy_account([5u8; 32])?;
    assert_eq!(destroying.get_account([5u8; 32])?, None);
    assert_eq!(destroying.get_storage([5u8; 32], [9u8; 32])?, None);
    let destroyed_hash = destroying.commit(2)?;

    // A descendant of the destroying block still sees the shadow.
    let descendant = bc.start_new(destroyed_hash)?;
    assert_eq!(descendant.get_account([5u8; 32])?, None);

    // A sibling built on the same parent, which never destroyed the
    // account, is unaffected.
    let sibling = bc.start_new(base_hash)?;
    assert_eq!(sibling.get_account([5u8; 32])?, Some(b"balance=5".to_vec()));
    assert_eq!(
        sibling.get_storage([5u8; 32], [9u8; 32])?,
        Some(b"slot-value".to_vec())
    );

    bc.shutdown()?;
    Ok(())
}

#[test]
fn missing_parent_and_missing_block_are_rejected() -> Result<()> {
    let bc = chain(256);

    let err = bc.start_new([0xEEu8; 32]).unwrap_err();
    assert!(matches!(err, EngineError::MissingParent(_)));

    let err = bc.finalize([0xDDu8; 32]).unwrap_err();
    assert!(matches!(err, EngineError::MissingBlock(_)));

    bc.shutdown()?;
    Ok(())
}
