// S1: write 1,000 random 32-byte keys to 32-byte values in a single block,
// commit + finalize + await flushed, reopen the store, and check every key
// comes back with its exact value.

use anyhow::Result;
use env_logger::{Builder, Env};
use oorandom::Rand64;
use std::sync::Arc;
use std::time::Duration;

use paprika::store::PageSource;
use paprika::{Blockchain, EngineConfig, GENESIS_HASH, NoopPreCommit, Store};

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init()
        .ok();
}

fn unique_path(prefix: &str) -> std::path::PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("paprika-{prefix}-{pid}-{t}.db"))
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
fn smoke_1000_keys_survive_reopen() -> Result<()> {
    init_logger();
    let path = unique_path("smoke");
    let mut rng = Rand64::new(0x1357_9BDF_2468_ACE0);

    let mut keys = Vec::with_capacity(1000);
    let mut values = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let mut k = [0u8; 32];
        let mut v = [0u8; 32];
        for chunk in k.chunks_mut(8) {
            chunk.copy_from_slice(&rng.rand_u64().to_le_bytes());
        }
        for chunk in v.chunks_mut(8) {
            chunk.copy_from_slice(&rng.rand_u64().to_le_bytes());
        }
        keys.push(k);
        values.push(v);
    }

    {
        let store = Arc::new(Store::open_path(
            &path,
            EngineConfig::default()
                .with_max_pages(1 << 15)
                .with_min_flush_delay(Duration::from_millis(1)),
        )?);
        let cfg = EngineConfig::default().with_min_flush_delay(Duration::from_millis(1));
        let bc = Blockchain::open(Arc::clone(&store), &cfg, Arc::new(NoopPreCommit));

        let ws = bc.start_new(GENESIS_HASH)?;
        for (k, v) in keys.iter().zip(values.iter()) {
            ws.set_account(*k, v)?;
        }
        let hash = ws.commit(1)?;
        bc.finalize(hash)?;
        wait_flushed(&bc, 1);
        bc.shutdown()?;
        store.force_flush()?;
    }

    // Reopen a fresh `Store` over the same file and read every key back
    // through the trie directly, bypassing the blockchain overlay entirely.
    let reopened = Store::open_path(&path, EngineConfig::default().with_max_pages(1 << 15))?;
    let ro = reopened.begin_read_only_batch()?;
    for (k, v) in keys.iter().zip(values.iter()) {
        let key = paprika::Key::account(paprika::NibblePath::full(k));
        let path = key.routing_path();
        let got = paprika::trie::try_get(&ro, ro.root_data_addr(), &path.as_ref())?;
        assert_eq!(got.as_deref(), Some(v.as_slice()), "mismatch for key {k:?}");
    }

    std::fs::remove_file(&path).ok();
    Ok(())
}
