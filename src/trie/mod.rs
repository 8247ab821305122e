//! The nibble-path trie data page (spec.md §4.4): 16 child-bucket
//! addresses followed by an inline slotted array, with overflow promoted
//! into freshly allocated child pages.
//!
//! Grounded in the teacher crate's `dir.rs` (a fixed-size, fan-out
//! bucket-head table with atomic-looking head updates) generalized from a
//! flat one-level directory into a recursive 16-way trie of data pages.
//!
//! A node's inline slotted array stores entries keyed by their *full*
//! remaining path at that node (the branching nibble is not stripped until
//! an entry is actually moved down into a child page on overflow) — so
//! `try_get`/`set` only slice the path when descending through a
//! non-null child bucket.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::nibble::NibblePath;
use crate::page::{init_page, HEADER_LEN, NULL_PAGE, PAGE_SIZE};
use crate::store::{Batch, PageSource};

pub const CHILD_COUNT: usize = 16;
const CHILD_SLOT_LEN: usize = 4;
pub const CHILDREN_OFF: usize = HEADER_LEN;
pub const SLOTTED_REGION_OFF: usize = CHILDREN_OFF + CHILD_COUNT * CHILD_SLOT_LEN;

/// Upper bound on trie descent, guarding against an infinite loop on a
/// corrupt page graph. A bare account/storage hash is at most
/// `crate::nibble::MAX_NIBBLES` (64) nibbles, but the blockchain overlay
/// addresses entries by `Key::routing_path()` (spec.md §6.3's full
/// `kind, path, storage_path` wire encoding read as one nibble run), which
/// for a storage cell can reach roughly double that — see DESIGN.md.
const MAX_DESCENT: usize = 4 * crate::nibble::MAX_NIBBLES;

/// Initialize a fresh, empty trie data page in place.
pub fn init_data_page(page: &mut [u8], batch_id: u32) {
    init_page(page, batch_id, crate::page::FLAG_DATA_PAGE, 0);
    for i in 0..CHILD_COUNT {
        set_child(page, i, NULL_PAGE);
    }
    crate::slotted::init(&mut page[SLOTTED_REGION_OFF..]);
}

pub fn child(page: &[u8], nibble: usize) -> u32 {
    let off = CHILDREN_OFF + nibble * CHILD_SLOT_LEN;
    LittleEndian::read_u32(&page[off..off + 4])
}

pub fn set_child(page: &mut [u8], nibble: usize, addr: u32) {
    let off = CHILDREN_OFF + nibble * CHILD_SLOT_LEN;
    LittleEndian::write_u32(&mut page[off..off + 4], addr);
}

fn slotted_mut(page: &mut [u8]) -> &mut [u8] {
    &mut page[SLOTTED_REGION_OFF..]
}

fn slotted(page: &[u8]) -> &[u8] {
    &page[SLOTTED_REGION_OFF..]
}

/// `try_get(key)`.
pub fn try_get<S: PageSource>(source: &S, root_addr: u32, key: &NibblePath) -> Result<Option<Vec<u8>>> {
    let mut addr = root_addr;
    let mut remaining = key.clone();
    for _ in 0..=MAX_DESCENT {
        if crate::pager::is_null(addr) {
            return Ok(None);
        }
        let page = source.read_page(addr)?;
        if let Some(n) = remaining.first_nibble() {
            let c = child(&page, n as usize);
            if !crate::pager::is_null(c) {
                addr = c;
                remaining = remaining.slice_from(1);
                continue;
            }
        }
        return Ok(crate::slotted::try_get(slotted(&page), &remaining));
    }
    Err(anyhow!("try_get: path exceeds max depth (cycle in trie?)"))
}

/// `set(key, value)`. Returns the (possibly COW'd) address of the node,
/// to be written back into whatever bucket/root pointer referenced it.
pub fn set(batch: &mut Batch<'_>, root_addr: u32, key: &NibblePath, value: &[u8]) -> Result<u32> {
    set_rec(batch, root_addr, key, value)
}

fn set_rec(batch: &mut Batch<'_>, addr: u32, key: &NibblePath, value: &[u8]) -> Result<u32> {
    let (addr, mut page) = batch.get_writable_copy(addr)?;

    if let Some(n) = key.first_nibble() {
        let c = child(&page, n as usize);
        if !crate::pager::is_null(c) {
            let new_c = set_rec(batch, c, &key.slice_from(1), value)?;
            set_child(&mut page, n as usize, new_c);
            batch.write_back(addr, &page)?;
            return Ok(addr);
        }
    }

    if crate::slotted::try_set(slotted_mut(&mut page), key, value)? {
        batch.write_back(addr, &page)?;
        return Ok(addr);
    }

    // Overflow: promote the biggest-nibble bucket into a freshly allocated
    // child page (spec.md §4.4's progress guarantee: the biggest nibble
    // always has >= entries/16 elements, so moving it strictly frees space).
    let counts = crate::slotted::nibble_counts(slotted(&page));
    let biggest = biggest_nibble(&counts)
        .ok_or_else(|| anyhow!("data page full with no spillable entries"))?;

    let moved = crate::slotted::enumerate_nibble(slotted(&page), biggest as u8);
    let (child_addr, mut child_page) = batch.get_new_dirty_page()?;
    init_data_page(&mut child_page, 0);
    for (k, v) in &moved {
        let sliced = k.as_ref().slice_from(1);
        if !crate::slotted::try_set(slotted_mut(&mut child_page), &sliced, v)? {
            return Err(anyhow!("spill: freshly allocated child page cannot hold moved entries"));
        }
    }
    batch.write_back(child_addr, &child_page)?;

    crate::slotted::delete_by_prefix(
        slotted_mut(&mut page),
        &crate::nibble::NibblePath::single(biggest as u8).as_ref(),
    );
    set_child(&mut page, biggest, child_addr);
    batch.write_back(addr, &page)?;
    crate::metrics::record_trie_child_spill();

    // Retry from the top of this node: if `key` itself starts with
    // `biggest` it will now descend into the freshly created child; else
    // the inline array has strictly more room and the plain insert above
    // succeeds.
    set_rec(batch, addr, key, value)
}

fn biggest_nibble(counts: &[u32; 16]) -> Option<usize> {
    let (idx, &max) = counts.iter().enumerate().max_by_key(|(_, &c)| c)?;
    if max == 0 {
        None
    } else {
        Some(idx)
    }
}

/// Delete every entry whose routing path starts with `prefix`, freeing any
/// descendant child pages along the way. Used by the blockchain overlay's
/// flusher to wipe a destroyed account's storage subtree in one call
/// (`prefix` = `Key::storage_prefix(account_path)`) and, since a *complete*
/// key's encoding is itself a valid (non-wildcard) prefix, to delete a
/// single account entry the same way (`prefix` = `Key::account(path).
/// routing_path()`).
pub fn delete_subtree(batch: &mut Batch<'_>, root_addr: u32, prefix: &NibblePath) -> Result<u32> {
    delete_subtree_rec(batch, root_addr, prefix)
}

fn delete_subtree_rec(batch: &mut Batch<'_>, addr: u32, prefix: &NibblePath) -> Result<u32> {
    let (addr, mut page) = batch.get_writable_copy(addr)?;

    if prefix.is_empty() {
        for n in 0..CHILD_COUNT {
            let c = child(&page, n);
            if !crate::pager::is_null(c) {
                abandon_subtree(batch, c)?;
                set_child(&mut page, n, NULL_PAGE);
            }
        }
        crate::slotted::init(slotted_mut(&mut page));
        batch.write_back(addr, &page)?;
        return Ok(addr);
    }

    let n = prefix.first_nibble().expect("non-empty prefix has a first nibble") as usize;
    let c = child(&page, n);
    if !crate::pager::is_null(c) {
        let new_c = delete_subtree_rec(batch, c, &prefix.slice_from(1))?;
        set_child(&mut page, n, new_c);
    } else {
        crate::slotted::delete_by_prefix(slotted_mut(&mut page), prefix);
    }
    batch.write_back(addr, &page)?;
    Ok(addr)
}

/// Abandon every page reachable from `addr`'s child buckets, then `addr`
/// itself. Called on the node where a `delete_subtree` prefix bottoms out.
fn abandon_subtree(batch: &mut Batch<'_>, addr: u32) -> Result<()> {
    let page = batch.get_at(addr)?;
    for n in 0..CHILD_COUNT {
        let c = child(&page, n);
        if !crate::pager::is_null(c) {
            abandon_subtree(batch, c)?;
        }
    }
    batch.abandon(addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::{CommitOptions, Store};

    #[test]
    fn set_then_get_roundtrips_through_a_batch() {
        let store = Store::open(EngineConfig::default().with_max_pages(256)).unwrap();
        let key = NibblePath::full(&[0x11u8; 32]);
        let root = {
            let mut batch = store.begin_next_batch().unwrap();
            let r = batch.root_data_addr();
            let new_root = set(&mut batch, r, &key, b"value-one").unwrap();
            batch.set_root_data_addr(new_root);
            batch.commit(CommitOptions::FlushDataAndRoot).unwrap();
            new_root
        };
        let ro = store.begin_read_only_batch().unwrap();
        assert_eq!(ro.root_data_addr(), root);
        let got = try_get(&ro, root, &key).unwrap();
        assert_eq!(got, Some(b"value-one".to_vec()));
    }

    #[test]
    fn delete_subtree_removes_matching_keys_and_spares_others() {
        let store = Store::open(EngineConfig::default().with_max_pages(4096)).unwrap();
        let mut inside = Vec::new();
        for i in 0u32..300 {
            let mut b = [0u8; 32];
            b[0] = 0xAB; // shared prefix nibbles
            b[1..5].copy_from_slice(&i.to_be_bytes());
            inside.push(b);
        }
        let outside = {
            let mut b = [0u8; 32];
            b[0] = 0xCD;
            b
        };
        let root = {
            let mut batch = store.begin_next_batch().unwrap();
            let mut root = batch.root_data_addr();
            for b in &inside {
                root = set(&mut batch, root, &NibblePath::full(b), b"in").unwrap();
            }
            root = set(&mut batch, root, &NibblePath::full(&outside), b"out").unwrap();
            batch.set_root_data_addr(root);
            batch.commit(CommitOptions::FlushDataAndRoot).unwrap();
            root
        };

        let new_root = {
            let mut batch = store.begin_next_batch().unwrap();
            let prefix_bytes = [0xABu8];
            let prefix = NibblePath::full(&prefix_bytes).truncate_to(2);
            let new_root = delete_subtree(&mut batch, root, &prefix).unwrap();
            batch.set_root_data_addr(new_root);
            batch.commit(CommitOptions::FlushDataAndRoot).unwrap();
            new_root
        };

        let ro = store.begin_read_only_batch().unwrap();
        for b in &inside {
            assert_eq!(try_get(&ro, new_root, &NibblePath::full(b)).unwrap(), None);
        }
        assert_eq!(
            try_get(&ro, new_root, &NibblePath::full(&outside)).unwrap(),
            Some(b"out".to_vec())
        );
    }

    #[test]
    fn many_keys_spill_into_child_pages_and_remain_readable() {
        let store = Store::open(EngineConfig::default().with_max_pages(4096)).unwrap();
        let mut keys = Vec::new();
        for i in 0u32..400 {
            let mut b = [0u8; 32];
            b[0..4].copy_from_slice(&i.to_be_bytes());
            keys.push(b);
        }
        let root = {
            let mut batch = store.begin_next_batch().unwrap();
            let mut root = batch.root_data_addr();
            for b in &keys {
                let k = NibblePath::full(b);
                root = set(&mut batch, root, &k, b"v").unwrap();
                batch.set_root_data_addr(root);
            }
            batch.commit(CommitOptions::FlushDataAndRoot).unwrap();
            root
        };
        let ro = store.begin_read_only_batch().unwrap();
        for b in &keys {
            let k = NibblePath::full(b);
            assert_eq!(try_get(&ro, root, &k).unwrap(), Some(b"v".to_vec()));
        }
    }
}
