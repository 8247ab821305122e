//! Metadata and root-counter page codecs (spec.md §6.1, §6.2).
//!
//! Grounded in the teacher crate's `meta.rs` (fixed-offset header read/write
//! helpers, little-endian throughout) but laid out per spec.md's metadata
//! fields rather than QuiverDB's segment-directory header.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::page::{page_batch_id, set_page_batch_id, HEADER_LEN, PAGE_SIZE};

const OFF_NEXT_FREE: usize = HEADER_LEN;
const OFF_ROOT_DATA_PAGE: usize = HEADER_LEN + 4;
const OFF_BLOCK_NUMBER: usize = HEADER_LEN + 8;
const OFF_BLOCK_HASH: usize = HEADER_LEN + 12;
const OFF_ABANDONED_COUNT: usize = HEADER_LEN + 12 + 32;
const OFF_ABANDONED_LIST: usize = OFF_ABANDONED_COUNT + 4;
const ABANDONED_ENTRY_LEN: usize = 8; // (addr: u32, batch_id: u32)

/// Maximum abandoned-page entries a single metadata page can carry. Pages
/// abandoned beyond this cap are simply never returned to the free list —
/// a space leak, not a correctness problem (see DESIGN.md).
pub const MAX_ABANDONED_ENTRIES: usize = (PAGE_SIZE - OFF_ABANDONED_LIST) / ABANDONED_ENTRY_LEN;

/// In-memory mirror of a metadata page's payload.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub next_free_page: u32,
    pub root_data_page: u32,
    pub block_number: u32,
    pub block_hash: [u8; 32],
    /// `(page_addr, abandoned_at_batch_id)` pairs.
    pub abandoned: Vec<(u32, u32)>,
}

impl Metadata {
    pub fn read(page: &[u8]) -> Result<Self> {
        if page.len() < OFF_ABANDONED_LIST {
            return Err(anyhow!("metadata page too short"));
        }
        let next_free_page = LittleEndian::read_u32(&page[OFF_NEXT_FREE..OFF_NEXT_FREE + 4]);
        let root_data_page =
            LittleEndian::read_u32(&page[OFF_ROOT_DATA_PAGE..OFF_ROOT_DATA_PAGE + 4]);
        let block_number = LittleEndian::read_u32(&page[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 4]);
        let mut block_hash = [0u8; 32];
        block_hash.copy_from_slice(&page[OFF_BLOCK_HASH..OFF_BLOCK_HASH + 32]);
        let count = LittleEndian::read_u32(&page[OFF_ABANDONED_COUNT..OFF_ABANDONED_COUNT + 4])
            as usize;
        let count = count.min(MAX_ABANDONED_ENTRIES);
        let mut abandoned = Vec::with_capacity(count);
        for i in 0..count {
            let off = OFF_ABANDONED_LIST + i * ABANDONED_ENTRY_LEN;
            let addr = LittleEndian::read_u32(&page[off..off + 4]);
            let batch_id = LittleEndian::read_u32(&page[off + 4..off + 8]);
            abandoned.push((addr, batch_id));
        }
        Ok(Metadata {
            next_free_page,
            root_data_page,
            block_number,
            block_hash,
            abandoned,
        })
    }

    /// Write this metadata, stamping the page's common header `batch_id`
    /// with the root counter value it represents.
    pub fn write(&self, page: &mut [u8], batch_id: u32) {
        for b in page.iter_mut() {
            *b = 0;
        }
        set_page_batch_id(page, batch_id);
        LittleEndian::write_u32(&mut page[OFF_NEXT_FREE..OFF_NEXT_FREE + 4], self.next_free_page);
        LittleEndian::write_u32(
            &mut page[OFF_ROOT_DATA_PAGE..OFF_ROOT_DATA_PAGE + 4],
            self.root_data_page,
        );
        LittleEndian::write_u32(
            &mut page[OFF_BLOCK_NUMBER..OFF_BLOCK_NUMBER + 4],
            self.block_number,
        );
        page[OFF_BLOCK_HASH..OFF_BLOCK_HASH + 32].copy_from_slice(&self.block_hash);
        let count = self.abandoned.len().min(MAX_ABANDONED_ENTRIES) as u32;
        LittleEndian::write_u32(&mut page[OFF_ABANDONED_COUNT..OFF_ABANDONED_COUNT + 4], count);
        for (i, (addr, batch_id)) in self.abandoned.iter().take(MAX_ABANDONED_ENTRIES).enumerate() {
            let off = OFF_ABANDONED_LIST + i * ABANDONED_ENTRY_LEN;
            LittleEndian::write_u32(&mut page[off..off + 4], *addr);
            LittleEndian::write_u32(&mut page[off + 4..off + 8], *batch_id);
        }
    }

    #[allow(dead_code)]
    pub fn batch_id(page: &[u8]) -> u32 {
        page_batch_id(page)
    }
}

pub fn read_root_counter(root_page: &[u8]) -> u64 {
    LittleEndian::read_u64(&root_page[HEADER_LEN..HEADER_LEN + 8])
}

pub fn write_root_counter(root_page: &mut [u8], counter: u64) {
    LittleEndian::write_u64(&mut root_page[HEADER_LEN..HEADER_LEN + 8], counter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let m = Metadata {
            next_free_page: 42,
            root_data_page: 17,
            block_number: 9,
            block_hash: [7u8; 32],
            abandoned: vec![(3, 1), (4, 2)],
        };
        m.write(&mut page, 5);
        let back = Metadata::read(&page).unwrap();
        assert_eq!(back.next_free_page, 42);
        assert_eq!(back.root_data_page, 17);
        assert_eq!(back.block_number, 9);
        assert_eq!(back.block_hash, [7u8; 32]);
        assert_eq!(back.abandoned, vec![(3, 1), (4, 2)]);
        assert_eq!(Metadata::batch_id(&page), 5);
    }
}
