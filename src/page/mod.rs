//! Page header layout shared by every page kind (spec.md §6.2).
//!
//! A page begins with a fixed 8-byte header: `batch_id: u32` (the root
//! counter value at the time of the writing batch), `flags: u16`,
//! `level: u8`, one reserved byte. The remaining `PAGE_SIZE - HEADER_LEN`
//! bytes are payload, interpreted differently by the root page, metadata
//! pages, and data (trie node) pages.

use byteorder::{ByteOrder, LittleEndian};

pub use crate::config::PAGE_SIZE;

/// NULL page address, matching spec.md §3 ("0xFFFFFFFF denotes NULL").
pub const NULL_PAGE: u32 = 0xFFFF_FFFF;

pub const HEADER_LEN: usize = 8;
const OFF_BATCH_ID: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_LEVEL: usize = 6;

pub const FLAG_DATA_PAGE: u16 = 1;

/// Read the `batch_id` a page was last written under.
#[inline]
pub fn page_batch_id(page: &[u8]) -> u32 {
    LittleEndian::read_u32(&page[OFF_BATCH_ID..OFF_BATCH_ID + 4])
}

#[inline]
pub fn set_page_batch_id(page: &mut [u8], batch_id: u32) {
    LittleEndian::write_u32(&mut page[OFF_BATCH_ID..OFF_BATCH_ID + 4], batch_id);
}

#[inline]
pub fn page_flags(page: &[u8]) -> u16 {
    LittleEndian::read_u16(&page[OFF_FLAGS..OFF_FLAGS + 2])
}

#[inline]
pub fn set_page_flags(page: &mut [u8], flags: u16) {
    LittleEndian::write_u16(&mut page[OFF_FLAGS..OFF_FLAGS + 2], flags);
}

#[inline]
pub fn page_level(page: &[u8]) -> u8 {
    page[OFF_LEVEL]
}

#[inline]
pub fn set_page_level(page: &mut [u8], level: u8) {
    page[OFF_LEVEL] = level;
}

/// Zero a fresh page and stamp the common header.
pub fn init_page(page: &mut [u8], batch_id: u32, flags: u16, level: u8) {
    for b in page.iter_mut() {
        *b = 0;
    }
    set_page_batch_id(page, batch_id);
    set_page_flags(page, flags);
    set_page_level(page, level);
}
