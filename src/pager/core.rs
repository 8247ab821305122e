use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::page::PAGE_SIZE;
use crate::pager::bytes_for;

/// Owns the fixed-size mapped region and hands out page-sized byte slices
/// by address. Does not know about metadata/root semantics — that's
/// `crate::store::PagedStore`'s job; this is purely the address space.
pub struct Pager {
    mmap: MmapMut,
    max_pages: u32,
    path: Option<PathBuf>,
    /// Lowest page address dirtied since the last `flush_data()`, used to
    /// bound the `msync` range instead of always flushing the whole file.
    dirty_lo: Option<u32>,
    dirty_hi: Option<u32>,
}

impl Pager {
    /// Open (creating if necessary) a file-backed mapping of exactly
    /// `max_pages * PAGE_SIZE` bytes.
    pub fn open_file(path: impl AsRef<Path>, max_pages: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open pager file {}", path.display()))?;
        let len = bytes_for(max_pages);
        file.set_len(len)
            .with_context(|| format!("set_len({len}) on pager file {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        info!(
            "pager: opened file-backed region path={} max_pages={max_pages} len={len}",
            path.display()
        );
        Ok(Pager {
            mmap,
            max_pages,
            path: Some(path.to_path_buf()),
            dirty_lo: None,
            dirty_hi: None,
        })
    }

    /// Open an anonymous (non-file-backed) mapping, used by tests and by
    /// `DangerNoWrite`-mode stores where nothing needs to survive restart.
    pub fn open_anon(max_pages: u32) -> Result<Self> {
        let len = bytes_for(max_pages);
        let mmap = MmapOptions::new()
            .len(len as usize)
            .map_anon()
            .context("map anonymous pager region")?;
        info!("pager: opened anonymous region max_pages={max_pages} len={len}");
        Ok(Pager {
            mmap,
            max_pages,
            path: None,
            dirty_lo: None,
            dirty_hi: None,
        })
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn is_file_backed(&self) -> bool {
        self.path.is_some()
    }

    #[inline]
    fn check_addr(&self, addr: u32) -> Result<()> {
        if addr >= self.max_pages {
            return Err(anyhow!(
                "address {addr} out of range (max_page={})",
                self.max_pages
            ));
        }
        Ok(())
    }

    /// `page_at(addr) -> Page` (read-only view).
    pub fn page_at(&self, addr: u32) -> Result<&[u8]> {
        self.check_addr(addr)?;
        let off = addr as usize * PAGE_SIZE;
        Ok(&self.mmap[off..off + PAGE_SIZE])
    }

    /// Mutable page view; also records the address in the dirty range so
    /// `flush_data()` knows what to `msync`.
    pub fn page_at_mut(&mut self, addr: u32) -> Result<&mut [u8]> {
        self.check_addr(addr)?;
        self.dirty_lo = Some(self.dirty_lo.map_or(addr, |lo| lo.min(addr)));
        self.dirty_hi = Some(self.dirty_hi.map_or(addr, |hi| hi.max(addr)));
        let off = addr as usize * PAGE_SIZE;
        Ok(&mut self.mmap[off..off + PAGE_SIZE])
    }

    /// Durably persist every non-root page written since the last call
    /// (spec.md §4.1's `flush_data`). Always a no-op-safe superset: we
    /// flush the whole dirtied range, root page included if it happened to
    /// be touched, but callers are expected to call `flush_root()`
    /// separately and in the correct order (data before root).
    pub fn flush_data(&mut self) -> Result<()> {
        if let (Some(lo), Some(hi)) = (self.dirty_lo, self.dirty_hi) {
            let start = lo as usize * PAGE_SIZE;
            let len = (hi - lo + 1) as usize * PAGE_SIZE;
            self.mmap.flush_range(start, len).context("flush_range(data)")?;
            debug!("pager: flush_data pages={lo}..={hi}");
            self.dirty_lo = None;
            self.dirty_hi = None;
        }
        crate::metrics::record_data_flush();
        Ok(())
    }

    /// Durably persist only the root-counter page (address 0).
    pub fn flush_root(&mut self) -> Result<()> {
        self.mmap
            .flush_range(0, PAGE_SIZE)
            .context("flush_range(root)")?;
        debug!("pager: flush_root");
        crate::metrics::record_root_flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_address_is_rejected() {
        let pager = Pager::open_anon(8).unwrap();
        assert!(pager.page_at(8).is_err());
        assert!(pager.page_at(7).is_ok());
    }

    #[test]
    fn writes_are_visible_through_subsequent_reads() {
        let mut pager = Pager::open_anon(4).unwrap();
        {
            let p = pager.page_at_mut(2).unwrap();
            p[0] = 0xAB;
        }
        assert_eq!(pager.page_at(2).unwrap()[0], 0xAB);
        assert_eq!(pager.page_at(1).unwrap()[0], 0);
    }

    #[test]
    fn flush_data_then_flush_root_do_not_error_on_anon_mapping() {
        let mut pager = Pager::open_anon(4).unwrap();
        pager.page_at_mut(3).unwrap()[0] = 1;
        pager.flush_data().unwrap();
        pager.flush_root().unwrap();
    }
}
