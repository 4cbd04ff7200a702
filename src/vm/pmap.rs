//! Physical Map (pmap) - Translation Installation
//!
//! The VM subsystem decides what a virtual page maps to; the pmap puts
//! that decision into hardware page tables and keeps the TLB honest.
//!
//! ## Key Operations
//!
//! - `map_page`: Install a translation for one page
//! - `unmap_range`: Remove every translation in a byte range
//! - `flush_range`: Invalidate TLB entries for a range
//!
//! Unmapping and flushing are separate so a caller can batch several
//! unmaps under one flush.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::config::{addr_to_pn, pn_to_addr, PAGE_SIZE};
use crate::error::VmResult;

/// Hardware translation interface for one address space
pub trait Pmap: Send + Sync {
    /// Map the page at `vaddr` to the frame at `paddr`
    fn map_page(&self, vaddr: usize, paddr: usize, writable: bool) -> VmResult<()>;

    /// Remove translations for `[start, end)`
    fn unmap_range(&self, start: usize, end: usize);

    /// Invalidate cached translations for `npages` pages from `start`
    fn flush_range(&self, start: usize, npages: u32);
}

/// Pmap for address spaces with no hardware tables behind them
pub struct NullPmap;

impl Pmap for NullPmap {
    fn map_page(&self, _vaddr: usize, _paddr: usize, _writable: bool) -> VmResult<()> {
        Ok(())
    }

    fn unmap_range(&self, _start: usize, _end: usize) {}

    fn flush_range(&self, _start: usize, _npages: u32) {}
}

// ============================================================================
// Software Page Table
// ============================================================================

/// One installed translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapEntry {
    pub paddr: usize,
    pub writable: bool,
}

/// Statistics for a pmap
#[derive(Debug, Default)]
pub struct PmapStats {
    /// Translations currently installed
    pub resident_count: AtomicU32,
    /// Flush requests seen
    pub flushes: AtomicU64,
}

impl PmapStats {
    pub fn resident(&self) -> u32 {
        self.resident_count.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

/// Pmap kept entirely in memory, keyed by virtual page number.
/// Useful for hosted kernels and for checking what the VM layer installs.
#[derive(Default)]
pub struct SoftPmap {
    entries: Mutex<BTreeMap<u32, PmapEntry>>,
    pub stats: PmapStats,
}

impl SoftPmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translation for the page containing `vaddr`
    pub fn extract(&self, vaddr: usize) -> Option<PmapEntry> {
        self.entries.lock().get(&addr_to_pn(vaddr)).copied()
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.extract(vaddr).is_some()
    }

    /// Virtual addresses of all installed translations
    pub fn mapped_pages(&self) -> alloc::vec::Vec<usize> {
        self.entries.lock().keys().map(|&pn| pn_to_addr(pn)).collect()
    }
}

impl Pmap for SoftPmap {
    fn map_page(&self, vaddr: usize, paddr: usize, writable: bool) -> VmResult<()> {
        let entry = PmapEntry { paddr, writable };
        if self.entries.lock().insert(addr_to_pn(vaddr), entry).is_none() {
            self.stats.resident_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn unmap_range(&self, start: usize, end: usize) {
        let lo = addr_to_pn(start);
        let hi = addr_to_pn(end.saturating_add(PAGE_SIZE - 1));
        let mut entries = self.entries.lock();
        let doomed: alloc::vec::Vec<u32> = entries.range(lo..hi).map(|(&pn, _)| pn).collect();
        for pn in doomed {
            entries.remove(&pn);
            self.stats.resident_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn flush_range(&self, _start: usize, _npages: u32) {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
