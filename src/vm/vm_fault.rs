//! VM Fault - Page Fault Handling
//!
//! Resolves a user page fault against the faulting process's address
//! space: find the vmarea, check the access against its protection, bring
//! the page in through the page-frame cache and install the translation.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: first touch of anonymous memory
//! - **Page-in**: first touch of a file page
//! - **Copy-on-write**: write to a page still owned by a shadowed object
//!
//! A read fault installs the page read-only even in a writable area, so a
//! later write faults again and gets its private copy.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{addr_to_pn, page_align_down};
use crate::error::{VmError, VmResult};
use crate::proc::ProcVm;
use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::{pframe_dirty, pframe_lookup};

bitflags! {
    /// Fault cause as reported by the trap handler
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        /// Page was present (protection violation)
        const PRESENT = 0x01;
        const WRITE = 0x02;
        /// Fault came from user mode
        const USER = 0x04;
        const RESERVED = 0x08;
        const EXEC = 0x10;
    }
}

impl FaultCause {
    /// Protection the access needs
    pub fn required_prot(&self) -> VmProt {
        if self.contains(Self::WRITE) {
            VmProt::WRITE
        } else if self.contains(Self::EXEC) {
            VmProt::EXEC
        } else {
            VmProt::READ
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Write faults
    pub write: AtomicU64,
    /// Faults that did not resolve
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            write: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Fault Handler
// ============================================================================

/// Handle a page fault at `vaddr` in `proc`.
///
/// An error means the access was illegal; the caller kills the process.
pub fn handle_pagefault(proc: &ProcVm, vaddr: usize, cause: FaultCause) -> VmResult<()> {
    FAULT_STATS.total.fetch_add(1, Ordering::Relaxed);
    let for_write = cause.contains(FaultCause::WRITE);
    if for_write {
        FAULT_STATS.write.fetch_add(1, Ordering::Relaxed);
    }

    let result = resolve_fault(proc, vaddr, cause, for_write);
    if let Err(e) = result {
        FAULT_STATS.failures.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "pid {}: fault at {:#x} ({:?}) failed: {}",
            proc.pid(),
            vaddr,
            cause,
            e
        );
    }
    result
}

fn resolve_fault(proc: &ProcVm, vaddr: usize, cause: FaultCause, for_write: bool) -> VmResult<()> {
    let aspace = proc.lock();
    let vfn = addr_to_pn(vaddr);
    let area = aspace.map.lookup(vfn).ok_or(VmError::NotMapped)?;

    if !area.prot().contains(cause.required_prot()) {
        return Err(VmError::ProtectionFault);
    }

    let obj = area.obj().ok_or(VmError::NotMapped)?;
    let page = pframe_lookup(obj, area.pagenum(vfn), for_write)?;
    if for_write {
        pframe_dirty(obj, &page)?;
    }

    log::trace!(
        "pid {}: fault {:#x} -> page {} of {:?}",
        proc.pid(),
        vaddr,
        page.pagenum(),
        page.obj_id()
    );

    proc.pmap()
        .map_page(page_align_down(vaddr), page.phys_addr(), for_write)
}
