//! VM User Interface - mmap, munmap and brk
//!
//! ## Key Operations
//!
//! - `do_mmap`: Map a file or anonymous memory into the caller
//! - `do_munmap`: Remove mappings from a range
//! - `do_brk`: Move the end of the heap
//!
//! Arguments are fully validated before the address space is touched.
//! Every successful change to the map drops the stale translations for
//! the affected range.

use crate::config::{
    addr_to_pn, page_align_up, page_aligned, pages_for, pn_to_addr, PAGE_SIZE,
};
use crate::error::{VmError, VmResult};
use crate::proc::ProcVm;
use crate::vm::vm_map::{Direction, MapFlags, VmProt};
use crate::vm::vnode::FileMode;

/// Drop translations for `npages` pages at `vfn` and flush them
fn invalidate(proc: &ProcVm, vfn: u32, npages: u32) {
    let start = pn_to_addr(vfn);
    proc.pmap().unmap_range(start, start + pn_to_addr(npages));
    proc.pmap().flush_range(start, npages);
}

// ============================================================================
// mmap
// ============================================================================

/// Map `len` bytes at `addr` (exactly, with `MAP_FIXED`) from descriptor
/// `fd` at byte offset `off`, or anonymous memory with `MAP_ANON`.
/// Returns the address of the new mapping.
pub fn do_mmap(
    proc: &ProcVm,
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    off: usize,
) -> VmResult<usize> {
    let prot = VmProt::from_bits(prot).ok_or(VmError::InvalidArgument)?;
    let flags = MapFlags::from_bits(flags).ok_or(VmError::InvalidArgument)?;

    if !flags.sharing_valid() {
        log::warn!("mmap: need exactly one of MAP_SHARED/MAP_PRIVATE, got {:?}", flags);
        return Err(VmError::InvalidArgument);
    }
    if len == 0 || len > usize::MAX - PAGE_SIZE {
        return Err(VmError::InvalidArgument);
    }
    if !page_aligned(addr) || !page_aligned(off) {
        return Err(VmError::InvalidArgument);
    }
    let layout = proc.lock().map.layout();
    if page_align_up(len) > layout.user_mem_high - layout.user_mem_low {
        return Err(VmError::NoSpace);
    }
    let npages = pages_for(len);
    if flags.contains(MapFlags::FIXED) && !layout.contains_range(addr, page_align_up(len)) {
        return Err(VmError::InvalidArgument);
    }

    let vnode = if flags.contains(MapFlags::ANON) {
        None
    } else {
        let file = proc.files().get(fd).ok_or(VmError::BadDescriptor)?;
        if !file.mode.contains(FileMode::READ) {
            return Err(VmError::AccessDenied);
        }
        let writes_through = flags.contains(MapFlags::SHARED) && prot.contains(VmProt::WRITE);
        if writes_through
            && (!file.mode.contains(FileMode::WRITE) || file.mode.contains(FileMode::APPEND))
        {
            return Err(VmError::AccessDenied);
        }
        Some(file.vnode)
    };

    let lopage = if flags.contains(MapFlags::FIXED) {
        addr_to_pn(addr)
    } else {
        0
    };

    let start = {
        let mut aspace = proc.lock();
        aspace
            .map
            .map(vnode.as_ref(), lopage, npages, prot, flags, off, Direction::HighToLow)?
            .start()
    };
    invalidate(proc, start, npages);

    Ok(pn_to_addr(start))
}

// ============================================================================
// munmap
// ============================================================================

/// Unmap every page intersecting `[addr, addr + len)`
pub fn do_munmap(proc: &ProcVm, addr: usize, len: usize) -> VmResult<()> {
    if len == 0 || !page_aligned(addr) || len > usize::MAX - PAGE_SIZE {
        return Err(VmError::InvalidArgument);
    }
    let mut aspace = proc.lock();
    if !aspace.map.layout().contains_range(addr, page_align_up(len)) {
        return Err(VmError::InvalidArgument);
    }

    let lopage = addr_to_pn(addr);
    let npages = pages_for(len);
    aspace.map.remove(lopage, npages);
    drop(aspace);

    invalidate(proc, lopage, npages);
    Ok(())
}

// ============================================================================
// brk
// ============================================================================

/// Set the break to `addr`, or report it when `addr` is `None`.
///
/// The heap is one private anonymous area from the initial break, rounded
/// up to a page, to the current break. It cannot go below the initial break,
/// past the top of user space, or into the next mapping.
pub fn do_brk(proc: &ProcVm, addr: Option<usize>) -> VmResult<usize> {
    let mut aspace = proc.lock();
    let Some(addr) = addr else {
        return Ok(aspace.brk);
    };

    if addr < aspace.start_brk || addr > aspace.map.layout().user_mem_high {
        return Err(VmError::NoMemory);
    }

    let heap_lo = addr_to_pn(page_align_up(aspace.start_brk));
    if heap_lo < aspace.map.layout().low_pn() {
        log::warn!("brk: heap base {:#x} below user space", aspace.start_brk);
        return Err(VmError::InvalidArgument);
    }
    let old_hi = addr_to_pn(page_align_up(aspace.brk));
    let new_hi = addr_to_pn(page_align_up(addr));

    if new_hi > old_hi {
        if !aspace.map.is_range_empty(old_hi, new_hi - old_hi) {
            log::debug!("brk: {:#x} collides with an existing mapping", addr);
            return Err(VmError::NoMemory);
        }
        let heap_exists = old_hi > heap_lo && aspace.map.lookup(old_hi - 1).is_some();
        if heap_exists {
            aspace.map.extend_area(old_hi - 1, new_hi)?;
        } else {
            aspace.map.map(
                None,
                old_hi,
                new_hi - old_hi,
                VmProt::DEFAULT,
                MapFlags::PRIVATE,
                0,
                Direction::LowToHigh,
            )?;
        }
    } else if new_hi < old_hi {
        aspace.map.remove(new_hi, old_hi - new_hi);
        invalidate(proc, new_hi, old_hi - new_hi);
    }

    log::debug!("brk: {:#x} -> {:#x}", aspace.brk, addr);
    aspace.brk = addr;
    Ok(addr)
}

/// Convert a syscall result to the kernel return convention
pub fn syscall_ret(result: VmResult<usize>) -> isize {
    match result {
        Ok(v) => v as isize,
        Err(e) => -(e.errno() as isize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmLayout;
    use crate::errno;
    use crate::vm::pmap::{Pmap, SoftPmap};
    use crate::vm::vm_object::ObjKind;
    use crate::vm::vnode::testing::{pattern, Files, MemFile};
    use crate::vm::vnode::{FileTable, NoFiles, Vnode};
    use alloc::sync::Arc;

    const PROT_RW: u32 = 0x3;
    const PROT_R: u32 = 0x1;
    const SHARED: u32 = 0x01;
    const PRIVATE: u32 = 0x02;
    const FIXED: u32 = 0x10;
    const ANON: u32 = 0x20;

    fn proc_with(files: Arc<dyn FileTable>) -> (ProcVm, Arc<SoftPmap>) {
        let pmap = Arc::new(SoftPmap::new());
        let proc = ProcVm::new(3, VmLayout::default(), files, pmap.clone());
        (proc, pmap)
    }

    fn anon_proc() -> ProcVm {
        proc_with(Arc::new(NoFiles)).0
    }

    #[test]
    fn test_mmap_anon() {
        let proc = anon_proc();
        let addr = do_mmap(&proc, 0, 3 * PAGE_SIZE, PROT_RW, PRIVATE | ANON, -1, 0).unwrap();
        assert!(page_aligned(addr));
        assert_eq!(addr + 3 * PAGE_SIZE, VmLayout::default().user_mem_high);

        let aspace = proc.lock();
        let area = aspace.map.lookup(addr_to_pn(addr)).unwrap();
        assert_eq!(area.npages(), 3);
        assert_eq!(area.obj().map(|o| o.kind()), Some(ObjKind::Shadow));
    }

    #[test]
    fn test_mmap_rounds_length_up() {
        let proc = anon_proc();
        let addr = do_mmap(&proc, 0, 10, PROT_RW, SHARED | ANON, -1, 0).unwrap();
        let aspace = proc.lock();
        assert_eq!(aspace.map.lookup(addr_to_pn(addr)).map(|a| a.npages()), Some(1));
    }

    #[test]
    fn test_mmap_argument_errors() {
        let proc = anon_proc();
        let cases = [
            (0, 0, PROT_RW, PRIVATE | ANON, 0),
            (0x1234, PAGE_SIZE, PROT_RW, PRIVATE | ANON, 0),
            (0, PAGE_SIZE, PROT_RW, SHARED | PRIVATE | ANON, 0),
            (0, PAGE_SIZE, PROT_RW, ANON, 0),
            (0, PAGE_SIZE, PROT_RW, PRIVATE | ANON | 0x8000, 0),
            (0, PAGE_SIZE, 0x80, PRIVATE | ANON, 0),
            (0, PAGE_SIZE, PROT_RW, PRIVATE | ANON, 17),
            (0, PAGE_SIZE, PROT_RW, PRIVATE | ANON | FIXED, 0),
            (0xc000_0000, PAGE_SIZE, PROT_RW, PRIVATE | ANON | FIXED, 0),
        ];
        for (addr, len, prot, flags, off) in cases {
            assert_eq!(
                do_mmap(&proc, addr, len, prot, flags, -1, off),
                Err(VmError::InvalidArgument),
                "addr={:#x} len={} prot={:#x} flags={:#x} off={}",
                addr,
                len,
                prot,
                flags,
                off
            );
        }
        assert!(proc.lock().map.is_empty());
    }

    #[test]
    fn test_mmap_descriptor_errors() {
        let file = MemFile::new(&pattern(1));
        let vnode: Arc<dyn Vnode> = file;

        let (proc, _) = proc_with(Arc::new(NoFiles));
        assert_eq!(
            do_mmap(&proc, 0, PAGE_SIZE, PROT_R, PRIVATE, 4, 0),
            Err(VmError::BadDescriptor)
        );

        let (proc, _) = proc_with(Files::with(4, FileMode::WRITE, vnode.clone()));
        assert_eq!(
            do_mmap(&proc, 0, PAGE_SIZE, PROT_R, PRIVATE, 4, 0),
            Err(VmError::AccessDenied)
        );

        let (proc, _) = proc_with(Files::with(4, FileMode::READ, vnode.clone()));
        assert_eq!(
            do_mmap(&proc, 0, PAGE_SIZE, PROT_RW, SHARED, 4, 0),
            Err(VmError::AccessDenied)
        );
        // Private writable mappings of a read-only file are fine
        assert!(do_mmap(&proc, 0, PAGE_SIZE, PROT_RW, PRIVATE, 4, 0).is_ok());

        let append = FileMode::READ | FileMode::WRITE | FileMode::APPEND;
        let (proc, _) = proc_with(Files::with(4, append, vnode));
        assert_eq!(
            do_mmap(&proc, 0, PAGE_SIZE, PROT_RW, SHARED, 4, 0),
            Err(VmError::AccessDenied)
        );
    }

    #[test]
    fn test_mmap_shared_file_writes_back() {
        let file = MemFile::new(&pattern(2));
        let vnode: Arc<dyn Vnode> = file.clone();
        let (proc, _) = proc_with(Files::with(3, FileMode::READ | FileMode::WRITE, vnode));

        let addr = do_mmap(&proc, 0, PAGE_SIZE, PROT_RW, SHARED, 3, PAGE_SIZE).unwrap();
        let mut byte = [0u8; 1];
        proc.lock().map.read(addr, &mut byte).unwrap();
        assert_eq!(byte[0], 2);

        proc.lock().map.write(addr, b"Z").unwrap();
        do_munmap(&proc, addr, PAGE_SIZE).unwrap();
        assert_eq!(file.contents.lock()[PAGE_SIZE], b'Z');
    }

    #[test]
    fn test_mmap_private_file_stays_private() {
        let file = MemFile::new(&pattern(1));
        let vnode: Arc<dyn Vnode> = file.clone();
        let (proc, _) = proc_with(Files::with(3, FileMode::READ, vnode));

        let addr = do_mmap(&proc, 0, PAGE_SIZE, PROT_RW, PRIVATE, 3, 0).unwrap();
        proc.lock().map.write(addr, b"Q").unwrap();
        do_munmap(&proc, addr, PAGE_SIZE).unwrap();
        assert_eq!(file.contents.lock()[0], 1);
    }

    #[test]
    fn test_mmap_fixed_and_invalidation() {
        let (proc, pmap) = proc_with(Arc::new(NoFiles));
        let addr = 0x1000_0000;
        pmap.map_page(addr, 0x5000, true).unwrap();

        let got = do_mmap(&proc, addr, 2 * PAGE_SIZE, PROT_RW, PRIVATE | ANON | FIXED, -1, 0)
            .unwrap();
        assert_eq!(got, addr);
        assert!(!pmap.is_mapped(addr));
        assert!(pmap.stats.flushes() >= 1);
    }

    #[test]
    fn test_munmap() {
        let (proc, pmap) = proc_with(Arc::new(NoFiles));
        let addr = do_mmap(&proc, 0, 4 * PAGE_SIZE, PROT_RW, PRIVATE | ANON, -1, 0).unwrap();
        pmap.map_page(addr + PAGE_SIZE, 0x9000, true).unwrap();

        do_munmap(&proc, addr + PAGE_SIZE, PAGE_SIZE).unwrap();
        assert!(!pmap.is_mapped(addr + PAGE_SIZE));
        let aspace = proc.lock();
        assert_eq!(aspace.map.len(), 2);
        assert!(aspace.map.lookup(addr_to_pn(addr + PAGE_SIZE)).is_none());
        drop(aspace);

        assert_eq!(do_munmap(&proc, addr, 0), Err(VmError::InvalidArgument));
        assert_eq!(do_munmap(&proc, addr + 1, PAGE_SIZE), Err(VmError::InvalidArgument));
        assert_eq!(do_munmap(&proc, 0, PAGE_SIZE), Err(VmError::InvalidArgument));
    }

    #[test]
    fn test_brk_grow_and_shrink() {
        let proc = anon_proc();
        let base = 0x0800_0123;
        proc.set_brk_base(base);
        assert_eq!(do_brk(&proc, None), Ok(base));

        let heap_lo = addr_to_pn(page_align_up(base));
        assert_eq!(do_brk(&proc, Some(base + 2 * PAGE_SIZE)), Ok(base + 2 * PAGE_SIZE));
        assert_eq!(do_brk(&proc, Some(base + 5 * PAGE_SIZE)), Ok(base + 5 * PAGE_SIZE));
        {
            let aspace = proc.lock();
            assert_eq!(aspace.map.len(), 1);
            let heap = aspace.map.lookup(heap_lo).unwrap();
            assert_eq!(heap.start(), heap_lo);
            assert_eq!(heap.end(), addr_to_pn(page_align_up(base + 5 * PAGE_SIZE)));
        }

        proc.lock().map.write(base + 4 * PAGE_SIZE, b"heap").unwrap();

        assert_eq!(do_brk(&proc, Some(base + PAGE_SIZE)), Ok(base + PAGE_SIZE));
        {
            let aspace = proc.lock();
            let heap = aspace.map.lookup(heap_lo).unwrap();
            assert_eq!(heap.end(), addr_to_pn(page_align_up(base + PAGE_SIZE)));
        }
        assert_eq!(do_brk(&proc, None), Ok(base + PAGE_SIZE));

        // Back to the initial break: nothing left of the heap
        assert_eq!(do_brk(&proc, Some(base)), Ok(base));
        assert!(proc.lock().map.is_empty());
    }

    #[test]
    fn test_brk_bounds() {
        let proc = anon_proc();
        let base = 0x0800_0000;
        proc.set_brk_base(base);

        assert_eq!(do_brk(&proc, Some(base - 1)), Err(VmError::NoMemory));
        assert_eq!(do_brk(&proc, Some(0xc000_1000)), Err(VmError::NoMemory));

        do_mmap(&proc, base + 4 * PAGE_SIZE, PAGE_SIZE, PROT_RW, PRIVATE | ANON | FIXED, -1, 0)
            .unwrap();
        assert_eq!(do_brk(&proc, Some(base + 4 * PAGE_SIZE)), Ok(base + 4 * PAGE_SIZE));
        assert_eq!(do_brk(&proc, Some(base + 4 * PAGE_SIZE + 1)), Err(VmError::NoMemory));
        assert_eq!(do_brk(&proc, None), Ok(base + 4 * PAGE_SIZE));
    }

    #[test]
    fn test_brk_without_heap_base() {
        let proc = anon_proc();
        assert_eq!(do_brk(&proc, None), Ok(0));
        assert_eq!(do_brk(&proc, Some(0x10_0000)), Err(VmError::InvalidArgument));
        assert!(proc.lock().map.is_empty());
        assert_eq!(do_brk(&proc, None), Ok(0));
    }

    #[test]
    fn test_mmap_offset_past_object_end() {
        let proc = anon_proc();
        let off = 0xffff_ffff * PAGE_SIZE;
        assert_eq!(
            do_mmap(&proc, 0, 2 * PAGE_SIZE, PROT_RW, PRIVATE | ANON, -1, off),
            Err(VmError::InvalidArgument)
        );
        assert!(proc.lock().map.is_empty());

        // The last representable object pages are still mappable
        let off = 0xffff_fffd * PAGE_SIZE;
        let addr = do_mmap(&proc, 0, 2 * PAGE_SIZE, PROT_RW, PRIVATE | ANON, -1, off).unwrap();
        proc.lock().map.write(addr + PAGE_SIZE, b"x").unwrap();
        let mut byte = [0u8; 1];
        proc.lock().map.read(addr + PAGE_SIZE, &mut byte).unwrap();
        assert_eq!(&byte, b"x");
    }

    #[test]
    fn test_syscall_ret() {
        assert_eq!(syscall_ret(Ok(0x4000)), 0x4000);
        assert_eq!(
            syscall_ret(Err(VmError::BadDescriptor)),
            -(errno::EBADF as isize)
        );
        assert_eq!(syscall_ret(Err(VmError::NoSpace)), -(errno::ENOMEM as isize));
    }
}
