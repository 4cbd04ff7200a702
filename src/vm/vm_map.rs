//! VM Map - Address Space Management
//!
//! A `VmMap` is the virtual address space of one process: an ordered set
//! of non-overlapping `VmArea`s keyed by starting virtual page number.
//! Each area holds one counted reference on the memory object that
//! supplies its pages. Dropping an area releases that reference, so
//! destroying a map can neither leak nor double-release.

use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::Write;

use crate::config::{addr_to_pn, page_aligned, page_offset, pn_to_addr, VmLayout, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::types::{VmAreaId, VmMapId};
use crate::vm::vm_object::{MmObj, VmaLink};
use crate::vm::vm_page::{pframe_dirty, pframe_lookup};
use crate::vm::vnode::Vnode;

// ============================================================================
// Protection and Mapping Flags
// ============================================================================

bitflags! {
    /// Memory protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl VmProt {
    /// No access
    pub const NONE: Self = Self::empty();
    /// Read/write
    pub const DEFAULT: Self = Self::READ.union(Self::WRITE);
}

bitflags! {
    /// mmap flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// Changes are visible to every mapper and reach the file
        const SHARED = 0x01;
        /// Changes are copy-on-write and private to this mapping
        const PRIVATE = 0x02;
        /// Place exactly at the given address
        const FIXED = 0x10;
        /// No backing file
        const ANON = 0x20;
    }
}

impl MapFlags {
    /// Exactly one of SHARED and PRIVATE is set
    pub fn sharing_valid(&self) -> bool {
        self.contains(Self::SHARED) != self.contains(Self::PRIVATE)
    }

    fn sharing(self) -> Self {
        self & (Self::SHARED | Self::PRIVATE)
    }
}

/// Search direction for free ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the top of user space down
    HighToLow,
    /// From the bottom of user space up
    LowToHigh,
}

// ============================================================================
// VM Area
// ============================================================================

/// One contiguous, page-aligned mapping. Bounds are virtual page numbers,
/// `end` exclusive; `off` is in pages.
#[derive(Debug)]
pub struct VmArea {
    id: VmAreaId,
    start: u32,
    end: u32,
    off: u32,
    prot: VmProt,
    flags: MapFlags,
    obj: Option<Arc<MmObj>>,
    /// Owning map (relation only)
    map: Option<VmMapId>,
}

impl VmArea {
    /// Create an area with no object attached
    pub fn new(start: u32, end: u32, off: u32, prot: VmProt, flags: MapFlags) -> Self {
        Self {
            id: VmAreaId::next(),
            start,
            end,
            off,
            prot,
            flags: flags.sharing(),
            obj: None,
            map: None,
        }
    }

    pub fn id(&self) -> VmAreaId {
        self.id
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Offset into the object, in pages
    pub fn off(&self) -> u32 {
        self.off
    }

    pub fn prot(&self) -> VmProt {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn map_id(&self) -> Option<VmMapId> {
        self.map
    }

    pub fn npages(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(MapFlags::PRIVATE)
    }

    /// Check if a virtual page is in this area
    pub fn contains(&self, vfn: u32) -> bool {
        vfn >= self.start && vfn < self.end
    }

    /// Check if this area overlaps `[lo, hi)`
    pub fn overlaps(&self, lo: u32, hi: u32) -> bool {
        self.start < hi && lo < self.end
    }

    /// Object-relative page number backing virtual page `vfn`
    pub fn pagenum(&self, vfn: u32) -> u32 {
        vfn - self.start + self.off
    }

    pub fn obj(&self) -> Option<&Arc<MmObj>> {
        self.obj.as_ref()
    }

    fn link(&self) -> VmaLink {
        VmaLink {
            map: self.map,
            area: self.id,
        }
    }

    /// Attach `obj`, taking over the caller's reference on it. Any object
    /// already attached is released.
    pub fn attach(&mut self, obj: Arc<MmObj>) {
        self.release();
        obj.bottom().add_vma(self.link());
        self.obj = Some(obj);
    }

    /// Detach the object, handing its reference to the caller
    pub fn detach(&mut self) -> Option<Arc<MmObj>> {
        let obj = self.obj.take()?;
        obj.bottom().remove_vma(self.id);
        Some(obj)
    }

    fn release(&mut self) {
        if let Some(obj) = self.detach() {
            obj.put();
        }
    }

    /// Split at virtual page `at`, returning the upper part. Both halves
    /// reference the same object.
    fn split(&mut self, at: u32) -> Option<VmArea> {
        if at <= self.start || at >= self.end {
            return None;
        }
        let mut upper = VmArea::new(at, self.end, self.off + (at - self.start), self.prot, self.flags);
        upper.map = self.map;
        if let Some(obj) = &self.obj {
            obj.reference();
            upper.attach(Arc::clone(obj));
        }
        self.end = at;
        Some(upper)
    }
}

impl Drop for VmArea {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// VM Map
// ============================================================================

/// Address space of one process
#[derive(Debug)]
pub struct VmMap {
    id: VmMapId,
    layout: VmLayout,
    /// Areas keyed by start page
    areas: BTreeMap<u32, VmArea>,
    /// Owning process (relation only)
    owner: Option<u32>,
}

impl VmMap {
    /// Create an empty map over the default user layout
    pub fn new() -> Self {
        Self::with_layout(VmLayout::default())
    }

    /// Create an empty map over `layout`
    pub fn with_layout(layout: VmLayout) -> Self {
        Self {
            id: VmMapId::next(),
            layout,
            areas: BTreeMap::new(),
            owner: None,
        }
    }

    pub fn id(&self) -> VmMapId {
        self.id
    }

    pub fn layout(&self) -> VmLayout {
        self.layout
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    pub fn set_owner(&mut self, pid: u32) {
        self.owner = Some(pid);
    }

    /// Number of areas
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Areas in ascending order
    pub fn areas(&self) -> impl Iterator<Item = &VmArea> {
        self.areas.values()
    }

    /// Areas in ascending order, mutably. Bounds cannot change through this.
    pub fn areas_mut(&mut self) -> impl Iterator<Item = &mut VmArea> {
        self.areas.values_mut()
    }

    /// Destroy the map, releasing every area's object
    pub fn destroy(self) {
        log::debug!("destroying map {:?} ({} areas)", self.id, self.areas.len());
        drop(self);
    }

    /// Insert an area. The caller guarantees it overlaps nothing.
    pub fn insert(&mut self, mut area: VmArea) -> &mut VmArea {
        debug_assert!(self.is_range_empty(area.start, area.npages()));
        area.map = Some(self.id);
        match self.areas.entry(area.start) {
            Entry::Vacant(slot) => slot.insert(area),
            Entry::Occupied(mut slot) => {
                // Replaced area drops here, releasing its object
                slot.insert(area);
                slot.into_mut()
            }
        }
    }

    fn reinsert(&mut self, area: VmArea) {
        self.areas.insert(area.start, area);
    }

    /// Find `npages` free contiguous pages. `HighToLow` returns the highest
    /// start that fits, `LowToHigh` the lowest.
    pub fn find_range(&self, npages: u32, dir: Direction) -> Option<u32> {
        if npages == 0 {
            return None;
        }
        let low = self.layout.low_pn();
        let high = self.layout.high_pn();

        match dir {
            Direction::HighToLow => {
                let mut hi = high;
                for area in self.areas.values().rev() {
                    if area.end <= hi && hi - area.end >= npages {
                        return Some(hi - npages);
                    }
                    hi = hi.min(area.start);
                }
                (hi >= low && hi - low >= npages).then(|| hi - npages)
            }
            Direction::LowToHigh => {
                let mut lo = low;
                for area in self.areas.values() {
                    if area.start >= lo && area.start - lo >= npages {
                        return Some(lo);
                    }
                    lo = lo.max(area.end);
                }
                (high >= lo && high - lo >= npages).then_some(lo)
            }
        }
    }

    /// Area containing virtual page `vfn`
    pub fn lookup(&self, vfn: u32) -> Option<&VmArea> {
        self.areas
            .range(..=vfn)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(vfn))
    }

    /// True if no area intersects `[start, start + npages)`
    pub fn is_range_empty(&self, start: u32, npages: u32) -> bool {
        let end = start.saturating_add(npages);
        // Areas are disjoint, so the last one starting below `end` has the
        // greatest end of all candidates
        match self.areas.range(..end).next_back() {
            Some((_, area)) => area.end <= start,
            None => true,
        }
    }

    /// New map with the same area geometry and no objects attached
    pub fn clone_map(&self) -> VmMap {
        let mut clone = VmMap::with_layout(self.layout);
        for area in self.areas.values() {
            clone.insert(VmArea::new(area.start, area.end, area.off, area.prot, area.flags));
        }
        clone
    }

    /// Grow the area containing `vfn` so it ends at `new_end`
    pub fn extend_area(&mut self, vfn: u32, new_end: u32) -> VmResult<()> {
        let (start, end) = self
            .lookup(vfn)
            .map(|a| (a.start, a.end))
            .ok_or(VmError::NotMapped)?;
        if new_end <= end {
            return Ok(());
        }
        if !self.is_range_empty(end, new_end - end) {
            return Err(VmError::NoSpace);
        }
        if let Some(area) = self.areas.get_mut(&start) {
            area.end = new_end;
        }
        Ok(())
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Map `npages` pages of `vnode` (or anonymous memory) at `lopage`, or
    /// wherever `find_range` places it when `lopage` is 0. `off` is a byte
    /// offset into the object. Anything already mapped in a fixed target
    /// range is unmapped first.
    pub fn map(
        &mut self,
        vnode: Option<&Arc<dyn Vnode>>,
        lopage: u32,
        npages: u32,
        prot: VmProt,
        flags: MapFlags,
        off: usize,
        dir: Direction,
    ) -> VmResult<&mut VmArea> {
        if npages == 0 || !flags.sharing_valid() || !page_aligned(off) {
            return Err(VmError::InvalidArgument);
        }
        if lopage != 0 && !self.layout.contains_pages(lopage, npages) {
            return Err(VmError::InvalidArgument);
        }
        let off_pages = u32::try_from(off / PAGE_SIZE).map_err(|_| VmError::InvalidArgument)?;
        // Object page numbers of the whole area must fit in u32
        off_pages.checked_add(npages).ok_or(VmError::InvalidArgument)?;

        let start = match lopage {
            0 => self.find_range(npages, dir).ok_or(VmError::NoSpace)?,
            _ => lopage,
        };

        // Everything fallible happens before the map is touched
        let backing = match vnode {
            Some(vnode) => vnode.mmobj()?,
            None => MmObj::anon_create(),
        };
        let obj = if flags.contains(MapFlags::PRIVATE) {
            let shadow = MmObj::shadow_create(&backing);
            backing.put();
            shadow
        } else {
            backing
        };

        if !self.is_range_empty(start, npages) {
            self.remove(start, npages);
        }

        log::debug!(
            "map {:?}: [{:#x}, {:#x}) {:?} {:?} obj {:?}",
            self.id,
            start,
            start + npages,
            prot,
            flags.sharing(),
            obj.id()
        );

        let area = self.insert(VmArea::new(start, start + npages, off_pages, prot, flags));
        area.attach(obj);
        Ok(area)
    }

    /// Unmap `[lopage, lopage + npages)`, splitting or trimming areas that
    /// straddle its ends
    pub fn remove(&mut self, lopage: u32, npages: u32) {
        let hipage = lopage.saturating_add(npages);
        let hits: Vec<u32> = self
            .areas
            .range(..hipage)
            .filter(|(_, area)| area.end > lopage)
            .map(|(&start, _)| start)
            .collect();

        log::debug!(
            "unmap {:?}: [{:#x}, {:#x}) touches {} areas",
            self.id,
            lopage,
            hipage,
            hits.len()
        );

        for start in hits {
            let Some(mut area) = self.areas.remove(&start) else {
                continue;
            };
            if area.start < lopage && area.end > hipage {
                // Hole punched in the middle
                if let Some(upper) = area.split(hipage) {
                    self.reinsert(upper);
                }
                area.end = lopage;
                self.reinsert(area);
            } else if area.start < lopage {
                area.end = lopage;
                self.reinsert(area);
            } else if area.end > hipage {
                area.off += hipage - area.start;
                area.start = hipage;
                self.reinsert(area);
            }
            // Fully covered areas drop here
        }
    }

    // ========================================================================
    // Data Access
    // ========================================================================

    /// Copy `buf.len()` bytes out of the address space starting at `vaddr`.
    /// Protections are not checked.
    pub fn read(&self, vaddr: usize, buf: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr.checked_add(done).ok_or(VmError::NotMapped)?;
            let n = (PAGE_SIZE - page_offset(addr)).min(buf.len() - done);
            let (obj, pagenum) = self.resolve(addr)?;
            let page = pframe_lookup(obj, pagenum, false)?;
            page.read(page_offset(addr), &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `buf` into the address space starting at `vaddr`, dirtying
    /// every page touched. Protections are not checked.
    pub fn write(&self, vaddr: usize, buf: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr.checked_add(done).ok_or(VmError::NotMapped)?;
            let n = (PAGE_SIZE - page_offset(addr)).min(buf.len() - done);
            let (obj, pagenum) = self.resolve(addr)?;
            let page = pframe_lookup(obj, pagenum, true)?;
            pframe_dirty(obj, &page)?;
            page.write(page_offset(addr), &buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Object and object page number backing `addr`
    fn resolve(&self, addr: usize) -> VmResult<(&Arc<MmObj>, u32)> {
        let vfn = addr_to_pn(addr);
        let area = self.lookup(vfn).ok_or(VmError::NotMapped)?;
        let obj = area.obj().ok_or(VmError::NotMapped)?;
        Ok((obj, area.pagenum(vfn)))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// One line per area, truncated to the capacity `N`
    pub fn mapping_info<const N: usize>(&self) -> heapless::String<N> {
        let mut out = heapless::String::new();
        if writeln!(
            out,
            "{:>23} {:>4} {:>8} {:>6} {:>8} {:>17}",
            "VADDR RANGE", "PROT", "FLAGS", "MMOBJ", "OFFSET", "VFN RANGE"
        )
        .is_err()
        {
            return out;
        }
        for area in self.areas.values() {
            let prot = [
                (VmProt::READ, 'r'),
                (VmProt::WRITE, 'w'),
                (VmProt::EXEC, 'x'),
            ]
            .map(|(bit, c)| if area.prot.contains(bit) { c } else { '-' });
            let sharing = if area.is_private() { "PRIVATE" } else { "SHARED" };
            let obj = area.obj().map(|o| o.id().0).unwrap_or(0);
            let line = writeln!(
                out,
                "{:#010x}-{:#010x}  {}{}{}  {:>8} {:>6} {:#08x} {:#07x}-{:#07x}",
                pn_to_addr(area.start),
                pn_to_addr(area.end),
                prot[0],
                prot[1],
                prot[2],
                sharing,
                obj,
                area.off,
                area.start,
                area.end
            );
            if line.is_err() {
                break;
            }
        }
        out
    }
}

impl Default for VmMap {
    fn default() -> Self {
        Self::new()
    }
}
