//! Memory Objects
//!
//! An `MmObj` is the source of pages for a virtual memory area. There are
//! three kinds:
//!
//! - **Anonymous**: zero-filled memory with no backing store
//! - **Shadow**: a private copy-on-write layer over another object
//! - **Vnode**: the page cache of a file
//!
//! Every object is reference counted, and each resident page holds one of
//! those references. When the count falls to the number of resident pages,
//! nothing but the object's own pages keeps it alive and it is reclaimed:
//! anonymous and shadow objects free their pages and die, while a vnode
//! object writes its dirty pages back and empties its cache but lives on
//! with its file.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::types::{MmObjId, VmAreaId, VmMapId};
use crate::vm::vm_page::{self, PFrame, PinnedPage};
use crate::vm::vnode::Vnode;

// ============================================================================
// Object Kinds
// ============================================================================

/// Kind of memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Anonymous,
    Shadow,
    Vnode,
}

/// Where the shadow chain leads
struct ShadowLink {
    /// Next object down the chain. This is a counted reference.
    shadowed: Arc<MmObj>,
    /// Non-shadow object at the end of the chain. Not counted.
    bottom: Arc<MmObj>,
}

enum Backing {
    Anonymous,
    /// Emptied when the shadow object dies
    Shadow(Mutex<Option<ShadowLink>>),
    Vnode(Weak<dyn Vnode>),
}

impl Backing {
    fn kind(&self) -> ObjKind {
        match self {
            Backing::Anonymous => ObjKind::Anonymous,
            Backing::Shadow(_) => ObjKind::Shadow,
            Backing::Vnode(_) => ObjKind::Vnode,
        }
    }
}

/// A vmarea mapping some object whose chain ends here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaLink {
    pub map: Option<VmMapId>,
    pub area: VmAreaId,
}

// ============================================================================
// Memory Object
// ============================================================================

/// Memory object
pub struct MmObj {
    id: MmObjId,
    backing: Backing,
    /// Holders of this object, one per resident page included
    refcount: AtomicU32,
    /// Resident pages by object-relative page number
    pages: Mutex<BTreeMap<u32, Arc<PFrame>>>,
    /// Reverse map: every vmarea whose chain bottoms out here
    vmas: Mutex<Vec<VmaLink>>,
    alive: AtomicBool,
}

impl core::fmt::Debug for MmObj {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmObj")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("refcount", &self.refcount())
            .field("resident", &self.resident_count())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl MmObj {
    fn with_backing(backing: Backing, refcount: u32) -> Arc<MmObj> {
        Arc::new(MmObj {
            id: MmObjId::next(),
            backing,
            refcount: AtomicU32::new(refcount),
            pages: Mutex::new(BTreeMap::new()),
            vmas: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        })
    }

    /// Create an anonymous object holding one reference for the caller
    pub fn anon_create() -> Arc<MmObj> {
        let obj = Self::with_backing(Backing::Anonymous, 1);
        log::trace!("anon object {:?} created", obj.id);
        obj
    }

    /// Create a shadow object over `shadowed`, holding one reference for
    /// the caller. Takes its own reference on `shadowed`.
    pub fn shadow_create(shadowed: &Arc<MmObj>) -> Arc<MmObj> {
        shadowed.reference();
        let link = ShadowLink {
            shadowed: Arc::clone(shadowed),
            bottom: shadowed.bottom(),
        };
        let obj = Self::with_backing(Backing::Shadow(Mutex::new(Some(link))), 1);
        log::trace!("shadow object {:?} over {:?}", obj.id, shadowed.id);
        obj
    }

    /// Create the page cache object of a file. Starts with no references;
    /// each mapping of the file takes one.
    pub fn vnode_create(vnode: Weak<dyn Vnode>) -> Arc<MmObj> {
        Self::with_backing(Backing::Vnode(vnode), 0)
    }

    pub fn id(&self) -> MmObjId {
        self.id
    }

    pub fn kind(&self) -> ObjKind {
        self.backing.kind()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Number of resident pages
    pub fn resident_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Object this one shadows, if it is a live shadow
    pub fn shadowed(&self) -> Option<Arc<MmObj>> {
        match &self.backing {
            Backing::Shadow(link) => link.lock().as_ref().map(|l| Arc::clone(&l.shadowed)),
            _ => None,
        }
    }

    /// Non-shadow object at the end of this object's chain
    pub fn bottom(self: &Arc<Self>) -> Arc<MmObj> {
        match &self.backing {
            Backing::Shadow(link) => match link.lock().as_ref() {
                Some(l) => Arc::clone(&l.bottom),
                None => Arc::clone(self),
            },
            _ => Arc::clone(self),
        }
    }

    /// Number of shadow objects from here down to the bottom
    pub fn shadow_depth(self: &Arc<Self>) -> usize {
        let mut depth = 0;
        let mut cur = Arc::clone(self);
        while let Some(next) = cur.shadowed() {
            depth += 1;
            cur = next;
        }
        depth
    }

    // ========================================================================
    // Reference Counting
    // ========================================================================

    /// Take a reference
    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a reference, reclaiming the object if only its resident pages
    /// still refer to it.
    pub fn put(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "put on object {:?} with no references", self.id);
        if prev.saturating_sub(1) as usize == self.resident_count() {
            self.reclaim();
        }
    }

    fn reclaim(self: &Arc<Self>) {
        match &self.backing {
            Backing::Vnode(_) => {
                log::debug!("vnode object {:?} unmapped, evicting cache", self.id);
                self.evict_all(true);
            }
            Backing::Anonymous | Backing::Shadow(_) => {
                if !self.is_alive() {
                    return;
                }
                // Pages go first; a busy page holds the object alive
                self.evict_all(false);
                if !self.alive.swap(false, Ordering::SeqCst) {
                    return;
                }
                log::trace!("object {:?} reclaimed", self.id);
                if let Backing::Shadow(link) = &self.backing {
                    let link = link.lock().take();
                    if let Some(link) = link {
                        link.shadowed.put();
                    }
                }
            }
        }
    }

    /// Free every resident page, optionally writing dirty ones back first
    fn evict_all(self: &Arc<Self>, write_back: bool) {
        for frame in self.resident_pages() {
            if write_back && frame.is_dirty() {
                if let Err(e) = vm_page::pframe_clean(self, &frame) {
                    log::warn!(
                        "writeback of page {} of object {:?} failed: {}",
                        frame.pagenum(),
                        self.id,
                        e
                    );
                }
            }
            loop {
                if frame.try_free() {
                    break;
                }
                frame.wait_not_busy();
            }
            self.forget_page(&frame);
        }
    }

    // ========================================================================
    // Resident Page Table
    // ========================================================================

    /// All resident frames, in page order
    pub fn resident_pages(&self) -> Vec<Arc<PFrame>> {
        self.pages.lock().values().cloned().collect()
    }

    pub(crate) fn cached_page(&self, pagenum: u32) -> Option<Arc<PFrame>> {
        self.pages.lock().get(&pagenum).cloned()
    }

    /// Return the cached frame for `pagenum`, or allocate a busy one and
    /// enter it in the cache. The bool is true for a fresh frame.
    pub(crate) fn cached_or_alloc_page(&self, pagenum: u32) -> VmResult<(Arc<PFrame>, bool)> {
        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get(&pagenum) {
            return Ok((Arc::clone(frame), false));
        }
        let frame = PFrame::alloc(self.id, pagenum)?;
        pages.insert(pagenum, Arc::clone(&frame));
        self.reference();
        Ok((frame, true))
    }

    /// Drop a frame whose fill failed. The caller still holds the busy
    /// bit, so waiters see the frame as gone once it clears.
    pub(crate) fn discard_page(&self, frame: &Arc<PFrame>) {
        frame.mark_freed();
        self.forget_page(frame);
    }

    /// Remove a frame from the cache along with the reference it held.
    /// Never triggers reclamation.
    fn forget_page(&self, frame: &Arc<PFrame>) {
        let mut pages = self.pages.lock();
        if let Some(cur) = pages.get(&frame.pagenum()) {
            if Arc::ptr_eq(cur, frame) {
                pages.remove(&frame.pagenum());
                self.refcount.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    // ========================================================================
    // Page Operations
    // ========================================================================

    /// Find page `pagenum`, following the shadow chain.
    ///
    /// Returns `Ok(None)` when the page should be allocated in this object
    /// and filled by [`MmObj::fill_page`].
    pub fn lookup_page(
        self: &Arc<Self>,
        pagenum: u32,
        for_write: bool,
    ) -> VmResult<Option<PinnedPage>> {
        if let Some(page) = vm_page::pframe_get_resident(self, pagenum) {
            return Ok(Some(page));
        }
        match &self.backing {
            Backing::Anonymous | Backing::Vnode(_) => Ok(None),
            // Writes get a private copy made by fill_page
            Backing::Shadow(_) if for_write => Ok(None),
            Backing::Shadow(_) => {
                let shadowed = self.shadowed().ok_or(VmError::NotMapped)?;
                vm_page::pframe_lookup(&shadowed, pagenum, false).map(Some)
            }
        }
    }

    /// Fill a freshly allocated frame of this object
    pub fn fill_page(&self, frame: &PFrame) -> VmResult<()> {
        match &self.backing {
            Backing::Anonymous => {
                frame.zero();
                Ok(())
            }
            Backing::Shadow(_) => {
                let shadowed = self.shadowed().ok_or(VmError::NotMapped)?;
                let src = vm_page::pframe_lookup(&shadowed, frame.pagenum(), false)?;
                frame.copy_from(&src);
                Ok(())
            }
            Backing::Vnode(vnode) => {
                let vnode = vnode.upgrade().ok_or(VmError::Io)?;
                let offset = frame.pagenum() as usize * PAGE_SIZE;
                frame.with_data_mut(|data| {
                    let n = vnode.read(offset, data)?;
                    // Past end of file reads as zeros
                    data[n.min(PAGE_SIZE)..].fill(0);
                    Ok(())
                })
            }
        }
    }

    /// Mark a page of this object dirty
    pub fn dirty_page(&self, frame: &PFrame) -> VmResult<()> {
        if let Backing::Vnode(vnode) = &self.backing {
            let vnode = vnode.upgrade().ok_or(VmError::Io)?;
            vnode.dirty_page(frame.pagenum())?;
        }
        frame.set_dirty();
        Ok(())
    }

    /// Write a page back to backing store. Only the part of the page
    /// inside the file is written; the file never grows.
    pub fn clean_page(&self, frame: &PFrame) -> VmResult<()> {
        match &self.backing {
            Backing::Anonymous | Backing::Shadow(_) => Ok(()),
            Backing::Vnode(vnode) => {
                let vnode = vnode.upgrade().ok_or(VmError::Io)?;
                let offset = frame.pagenum() as usize * PAGE_SIZE;
                let len = vnode.len().saturating_sub(offset).min(PAGE_SIZE);
                if len == 0 {
                    return Ok(());
                }
                frame.with_data(|data| vnode.write(offset, &data[..len]).map(|_| ()))
            }
        }
    }

    // ========================================================================
    // Reverse Map
    // ========================================================================

    pub(crate) fn add_vma(&self, link: VmaLink) {
        self.vmas.lock().push(link);
    }

    pub(crate) fn remove_vma(&self, area: VmAreaId) {
        self.vmas.lock().retain(|l| l.area != area);
    }

    /// Vmareas whose chains end at this object
    pub fn vmas(&self) -> Vec<VmaLink> {
        self.vmas.lock().clone()
    }
}
