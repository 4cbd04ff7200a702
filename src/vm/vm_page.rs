//! Page Frame Cache
//!
//! A `PFrame` is one resident page belonging to exactly one memory object
//! at one object-relative page number. Frames move through three states
//! that matter to callers:
//!
//! - **busy**: a fill or clean is in flight; everyone else sleeps on the
//!   frame's wait queue until it clears
//! - **dirty**: modified since the last clean
//! - **pinned**: held by an in-progress fault/read/write
//!
//! `pframe_lookup` is the single entry point the upper layers use.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::kern::sched_prim::WaitQueue;
use crate::types::MmObjId;
use crate::vm::vm_object::MmObj;

// ============================================================================
// Page Flags
// ============================================================================

bitflags! {
    /// Page frame state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        /// Fill or writeback in progress
        const BUSY = 0x0001;
        /// Modified since last clean
        const DIRTY = 0x0002;
    }
}

#[derive(Debug, Default)]
struct FrameState {
    flags: PageFlags,
    pin_count: u32,
    /// Removed from its object's cache
    freed: bool,
}

/// Outcome of trying to pin a cached frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinAttempt {
    Pinned,
    Busy,
    Gone,
}

// ============================================================================
// Frame Statistics
// ============================================================================

static FRAMES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static FRAMES_RELEASED: AtomicU64 = AtomicU64::new(0);

/// Page frame statistics
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    /// Frames allocated since boot
    pub allocated: u64,
    /// Frames whose memory has been returned
    pub released: u64,
}

impl FrameStats {
    /// Frames currently holding memory
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Get frame statistics
pub fn stats() -> FrameStats {
    FrameStats {
        allocated: FRAMES_ALLOCATED.load(Ordering::SeqCst),
        released: FRAMES_RELEASED.load(Ordering::SeqCst),
    }
}

// ============================================================================
// Page Frame
// ============================================================================

/// One resident page of one memory object
#[derive(Debug)]
pub struct PFrame {
    pagenum: u32,
    /// Owning object (relation only, never ownership)
    obj: MmObjId,
    state: Mutex<FrameState>,
    /// Physical page contents
    data: Mutex<Box<[u8]>>,
    waitq: WaitQueue,
}

fn alloc_frame_memory() -> VmResult<Box<[u8]>> {
    let mut mem = Vec::new();
    mem.try_reserve_exact(PAGE_SIZE)
        .map_err(|_| VmError::NoMemory)?;
    mem.resize(PAGE_SIZE, 0);
    Ok(mem.into_boxed_slice())
}

impl PFrame {
    /// Allocate a zeroed frame. It starts out busy: the caller owns the fill.
    pub(crate) fn alloc(obj: MmObjId, pagenum: u32) -> VmResult<Arc<PFrame>> {
        let data = alloc_frame_memory()?;
        FRAMES_ALLOCATED.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(PFrame {
            pagenum,
            obj,
            state: Mutex::new(FrameState {
                flags: PageFlags::BUSY,
                pin_count: 0,
                freed: false,
            }),
            data: Mutex::new(data),
            waitq: WaitQueue::new(),
        }))
    }

    /// Object-relative page number
    pub fn pagenum(&self) -> u32 {
        self.pagenum
    }

    /// ID of the owning object
    pub fn obj_id(&self) -> MmObjId {
        self.obj
    }

    /// Physical address handle of the page contents
    pub fn phys_addr(&self) -> usize {
        self.data.lock().as_ptr() as usize
    }

    pub fn flags(&self) -> PageFlags {
        self.state.lock().flags
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(PageFlags::BUSY)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pin_count > 0
    }

    pub fn pin_count(&self) -> u32 {
        self.state.lock().pin_count
    }

    /// Has the frame been dropped from its object's cache?
    pub fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    /// Claim the busy bit. Returns false if someone else holds it.
    pub(crate) fn try_set_busy(&self) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(PageFlags::BUSY) || state.freed {
            return false;
        }
        state.flags.insert(PageFlags::BUSY);
        true
    }

    /// Drop the busy bit and wake everyone sleeping on this frame
    pub(crate) fn clear_busy(&self) {
        self.state.lock().flags.remove(PageFlags::BUSY);
        self.waitq.broadcast();
    }

    /// Sleep until the frame is not busy
    pub fn wait_not_busy(&self) {
        self.waitq.sleep_while(|| self.is_busy());
    }

    pub(crate) fn set_dirty(&self) {
        self.state.lock().flags.insert(PageFlags::DIRTY);
    }

    pub(crate) fn clear_dirty(&self) {
        self.state.lock().flags.remove(PageFlags::DIRTY);
    }

    /// Pin unless busy or freed
    pub(crate) fn try_pin(&self) -> PinAttempt {
        let mut state = self.state.lock();
        if state.freed {
            PinAttempt::Gone
        } else if state.flags.contains(PageFlags::BUSY) {
            PinAttempt::Busy
        } else {
            state.pin_count += 1;
            PinAttempt::Pinned
        }
    }

    /// Pin unconditionally; only the thread holding the busy bit does this
    pub(crate) fn pin(&self) {
        self.state.lock().pin_count += 1;
    }

    pub(crate) fn unpin(&self) {
        let mut state = self.state.lock();
        state.pin_count = state.pin_count.saturating_sub(1);
    }

    /// Mark the frame freed. Forcibly drops any remaining pins.
    /// Returns false if it is busy.
    pub(crate) fn try_free(&self) -> bool {
        let mut state = self.state.lock();
        if state.flags.contains(PageFlags::BUSY) {
            return false;
        }
        state.pin_count = 0;
        state.freed = true;
        true
    }

    /// Mark the frame freed while the caller holds the busy bit
    pub(crate) fn mark_freed(&self) {
        let mut state = self.state.lock();
        state.pin_count = 0;
        state.freed = true;
    }

    /// Copy bytes out of the page starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy bytes into the page starting at `offset`
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    /// Run `f` over the whole page
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// Run `f` over the whole page, mutably
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub(crate) fn zero(&self) {
        self.data.lock().fill(0);
    }

    /// Overwrite this page with the contents of `src`.
    /// Copies always run from a shadowed object up to its shadow, so the
    /// two data locks are never taken in the opposite order.
    pub(crate) fn copy_from(&self, src: &PFrame) {
        let src_data = src.data.lock();
        self.data.lock().copy_from_slice(&src_data);
    }
}

impl Drop for PFrame {
    fn drop(&mut self) {
        FRAMES_RELEASED.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Pinned Page Handle
// ============================================================================

/// A page pinned for the duration of a fault, read or write.
/// Unpins when dropped.
#[derive(Debug)]
pub struct PinnedPage {
    frame: Arc<PFrame>,
}

impl PinnedPage {
    /// Wrap a frame that the caller has already pinned
    fn adopt(frame: Arc<PFrame>) -> Self {
        Self { frame }
    }

    /// Shared handle to the underlying frame
    pub fn frame(&self) -> &Arc<PFrame> {
        &self.frame
    }
}

impl Deref for PinnedPage {
    type Target = PFrame;

    fn deref(&self) -> &PFrame {
        &self.frame
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

// ============================================================================
// Cache Operations
// ============================================================================

/// Find a resident page of `obj`, sleeping while it is busy.
/// Does not consult shadowed objects.
pub fn pframe_get_resident(obj: &Arc<MmObj>, pagenum: u32) -> Option<PinnedPage> {
    loop {
        let frame = obj.cached_page(pagenum)?;
        match frame.try_pin() {
            PinAttempt::Pinned => return Some(PinnedPage::adopt(frame)),
            PinAttempt::Busy => frame.wait_not_busy(),
            // Freed while we looked; the cache no longer holds it
            PinAttempt::Gone => {}
        }
    }
}

/// Get page `pagenum` of `obj` itself, allocating and filling it if it is
/// not resident.
pub fn pframe_get(obj: &Arc<MmObj>, pagenum: u32) -> VmResult<PinnedPage> {
    loop {
        let (frame, fresh) = obj.cached_or_alloc_page(pagenum)?;
        if fresh {
            return pframe_fill(obj, frame);
        }
        match frame.try_pin() {
            PinAttempt::Pinned => return Ok(PinnedPage::adopt(frame)),
            PinAttempt::Busy => frame.wait_not_busy(),
            PinAttempt::Gone => {}
        }
    }
}

/// Populate a freshly allocated busy frame, then publish it
fn pframe_fill(obj: &Arc<MmObj>, frame: Arc<PFrame>) -> VmResult<PinnedPage> {
    log::trace!("fill page {} of object {:?}", frame.pagenum(), obj.id());
    match obj.fill_page(&frame) {
        Ok(()) => {
            // Pin before clearing busy so reclamation cannot slip in
            frame.pin();
            frame.clear_busy();
            Ok(PinnedPage::adopt(frame))
        }
        Err(e) => {
            log::warn!(
                "fill of page {} in object {:?} failed: {}",
                frame.pagenum(),
                obj.id(),
                e
            );
            obj.discard_page(&frame);
            frame.clear_busy();
            Err(e)
        }
    }
}

/// Resolve page `pagenum` of `obj` for reading or writing.
///
/// The object's `lookup_page` handles shadow chains; if it reports the
/// page absent, a new frame is allocated in `obj`, filled and returned.
/// The page comes back pinned.
pub fn pframe_lookup(obj: &Arc<MmObj>, pagenum: u32, for_write: bool) -> VmResult<PinnedPage> {
    match obj.lookup_page(pagenum, for_write)? {
        Some(page) => Ok(page),
        None => pframe_get(obj, pagenum),
    }
}

/// Mark a page of `obj` dirty
pub fn pframe_dirty(obj: &Arc<MmObj>, page: &PFrame) -> VmResult<()> {
    obj.dirty_page(page)
}

/// Write a dirty page back through its object and clear the dirty bit.
/// Holds the busy bit for the duration of the writeback.
pub fn pframe_clean(obj: &Arc<MmObj>, frame: &PFrame) -> VmResult<()> {
    loop {
        if frame.is_freed() {
            return Ok(());
        }
        if frame.try_set_busy() {
            break;
        }
        frame.wait_not_busy();
    }

    let result = if frame.is_dirty() {
        // Clear first so a write racing with the clean re-dirties the page
        frame.clear_dirty();
        let result = obj.clean_page(frame);
        if result.is_err() {
            frame.set_dirty();
        }
        result
    } else {
        Ok(())
    };

    frame.clear_busy();
    result
}

/// Clean every dirty resident page of `obj`
pub fn pframe_sync(obj: &Arc<MmObj>) -> VmResult<()> {
    for frame in obj.resident_pages() {
        if frame.is_dirty() {
            pframe_clean(obj, &frame)?;
        }
    }
    Ok(())
}
