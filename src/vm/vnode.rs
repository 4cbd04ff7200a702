//! File Layer Boundary
//!
//! The VM subsystem never looks inside a file system. It needs a file to
//! read and write bytes at an offset, to hand out its page-cache object,
//! and to be found through a process's descriptor table.

use alloc::sync::{Arc, Weak};
use bitflags::bitflags;

use crate::error::VmResult;
use crate::vm::vm_object::MmObj;

/// A file as seen by the VM subsystem
pub trait Vnode: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read, short at end of file.
    fn read(&self, offset: usize, buf: &mut [u8]) -> VmResult<usize>;

    /// Write `buf` at `offset`. Returns the number of bytes written.
    fn write(&self, offset: usize, buf: &[u8]) -> VmResult<usize>;

    /// Current length of the file in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A page of this file's cache is about to be modified.
    /// File systems that reserve blocks lazily allocate here.
    fn dirty_page(&self, _pagenum: u32) -> VmResult<()> {
        Ok(())
    }

    /// The page-cache object of this file, with one reference taken for
    /// the caller. Files that cannot be mapped return `NoDevice`.
    fn mmobj(&self) -> VmResult<Arc<MmObj>>;
}

/// Per-file holder for the page-cache object, created on first mapping
pub struct VnodeCache {
    obj: spin::Once<Arc<MmObj>>,
}

impl VnodeCache {
    pub const fn new() -> Self {
        Self {
            obj: spin::Once::new(),
        }
    }

    /// Page-cache object of `vnode` with a reference taken for the caller
    pub fn mmobj(&self, vnode: Weak<dyn Vnode>) -> Arc<MmObj> {
        let obj = self.obj.call_once(|| MmObj::vnode_create(vnode));
        obj.reference();
        Arc::clone(obj)
    }

    /// The cache object, if the file has ever been mapped
    pub fn get(&self) -> Option<&Arc<MmObj>> {
        self.obj.get()
    }
}

// ============================================================================
// Descriptor Table
// ============================================================================

bitflags! {
    /// Access mode of an open file
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const APPEND = 0x4;
    }
}

/// An open file description
#[derive(Clone)]
pub struct OpenFile {
    pub mode: FileMode,
    pub vnode: Arc<dyn Vnode>,
}

/// A process's file descriptor table
pub trait FileTable: Send + Sync {
    /// Look up an open descriptor
    fn get(&self, fd: i32) -> Option<OpenFile>;
}

/// Descriptor table with nothing open
pub struct NoFiles;

impl FileTable for NoFiles {
    fn get(&self, _fd: i32) -> Option<OpenFile> {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{pattern, MemFile};
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::vm::vm_object::ObjKind;
    use crate::vm::vm_page::{pframe_clean, pframe_dirty, pframe_lookup, pframe_sync};

    #[test]
    fn test_cache_object_is_shared() {
        let file = MemFile::new(b"hello");
        let a = file.mmobj().unwrap();
        let b = file.mmobj().unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.kind(), ObjKind::Vnode);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn test_fill_reads_file_and_zero_pads() {
        let file = MemFile::new(b"hello");
        let obj = file.mmobj().unwrap();
        let page = pframe_lookup(&obj, 0, false).unwrap();
        let mut buf = [0xffu8; 8];
        page.read(0, &mut buf);
        assert_eq!(&buf, b"hello\0\0\0");
    }

    #[test]
    fn test_clean_writes_back() {
        let file = MemFile::new(&[0u8; 16]);
        let obj = file.mmobj().unwrap();
        let page = pframe_lookup(&obj, 0, true).unwrap();
        pframe_dirty(&obj, &page).unwrap();
        page.write(0, b"dirty");
        assert_eq!(file.dirtied.load(core::sync::atomic::Ordering::SeqCst), 1);

        pframe_clean(&obj, &page).unwrap();
        assert!(!page.is_dirty());
        assert_eq!(&file.contents.lock()[..5], b"dirty");
    }

    #[test]
    fn test_clean_keeps_file_length() {
        let file = MemFile::new(b"hello");
        let obj = file.mmobj().unwrap();
        let page = pframe_lookup(&obj, 0, true).unwrap();
        pframe_dirty(&obj, &page).unwrap();
        page.write(0, b"J");

        pframe_clean(&obj, &page).unwrap();
        assert_eq!(&file.contents.lock()[..], b"Jello");
        assert_eq!(file.len(), 5);
    }

    #[test]
    fn test_clean_past_end_of_file_writes_nothing() {
        let file = MemFile::new(b"short");
        let obj = file.mmobj().unwrap();
        let page = pframe_lookup(&obj, 3, true).unwrap();
        pframe_dirty(&obj, &page).unwrap();
        page.write(0, b"beyond");

        pframe_clean(&obj, &page).unwrap();
        assert!(!page.is_dirty());
        assert_eq!(file.writes.load(core::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(&file.contents.lock()[..], b"short");
    }

    #[test]
    fn test_sync_cleans_every_dirty_page() {
        let file = MemFile::new(&pattern(3));
        let obj = file.mmobj().unwrap();
        for pagenum in [0u32, 2] {
            let page = pframe_lookup(&obj, pagenum, true).unwrap();
            pframe_dirty(&obj, &page).unwrap();
            page.write(0, b"synced");
        }
        // Resident but clean
        pframe_lookup(&obj, 1, false).unwrap();
        assert_eq!(obj.resident_count(), 3);

        pframe_sync(&obj).unwrap();
        assert!(obj.resident_pages().iter().all(|f| !f.is_dirty()));
        assert_eq!(file.writes.load(core::sync::atomic::Ordering::SeqCst), 2);

        let contents = file.contents.lock();
        assert_eq!(&contents[..6], b"synced");
        assert_eq!(contents[PAGE_SIZE], 2);
        assert_eq!(&contents[2 * PAGE_SIZE..2 * PAGE_SIZE + 6], b"synced");
        assert_eq!(contents.len(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_last_put_evicts_but_keeps_object() {
        let file = MemFile::new(&[7u8; 32]);
        let obj = file.mmobj().unwrap();
        {
            let page = pframe_lookup(&obj, 0, true).unwrap();
            pframe_dirty(&obj, &page).unwrap();
            page.write(0, b"xy");
        }
        assert_eq!(obj.resident_count(), 1);

        obj.put();
        assert_eq!(obj.resident_count(), 0);
        assert!(obj.is_alive());
        assert_eq!(&file.contents.lock()[..3], &[b'x', b'y', 7]);

        // Mapping again reuses the same object
        let again = file.mmobj().unwrap();
        assert_eq!(again.id(), obj.id());
        assert_eq!(file.cache_obj().map(|o| o.id()), Some(obj.id()));
    }
}
