//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use kernvm::vm::{FileMode, FileTable, MmObj, OpenFile, SoftPmap, Vnode, VnodeCache};
use kernvm::{ProcVm, VmLayout, VmResult, PAGE_SIZE};

pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANON: u32 = 0x20;

/// A file held entirely in memory
pub struct RamFile {
    me: Weak<RamFile>,
    pub data: Mutex<Vec<u8>>,
    cache: VnodeCache,
}

impl RamFile {
    pub fn new(data: Vec<u8>) -> Arc<RamFile> {
        Arc::new_cyclic(|me| RamFile {
            me: me.clone(),
            data: Mutex::new(data),
            cache: VnodeCache::new(),
        })
    }

    /// One page per byte value, starting at 1
    pub fn striped(pages: usize) -> Arc<RamFile> {
        Self::new((0..pages * PAGE_SIZE).map(|i| (i / PAGE_SIZE + 1) as u8).collect())
    }
}

impl Vnode for RamFile {
    fn read(&self, offset: usize, buf: &mut [u8]) -> VmResult<usize> {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> VmResult<usize> {
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn mmobj(&self) -> VmResult<Arc<MmObj>> {
        let me: Weak<dyn Vnode> = self.me.clone();
        Ok(self.cache.mmobj(me))
    }
}

/// Descriptor table backed by a map
#[derive(Default)]
pub struct FdTable {
    files: Mutex<BTreeMap<i32, OpenFile>>,
}

impl FdTable {
    pub fn open(&self, fd: i32, mode: FileMode, vnode: Arc<dyn Vnode>) {
        self.files.lock().unwrap().insert(fd, OpenFile { mode, vnode });
    }
}

impl FileTable for FdTable {
    fn get(&self, fd: i32) -> Option<OpenFile> {
        self.files.lock().unwrap().get(&fd).cloned()
    }
}

/// A process with an empty address space, its descriptor table and pmap
pub fn process(pid: u32) -> (ProcVm, Arc<FdTable>, Arc<SoftPmap>) {
    let files = Arc::new(FdTable::default());
    let pmap = Arc::new(SoftPmap::new());
    let proc = ProcVm::new(pid, VmLayout::default(), files.clone(), pmap.clone());
    (proc, files, pmap)
}
