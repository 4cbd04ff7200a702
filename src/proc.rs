//! Per-process VM state
//!
//! `ProcVm` is the slice of a process the VM subsystem owns: the address
//! space, the heap break, and handles to the process's descriptor table
//! and hardware translation map. All address-space mutation goes through
//! the single `aspace` lock.

use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

use crate::config::VmLayout;
use crate::vm::pmap::Pmap;
use crate::vm::vm_map::VmMap;
use crate::vm::vm_object::MmObj;
use crate::vm::vnode::FileTable;

/// Address space plus heap break
#[derive(Debug)]
pub struct AddrSpace {
    pub map: VmMap,
    /// Break at program load; the heap never shrinks below it
    pub start_brk: usize,
    /// Current break
    pub brk: usize,
}

/// VM state of one process
pub struct ProcVm {
    pid: u32,
    aspace: Mutex<AddrSpace>,
    files: Arc<dyn FileTable>,
    pmap: Arc<dyn Pmap>,
}

impl ProcVm {
    /// Create a process with an empty address space
    pub fn new(pid: u32, layout: VmLayout, files: Arc<dyn FileTable>, pmap: Arc<dyn Pmap>) -> Self {
        let mut map = VmMap::with_layout(layout);
        map.set_owner(pid);
        Self {
            pid,
            aspace: Mutex::new(AddrSpace {
                map,
                start_brk: 0,
                brk: 0,
            }),
            files,
            pmap,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Set the initial break, just past the loaded program's data
    pub fn set_brk_base(&self, start_brk: usize) {
        let mut aspace = self.aspace.lock();
        aspace.start_brk = start_brk;
        aspace.brk = start_brk;
    }

    /// Lock the address space
    pub fn lock(&self) -> MutexGuard<'_, AddrSpace> {
        self.aspace.lock()
    }

    pub fn files(&self) -> &Arc<dyn FileTable> {
        &self.files
    }

    pub fn pmap(&self) -> &Arc<dyn Pmap> {
        &self.pmap
    }

    /// Duplicate this address space for a child process.
    ///
    /// Private areas get copy-on-write semantics: the old object is frozen
    /// under two new shadows, one for each process. Shared areas are
    /// shared by reference. Every parent translation is dropped so the
    /// next access in the parent faults through the new shadow.
    pub fn fork(&self, child_pid: u32, files: Arc<dyn FileTable>, pmap: Arc<dyn Pmap>) -> ProcVm {
        let mut parent = self.aspace.lock();
        let mut child_map = parent.map.clone_map();
        child_map.set_owner(child_pid);

        for (parent_area, child_area) in parent.map.areas_mut().zip(child_map.areas_mut()) {
            let Some(obj) = parent_area.obj().cloned() else {
                continue;
            };
            if parent_area.is_private() {
                let parent_shadow = MmObj::shadow_create(&obj);
                let child_shadow = MmObj::shadow_create(&obj);
                if let Some(old) = parent_area.detach() {
                    old.put();
                }
                parent_area.attach(parent_shadow);
                child_area.attach(child_shadow);
            } else {
                obj.reference();
                child_area.attach(obj);
            }
        }

        let layout = parent.map.layout();
        self.pmap
            .unmap_range(layout.user_mem_low, layout.user_mem_high);
        self.pmap.flush_range(
            layout.user_mem_low,
            crate::config::pages_for(layout.user_mem_high - layout.user_mem_low),
        );

        log::debug!(
            "fork {} -> {}: {} areas",
            self.pid,
            child_pid,
            child_map.len()
        );

        ProcVm {
            pid: child_pid,
            aspace: Mutex::new(AddrSpace {
                map: child_map,
                start_brk: parent.start_brk,
                brk: parent.brk,
            }),
            files,
            pmap,
        }
    }

    /// Tear down the address space
    pub fn exit(self) {
        log::debug!("process {} releasing address space", self.pid);
        let aspace = self.aspace.into_inner();
        let layout = aspace.map.layout();
        aspace.map.destroy();
        self.pmap
            .unmap_range(layout.user_mem_low, layout.user_mem_high);
    }
}
