//! Virtual Memory Subsystem
//!
//! Provides per-process address spaces and demand paging:
//! - vm_page: page-frame cache (busy/dirty/pinned frames per object)
//! - vm_object: memory objects (anonymous, shadow, vnode)
//! - vm_map: address spaces and vmareas
//! - vm_fault: page-fault resolution
//! - vm_user: mmap/munmap/brk
//! - pmap: hardware translation boundary
//! - vnode: file-layer boundary

pub mod pmap;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_user;
pub mod vnode;

pub use pmap::{NullPmap, Pmap, SoftPmap};
pub use vm_fault::{handle_pagefault, FaultCause};
pub use vm_map::{Direction, MapFlags, VmArea, VmMap, VmProt};
pub use vm_object::{MmObj, ObjKind};
pub use vm_page::{pframe_lookup, PFrame, PageFlags, PinnedPage};
pub use vm_user::{do_brk, do_mmap, do_munmap, syscall_ret};
pub use vnode::{FileMode, FileTable, OpenFile, Vnode, VnodeCache};
