//! kernvm - virtual memory subsystem for a teaching kernel
//!
//! This crate manages per-process address spaces, the memory objects that
//! back them and the page-frame cache that makes pages resident on demand.
//! Private mappings are copy-on-write through shadow objects; file mappings
//! delegate to an external file layer through the `Vnode` boundary.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod errno;
pub mod error;
pub mod types;

pub mod console;
pub mod kern;
pub mod logging;
pub mod proc;
pub mod vm;

pub use config::{VmLayout, PAGE_SHIFT, PAGE_SIZE};
pub use error::{VmError, VmResult};
pub use proc::ProcVm;
pub use vm::vm_map::{Direction, VmArea, VmMap};
pub use vm::vm_object::MmObj;
pub use vm::vm_page::PFrame;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "kernvm";
