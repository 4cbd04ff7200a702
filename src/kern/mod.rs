//! Kernel services the VM subsystem depends on
//!
//! - sched_prim: wait/wakeup used by busy page frames

pub mod sched_prim;

pub use sched_prim::{Scheduler, WaitEvent, WaitQueue};
