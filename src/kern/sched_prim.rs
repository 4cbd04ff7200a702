//! Scheduling Primitives - Wait/Wakeup
//!
//! The VM layer only ever blocks in one way: waiting for a page frame to
//! leave the busy state. The kernel supplies the actual sleep/wake through
//! the `Scheduler` trait; hosted builds fall back to a condition variable
//! and bare builds to spinning on the predicate.

use core::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Wait Event
// ============================================================================

/// Event that threads can wait on
/// As in Mach, this is an address cast to an integer
pub type WaitEvent = u64;

/// Create an event from a pointer/address
pub fn event_from_addr<T>(addr: &T) -> WaitEvent {
    addr as *const T as usize as WaitEvent
}

// ============================================================================
// Scheduler Hook
// ============================================================================

/// Sleep/wake services provided by the kernel
pub trait Scheduler: Sync {
    /// Block the calling thread on `event` for as long as `still_waiting`
    /// returns true. The predicate must be re-checked after every wakeup.
    fn block(&self, event: WaitEvent, still_waiting: &dyn Fn() -> bool);

    /// Wake every thread blocked on `event`
    fn wakeup(&self, event: WaitEvent);
}

static SCHEDULER: spin::Once<&'static dyn Scheduler> = spin::Once::new();

/// Install the kernel scheduler. Returns false if one was already installed.
pub fn install(scheduler: &'static dyn Scheduler) -> bool {
    let mut installed = false;
    SCHEDULER.call_once(|| {
        installed = true;
        scheduler
    });
    installed
}

fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(s) => *s,
        None => &FALLBACK,
    }
}

#[cfg(any(test, feature = "std"))]
static FALLBACK: hosted::CondvarScheduler = hosted::CondvarScheduler::new();

#[cfg(not(any(test, feature = "std")))]
static FALLBACK: SpinScheduler = SpinScheduler;

/// Spins on the predicate; used only before a real scheduler is installed
pub struct SpinScheduler;

impl Scheduler for SpinScheduler {
    fn block(&self, _event: WaitEvent, still_waiting: &dyn Fn() -> bool) {
        while still_waiting() {
            core::hint::spin_loop();
        }
    }

    fn wakeup(&self, _event: WaitEvent) {}
}

#[cfg(any(test, feature = "std"))]
mod hosted {
    use super::{Scheduler, WaitEvent};
    use std::sync::{Condvar, Mutex};

    /// One condition variable shared by all events; waiters re-check
    /// their own predicate, so unrelated wakeups are harmless.
    pub struct CondvarScheduler {
        lock: Mutex<()>,
        cond: Condvar,
    }

    impl CondvarScheduler {
        pub const fn new() -> Self {
            Self {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }
        }
    }

    impl Scheduler for CondvarScheduler {
        fn block(&self, _event: WaitEvent, still_waiting: &dyn Fn() -> bool) {
            let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            while still_waiting() {
                guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
            }
        }

        fn wakeup(&self, _event: WaitEvent) {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.cond.notify_all();
        }
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Queue of threads waiting on one resource
#[derive(Debug, Default)]
pub struct WaitQueue {
    /// Threads currently asleep here
    sleepers: AtomicU32,
}

impl WaitQueue {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            sleepers: AtomicU32::new(0),
        }
    }

    fn event(&self) -> WaitEvent {
        event_from_addr(self)
    }

    /// Sleep until `still_waiting` turns false
    pub fn sleep_while(&self, still_waiting: impl Fn() -> bool) {
        if !still_waiting() {
            return;
        }
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        scheduler().block(self.event(), &still_waiting);
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake every sleeper. Callers change the awaited state first.
    pub fn broadcast(&self) {
        scheduler().wakeup(self.event());
    }

    /// Number of threads currently asleep on this queue
    pub fn sleepers(&self) -> u32 {
        self.sleepers.load(Ordering::SeqCst)
    }
}
