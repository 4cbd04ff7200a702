//! Core identifiers shared across the VM subsystem

use core::sync::atomic::{AtomicU64, Ordering};

/// Address space ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

/// VM area ID, stable across split/shrink/grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmAreaId(pub u64);

/// Memory object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmObjId(pub u64);

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_AREA_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OBJ_ID: AtomicU64 = AtomicU64::new(1);

impl VmMapId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl VmAreaId {
    pub(crate) fn next() -> Self {
        Self(NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl MmObjId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJ_ID.fetch_add(1, Ordering::Relaxed))
    }
}
