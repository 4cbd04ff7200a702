//! Error type for the VM subsystem

use thiserror::Error;

use crate::errno;

/// VM operation errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Misaligned address, zero length, bad flag combination, out-of-range target
    #[error("invalid argument")]
    InvalidArgument,

    /// Could not allocate a vmarea, memory object or page frame
    #[error("out of memory")]
    NoMemory,

    /// No free virtual range large enough
    #[error("no free virtual range")]
    NoSpace,

    /// Descriptor is not open
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Descriptor mode does not permit the requested mapping
    #[error("access denied")]
    AccessDenied,

    /// Address is not covered by any vmarea
    #[error("address not mapped")]
    NotMapped,

    /// Access not permitted by the vmarea's protection
    #[error("protection fault")]
    ProtectionFault,

    /// Vnode cannot be memory mapped
    #[error("vnode does not support mapping")]
    NoDevice,

    /// Backing file read or write failed
    #[error("I/O error")]
    Io,
}

impl VmError {
    /// Convert to POSIX errno value
    pub fn errno(&self) -> i32 {
        match self {
            VmError::InvalidArgument => errno::EINVAL,
            VmError::NoMemory | VmError::NoSpace => errno::ENOMEM,
            VmError::BadDescriptor => errno::EBADF,
            VmError::AccessDenied => errno::EACCES,
            VmError::NotMapped | VmError::ProtectionFault => errno::EFAULT,
            VmError::NoDevice => errno::ENODEV,
            VmError::Io => errno::EIO,
        }
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
