//! POSIX errno values returned by the VM system calls

pub const EIO: i32 = 5; // I/O error
pub const EBADF: i32 = 9; // Bad file number
pub const ENOMEM: i32 = 12; // Out of memory
pub const EACCES: i32 = 13; // Permission denied
pub const EFAULT: i32 = 14; // Bad address
pub const ENODEV: i32 = 19; // No such device
pub const EINVAL: i32 = 22; // Invalid argument
