//! Kernel error codes.
//!
//! Kernel functions return `Result<T, Errno>`; the syscall layer encodes a
//! failure as `-errno` in the return register, which is the only place the
//! numeric values become visible to user space.

/// POSIX-style error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Interrupted system call.
    EINTR = 4,
    /// I/O error.
    EIO = 5,
    /// No such device or address.
    ENXIO = 6,
    /// Argument list too long.
    E2BIG = 7,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address.
    EFAULT = 14,
    /// Block device required.
    ENOTBLK = 15,
    /// Device or resource busy.
    EBUSY = 16,
    /// File exists.
    EEXIST = 17,
    /// Cross-device link.
    EXDEV = 18,
    /// No such device.
    ENODEV = 19,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files in system.
    ENFILE = 23,
    /// Too many open files.
    EMFILE = 24,
    /// Inappropriate ioctl for device.
    ENOTTY = 25,
    /// File too large.
    EFBIG = 27,
    /// No space left on device.
    ENOSPC = 28,
    /// Illegal seek.
    ESPIPE = 29,
    /// Read-only file system.
    EROFS = 30,
    /// Too many links.
    EMLINK = 31,
    /// Broken pipe.
    EPIPE = 32,
    /// Math result not representable.
    ERANGE = 34,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Function not implemented.
    ENOSYS = 38,
    /// Directory not empty.
    ENOTEMPTY = 39,
    /// Too many levels of symbolic links.
    ELOOP = 40,
    /// Value too large for defined data type.
    EOVERFLOW = 75,
    /// Quota exceeded.
    EDQUOT = 122,
    /// Structure needs cleaning.
    EUCLEAN = 117,
    /// Operation not supported.
    ENOTSUP = 95,
}

impl Errno {
    /// Returns the numeric error code exposed to user space.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Encodes a syscall result as the raw return-register value.
    pub const fn as_ret(self) -> isize {
        -(self as i32 as isize)
    }
}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, Errno>;

/// Encodes a `Result<isize>` into the syscall return convention.
pub fn encode_ret(res: Result<isize>) -> isize {
    match res {
        Ok(v) => v,
        Err(e) => e.as_ret(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_abi() {
        assert_eq!(Errno::ENOENT.code(), 2);
        assert_eq!(Errno::EUCLEAN.code(), 117);
        assert_eq!(Errno::ENOTSUP.code(), 95);
    }

    #[test]
    fn encode_negates_errors() {
        assert_eq!(encode_ret(Ok(7)), 7);
        assert_eq!(encode_ret(Err(Errno::EBADF)), -9);
    }
}
