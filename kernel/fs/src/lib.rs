//! The PML virtual filesystem layer.
//!
//! A [`Vnode`](vnode::Vnode) abstracts an on-disk inode; filesystems plug in
//! through the [`VnodeOps`](vnode::VnodeOps) operations table. Path
//! resolution, permission gating and the file-descriptor tables live here;
//! the filesystems themselves plug in from their own crates.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod fd;
pub mod mode;
pub mod path;
pub mod perm;
pub mod vnode;
pub mod vnops;

pub use self::block::BlockDevice;
pub use self::perm::Cred;
pub use self::vnode::{DirEntry, Filesystem, Mount, Timespec, Vnode, VnodeAttr, VnodeOps, VnodeType};

use bitflags::bitflags;

bitflags! {
    /// File open flags as stored in the system fd table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRONLY = 1 << 0;
        /// Open for reading and writing.
        const RDWR = 1 << 1;
        /// Append on each write.
        const APPEND = 1 << 2;
        /// Create the file if it does not exist.
        const CREAT = 1 << 3;
        /// With `CREAT`, fail if the file exists.
        const EXCL = 1 << 4;
        /// Fail if the final component is a symbolic link.
        const NOFOLLOW = 1 << 5;
        /// Require (or with `CREAT`, create) a directory.
        const DIRECTORY = 1 << 6;
        /// Truncate to zero length on open.
        const TRUNC = 1 << 7;
        /// Close the descriptor across `execve`.
        const CLOEXEC = 1 << 8;
        /// Non-blocking I/O.
        const NONBLOCK = 1 << 9;
    }
}

impl OpenFlags {
    /// Whether the flags permit reading.
    pub fn readable(self) -> bool {
        !self.contains(Self::WRONLY) || self.contains(Self::RDWR)
    }

    /// Whether the flags permit writing.
    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

bitflags! {
    /// Mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Filesystem is mounted read-only.
        const RDONLY = 1 << 0;
        /// Ignore set-id bits.
        const NOSUID = 1 << 1;
        /// Disallow access to device files.
        const NODEV = 1 << 2;
        /// Disallow program execution.
        const NOEXEC = 1 << 3;
        /// Write through synchronously.
        const SYNCHRONOUS = 1 << 4;
    }
}
