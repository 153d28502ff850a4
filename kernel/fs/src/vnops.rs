//! Gated vnode operations.
//!
//! Every entry point checks permissions and structural preconditions before
//! dispatching to the filesystem, so filesystems never re-check. A
//! filesystem that omits an operation reports `ENOTSUP` through the trait
//! default.

extern crate alloc;

use alloc::sync::Arc;

use pml_core::{Errno, Result};

use crate::mode::{self, S_ISGID, S_ISUID};
use crate::perm;
use crate::vnode::{DIRENT_NAME_OFFSET, DirEntry, Timespec, Vnode, VnodeAttr};
use crate::Cred;

/// Looks up `name` in `dir`.
pub fn vfs_lookup(dir: &Arc<Vnode>, name: &str, cred: &Cred) -> Result<Arc<Vnode>> {
    crate::path::lookup_child(dir, name, cred)
}

/// Copies out the vnode attributes after a read-permission check.
pub fn vfs_getattr(vp: &Vnode, cred: &Cred) -> Result<VnodeAttr> {
    perm::can_read(vp, cred, false)?;
    vp.ops.getattr(vp)?;
    Ok(vp.attr())
}

/// Reads from a file.
pub fn vfs_read(vp: &Vnode, buf: &mut [u8], offset: u64, cred: &Cred) -> Result<usize> {
    perm::can_read(vp, cred, false)?;
    if vp.is_dir() {
        return Err(Errno::EISDIR);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    vp.ops.read(vp, buf, offset)
}

/// Writes to a file.
pub fn vfs_write(vp: &Vnode, buf: &[u8], offset: u64, cred: &Cred) -> Result<usize> {
    perm::can_write(vp, cred, false)?;
    if vp.is_dir() {
        return Err(Errno::EISDIR);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    vp.ops.write(vp, buf, offset)
}

/// Flushes a file's buffers and metadata.
pub fn vfs_sync(vp: &Vnode, cred: &Cred) -> Result<()> {
    perm::can_write(vp, cred, false)?;
    vp.ops.sync(vp)
}

/// Changes permission bits.
///
/// Only the owner or root may chmod; the set-group-id bit is silently
/// cleared when the caller is not in the file's group.
pub fn vfs_chmod(vp: &Vnode, mode: u32, cred: &Cred) -> Result<()> {
    let attr = vp.attr();
    if cred.euid != 0 && cred.euid != attr.uid {
        return Err(Errno::EPERM);
    }
    let mut mode = mode & mode::FULL_PERM;
    if cred.egid != attr.gid && cred.euid != 0 {
        mode &= !S_ISGID;
    }
    vp.ops.chmod(vp, mode)
}

/// Changes ownership; set-id bits are dropped on success.
pub fn vfs_chown(vp: &Vnode, uid: u32, gid: u32, cred: &Cred) -> Result<()> {
    if uid != u32::MAX && cred.euid != 0 && cred.euid != uid {
        return Err(Errno::EPERM);
    }
    if gid != u32::MAX && cred.euid != 0 && cred.egid != gid {
        return Err(Errno::EPERM);
    }
    vp.ops.chown(vp, uid, gid)?;
    let mut attr = vp.attr.lock();
    attr.mode &= !(S_ISUID | S_ISGID);
    Ok(())
}

/// Creates a regular file or device node.
pub fn vfs_create(
    dir: &Arc<Vnode>,
    name: &str,
    mode: u32,
    rdev: u64,
    cred: &Cred,
) -> Result<Arc<Vnode>> {
    perm::can_write(dir, cred, false)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let vp = dir.ops.create(dir, name, mode, rdev, cred)?;
    dir.add_child(name, &vp);
    Ok(vp)
}

/// Creates a directory with `.` and `..` entries.
pub fn vfs_mkdir(dir: &Arc<Vnode>, name: &str, mode: u32, cred: &Cred) -> Result<Arc<Vnode>> {
    perm::can_write(dir, cred, false)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let vp = dir.ops.mkdir(dir, name, mode, cred)?;
    dir.add_child(name, &vp);
    Ok(vp)
}

/// Moves `oldname` in `olddir` to `newname` in `newdir`.
pub fn vfs_rename(
    olddir: &Arc<Vnode>,
    oldname: &str,
    newdir: &Arc<Vnode>,
    newname: &str,
    cred: &Cred,
) -> Result<()> {
    if !olddir.is_dir() || !newdir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    perm::can_write(olddir, cred, false)?;
    perm::can_write(newdir, cred, false)?;
    olddir.ops.rename(olddir, oldname, newdir, newname)?;
    if let Some(moved) = olddir.remove_child(oldname) {
        newdir.add_child(newname, &moved);
    }
    Ok(())
}

/// Creates a hard link.
pub fn vfs_link(dir: &Arc<Vnode>, vp: &Arc<Vnode>, name: &str, cred: &Cred) -> Result<()> {
    perm::can_write(dir, cred, false)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    dir.ops.link(dir, vp, name)?;
    dir.add_child(name, vp);
    Ok(())
}

/// Removes a directory entry.
pub fn vfs_unlink(dir: &Arc<Vnode>, name: &str, cred: &Cred) -> Result<()> {
    perm::can_write(dir, cred, false)?;
    dir.ops.unlink(dir, name)?;
    dir.remove_child(name);
    Ok(())
}

/// Creates a symbolic link.
pub fn vfs_symlink(dir: &Arc<Vnode>, name: &str, target: &str, cred: &Cred) -> Result<()> {
    perm::can_write(dir, cred, false)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    dir.ops.symlink(dir, name, target, cred)
}

/// Reads the next directory entry at or after `offset`.
///
/// Returns 0 at the end of the directory or the offset to pass back for the
/// following entry; fills the user-visible record length.
pub fn vfs_readdir(dir: &Vnode, entry: &mut DirEntry, offset: i64, cred: &Cred) -> Result<i64> {
    perm::can_read(dir, cred, false)?;
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let next = dir.ops.readdir(dir, entry, offset)?;
    entry.reclen = (DIRENT_NAME_OFFSET + entry.name.len() + 1) as u16;
    Ok(next)
}

/// Reads a symbolic link's target.
pub fn vfs_readlink(vp: &Vnode, buf: &mut [u8], cred: &Cred) -> Result<usize> {
    perm::can_read(vp, cred, false)?;
    if !mode::is_lnk(vp.mode()) {
        return Err(Errno::EINVAL);
    }
    vp.ops.readlink(vp, buf)
}

/// Sets a regular file's size.
pub fn vfs_truncate(vp: &Vnode, len: u64, cred: &Cred) -> Result<()> {
    perm::can_write(vp, cred, false)?;
    if !mode::is_reg(vp.mode()) {
        return Err(Errno::EINVAL);
    }
    vp.ops.truncate(vp, len)
}

/// Updates timestamps.
///
/// `None` leaves a timestamp untouched. Setting explicit times requires
/// ownership; touching to "now" only requires write access.
pub fn vfs_utime(
    vp: &Vnode,
    atime: Option<Timespec>,
    mtime: Option<Timespec>,
    now: Timespec,
    cred: &Cred,
) -> Result<()> {
    let explicit = atime.is_some() || mtime.is_some();
    if explicit {
        if cred.euid != 0 && cred.euid != vp.attr().uid {
            return Err(Errno::EPERM);
        }
    } else if perm::can_write(vp, cred, false).is_err() {
        if cred.euid != 0 && cred.euid != vp.attr().uid {
            return Err(Errno::EACCES);
        }
    }
    let atime = atime.or(Some(now));
    let mtime = mtime.or(Some(now));
    vp.ops.utime(vp, atime, mtime)
}

/// Maps a logical block to a physical block.
pub fn vfs_bmap(vp: &Vnode, block: u64) -> Result<u64> {
    vp.ops.bmap(vp, block)
}

/// Fills a fresh vnode from its on-disk inode.
pub fn vfs_fill(vp: &Arc<Vnode>) -> Result<()> {
    vp.ops.fill(vp)
}
