//! Vnodes, mounts and the per-mount vnode cache.
//!
//! A vnode owns strong references to its children through the name map and a
//! weak reference to its parent; the mount's ino cache also holds weak
//! references. Dropping the last strong reference therefore tears a subtree
//! down leaf-first without reference cycles, which is the same shape the
//! original reference-counted design reached by clearing the children map
//! before recursing.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};

use crate::{Cred, MountFlags};

/// Type of a vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VnodeType {
    /// Unknown type.
    #[default]
    None,
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Symbolic link.
    Symlink,
    /// Socket.
    Socket,
    /// Named pipe.
    Fifo,
}

impl VnodeType {
    /// Derives the type from the file-type bits of `mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & crate::mode::S_IFMT {
            crate::mode::S_IFREG => Self::Regular,
            crate::mode::S_IFDIR => Self::Directory,
            crate::mode::S_IFCHR => Self::CharDevice,
            crate::mode::S_IFBLK => Self::BlockDevice,
            crate::mode::S_IFLNK => Self::Symlink,
            crate::mode::S_IFSOCK => Self::Socket,
            crate::mode::S_IFIFO => Self::Fifo,
            _ => Self::None,
        }
    }
}

/// Seconds/nanoseconds timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: i64,
}

/// Mutable attributes of a vnode, filled by the filesystem's `fill` op.
#[derive(Debug, Clone, Default)]
pub struct VnodeAttr {
    /// Vnode type.
    pub vtype: VnodeType,
    /// File type and permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Number of hard links.
    pub nlink: u32,
    /// Device numbers for device nodes.
    pub rdev: u64,
    /// Last access time.
    pub atime: Timespec,
    /// Last modification time.
    pub mtime: Timespec,
    /// Last status change time.
    pub ctime: Timespec,
    /// File size in bytes.
    pub size: u64,
    /// Number of blocks allocated.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// A directory entry returned by `readdir`.
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    /// Inode number.
    pub ino: u64,
    /// Entry type.
    pub vtype: VnodeType,
    /// Record length as reported to user space.
    pub reclen: u16,
    /// Entry name.
    pub name: String,
}

/// Byte offset of the name field in the user-visible dirent layout.
pub const DIRENT_NAME_OFFSET: usize = 12;

/// Operations a filesystem provides for a vnode.
///
/// Every operation defaults to `ENOTSUP`, matching a null entry in a C
/// operations table; filesystems override what they support.
#[allow(unused_variables)]
pub trait VnodeOps: Send + Sync {
    /// Looks up `name` in the directory `dir` and returns a filled vnode.
    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
        Err(Errno::ENOTSUP)
    }

    /// Refreshes attribute data before a `stat`-style query.
    fn getattr(&self, vp: &Vnode) -> Result<()> {
        Ok(())
    }

    /// Reads from the file at `offset`.
    fn read(&self, vp: &Vnode, buf: &mut [u8], offset: u64) -> Result<usize> {
        Err(Errno::ENOTSUP)
    }

    /// Writes to the file at `offset`.
    fn write(&self, vp: &Vnode, buf: &[u8], offset: u64) -> Result<usize> {
        Err(Errno::ENOTSUP)
    }

    /// Flushes buffered data and metadata for this vnode.
    fn sync(&self, vp: &Vnode) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Changes permission bits.
    fn chmod(&self, vp: &Vnode, mode: u32) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Changes ownership.
    fn chown(&self, vp: &Vnode, uid: u32, gid: u32) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Creates a regular file or device node in `dir`, owned per `cred`.
    fn create(
        &self,
        dir: &Arc<Vnode>,
        name: &str,
        mode: u32,
        rdev: u64,
        cred: &Cred,
    ) -> Result<Arc<Vnode>> {
        Err(Errno::ENOTSUP)
    }

    /// Creates a directory in `dir`, populating `.` and `..`.
    fn mkdir(&self, dir: &Arc<Vnode>, name: &str, mode: u32, cred: &Cred) -> Result<Arc<Vnode>> {
        Err(Errno::ENOTSUP)
    }

    /// Moves `oldname` in `olddir` to `newname` in `newdir`.
    fn rename(
        &self,
        olddir: &Arc<Vnode>,
        oldname: &str,
        newdir: &Arc<Vnode>,
        newname: &str,
    ) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Creates a hard link to `vp` named `name` in `dir`.
    fn link(&self, dir: &Arc<Vnode>, vp: &Arc<Vnode>, name: &str) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Removes the entry `name` from `dir`.
    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Creates a symbolic link to `target` named `name` in `dir`.
    fn symlink(&self, dir: &Arc<Vnode>, name: &str, target: &str, cred: &Cred) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Reads the entry at or after `offset`.
    ///
    /// Returns 0 at end of directory, or an opaque positive offset to pass
    /// back for the next entry.
    fn readdir(&self, dir: &Vnode, entry: &mut DirEntry, offset: i64) -> Result<i64> {
        Err(Errno::ENOTSUP)
    }

    /// Reads the target of a symbolic link.
    fn readlink(&self, vp: &Vnode, buf: &mut [u8]) -> Result<usize> {
        Err(Errno::ENOTSUP)
    }

    /// Sets the file size, zero-filling any extension.
    fn truncate(&self, vp: &Vnode, len: u64) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Updates access and modification timestamps.
    fn utime(&self, vp: &Vnode, atime: Option<Timespec>, mtime: Option<Timespec>) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Maps a logical block number to a physical block number.
    fn bmap(&self, vp: &Vnode, block: u64) -> Result<u64> {
        Err(Errno::ENOTSUP)
    }

    /// Fills the vnode attributes from the on-disk inode `vp.ino`.
    fn fill(&self, vp: &Arc<Vnode>) -> Result<()> {
        Err(Errno::ENOTSUP)
    }

    /// Device control requests.
    fn ioctl(&self, vp: &Vnode, req: u64, arg: usize) -> Result<isize> {
        Err(Errno::ENOTTY)
    }

    /// Releases filesystem-private state; called when the vnode dies.
    fn dealloc(&self, vp: &Vnode) {}
}

/// A vnode: the VFS view of an inode.
pub struct Vnode {
    /// Inode number within the owning filesystem.
    pub ino: u64,
    /// Filesystem operations for this vnode.
    pub ops: Box<dyn VnodeOps>,
    /// Owning mount, if any (anonymous vnodes such as pipes have none).
    pub mount: Option<Arc<Mount>>,
    /// Attributes filled from the on-disk inode.
    pub attr: SpinLock<VnodeAttr>,
    /// Parent directory, weak to keep the graph acyclic.
    pub parent: SpinLock<Option<Weak<Vnode>>>,
    /// Resolved children by name; entries hold strong references.
    pub children: SpinLock<BTreeMap<String, Arc<Vnode>>>,
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode").field("ino", &self.ino).finish()
    }
}

impl PartialEq for Vnode {
    fn eq(&self, other: &Self) -> bool {
        self.ino == other.ino
    }
}

impl Vnode {
    /// Allocates a vnode with the given operations table.
    pub fn new(ino: u64, ops: Box<dyn VnodeOps>, mount: Option<Arc<Mount>>) -> Arc<Self> {
        Arc::new(Self {
            ino,
            ops,
            mount,
            attr: SpinLock::new(VnodeAttr::default()),
            parent: SpinLock::new(None),
            children: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Snapshot of the attributes.
    pub fn attr(&self) -> VnodeAttr {
        self.attr.lock().clone()
    }

    /// Shorthand for the file mode.
    pub fn mode(&self) -> u32 {
        self.attr.lock().mode
    }

    /// Whether this vnode is a directory.
    pub fn is_dir(&self) -> bool {
        crate::mode::is_dir(self.mode())
    }

    /// Upgraded parent reference, if the parent is still alive.
    pub fn parent_vnode(&self) -> Option<Arc<Vnode>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Records `parent` as this vnode's parent directory.
    pub fn set_parent(&self, parent: &Arc<Vnode>) {
        *self.parent.lock() = Some(Arc::downgrade(parent));
    }

    /// Looks up a resolved child by name.
    pub fn cached_child(&self, name: &str) -> Option<Arc<Vnode>> {
        self.children.lock().get(name).cloned()
    }

    /// Inserts a resolved child into the name map.
    pub fn add_child(self: &Arc<Self>, name: &str, child: &Arc<Vnode>) {
        child.set_parent(self);
        self.children.lock().insert(String::from(name), child.clone());
    }

    /// Drops a child from the name map (after unlink or rename).
    pub fn remove_child(&self, name: &str) -> Option<Arc<Vnode>> {
        self.children.lock().remove(name)
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        if let Some(mount) = &self.mount {
            mount.cache_remove(self.ino);
        }
        self.ops.dealloc(self);
    }
}

/// A mounted filesystem instance's hooks.
pub trait Filesystem: Send + Sync {
    /// Short filesystem type name ("ext2", "devfs", ...).
    fn name(&self) -> &'static str;

    /// Writes any dirty state back to the device.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Releases the instance at unmount.
    fn unmount(&self) -> Result<()> {
        Ok(())
    }
}

/// A mounted filesystem instance.
pub struct Mount {
    /// Name of the backing device.
    pub device: String,
    /// Mount flags.
    pub flags: MountFlags,
    /// Root vnode; cleared by unmount to break the mount<->root cycle.
    pub root: SpinLock<Option<Arc<Vnode>>>,
    /// The filesystem instance behind this mount.
    pub fs: SpinLock<Option<Arc<dyn Filesystem>>>,
    /// ino -> vnode cache; weak so cached vnodes can still die.
    vcache: SpinLock<BTreeMap<u64, Weak<Vnode>>>,
}

impl Mount {
    /// Creates an empty mount record for `device`.
    pub fn new(device: &str, flags: MountFlags) -> Arc<Self> {
        Arc::new(Self {
            device: String::from(device),
            flags,
            root: SpinLock::new(None),
            fs: SpinLock::new(None),
            vcache: SpinLock::new(BTreeMap::new()),
        })
    }

    /// The root vnode of this mount.
    pub fn root_vnode(&self) -> Result<Arc<Vnode>> {
        self.root.lock().clone().ok_or(Errno::ENOENT)
    }

    /// Looks up a live vnode in the ino cache.
    pub fn cache_lookup(&self, ino: u64) -> Option<Arc<Vnode>> {
        self.vcache.lock().get(&ino).and_then(Weak::upgrade)
    }

    /// Publishes a vnode in the ino cache.
    ///
    /// There is exactly one cache entry per `(mount, ino)`; inserting again
    /// replaces a dead entry.
    pub fn cache_insert(&self, vp: &Arc<Vnode>) {
        self.vcache.lock().insert(vp.ino, Arc::downgrade(vp));
    }

    /// Removes a vnode from the ino cache.
    pub fn cache_remove(&self, ino: u64) {
        let mut cache = self.vcache.lock();
        if let Some(slot) = cache.get(&ino) {
            if slot.upgrade().is_none() {
                cache.remove(&ino);
            }
        }
    }

    /// Drops the root reference at unmount.
    pub fn clear_root(&self) {
        self.root.lock().take();
    }
}

/// Gets a vnode for `(mount, ino)`, constructing and filling it on miss.
///
/// `make_ops` builds the operations table only when the cache misses.
pub fn get_vnode(
    mount: &Arc<Mount>,
    ino: u64,
    make_ops: impl FnOnce() -> Box<dyn VnodeOps>,
) -> Result<Arc<Vnode>> {
    if let Some(vp) = mount.cache_lookup(ino) {
        return Ok(vp);
    }
    let vp = Vnode::new(ino, make_ops(), Some(mount.clone()));
    vp.ops.fill(&vp)?;
    mount.cache_insert(&vp);
    Ok(vp)
}
