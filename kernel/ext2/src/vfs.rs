//! VFS adapter: exposes an [`Ext2Fs`] instance as vnode operations.
//!
//! The engine sits behind one lock per mounted instance; every vnode holds
//! an operations object carrying the shared instance plus the open-file
//! state for that inode.

use alloc::boxed::Box;
use alloc::sync::Arc;

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};
use pml_fs::vnode::{get_vnode, DirEntry, Filesystem, Mount, Timespec, Vnode, VnodeOps, VnodeType};
use pml_fs::{BlockDevice, Cred, MountFlags};

use crate::dir::dir_type;
use crate::file::Ext2File;
use crate::inode::Ext2Inode;
use crate::{Ext2Fs, EXT2_ROOT_INO, EXT2_SUPER_OFFSET, FLUSH_VALID};

/// A mounted ext2 instance shared by all of its vnodes.
pub struct Ext2Filesystem {
    fs: SpinLock<Ext2Fs>,
}

impl Ext2Filesystem {
    /// Runs a closure with the locked engine.
    pub fn with<R>(&self, f: impl FnOnce(&mut Ext2Fs) -> R) -> R {
        f(&mut self.fs.lock())
    }

    /// Installs the timestamp source used for inode times.
    pub fn set_clock(&self, clock: fn() -> u32) {
        self.fs.lock().clock = clock;
    }
}

impl Filesystem for Ext2Filesystem {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn flush(&self) -> Result<()> {
        self.with(|fs| {
            if fs.mflags.contains(MountFlags::RDONLY) {
                return Ok(());
            }
            fs.flush(FLUSH_VALID)
        })
    }

    fn unmount(&self) -> Result<()> {
        self.with(|fs| fs.close())
    }
}

/// Per-vnode operations object.
struct Ext2VnodeOps {
    fsys: Arc<Ext2Filesystem>,
    file: SpinLock<Option<Ext2File>>,
}

impl Ext2VnodeOps {
    fn new(fsys: Arc<Ext2Filesystem>) -> Self {
        Self {
            fsys,
            file: SpinLock::new(None),
        }
    }

    /// Runs a closure with the engine and this vnode's open file.
    fn with_file<R>(
        &self,
        ino: u64,
        f: impl FnOnce(&mut Ext2Fs, &mut Ext2File) -> Result<R>,
    ) -> Result<R> {
        self.fsys.with(|fs| {
            let mut slot = self.file.lock();
            if slot.is_none() {
                *slot = Some(fs.open_file(ino as u32)?);
            }
            let file = slot.as_mut().ok_or(Errno::EUCLEAN)?;
            // Another vnode may have touched this inode (rename, link);
            // refresh the copy unless unflushed buffer state depends on it.
            if !file.flags.contains(crate::file::FileFlags::BUFFER_DIRTY) {
                file.inode = fs.read_inode(ino as u32)?;
            }
            f(fs, file)
        })
    }

    /// Copies inode attributes into the vnode (the `fill` payload).
    fn update_vfs_inode(fs: &Ext2Fs, vp: &Vnode, inode: &Ext2Inode) {
        let mut attr = vp.attr.lock();
        attr.mode = inode.i_mode as u32;
        attr.vtype = VnodeType::from_mode(inode.i_mode as u32);
        attr.nlink = inode.i_links_count as u32;
        attr.uid = inode.i_uid as u32;
        attr.gid = inode.i_gid as u32;
        attr.rdev = if pml_fs::mode::is_blk(inode.i_mode as u32)
            || pml_fs::mode::is_chr(inode.i_mode as u32)
        {
            inode.i_block[0] as u64
        } else {
            0
        };
        attr.atime = Timespec { sec: inode.i_atime as i64, nsec: 0 };
        attr.mtime = Timespec { sec: inode.i_mtime as i64, nsec: 0 };
        attr.ctime = Timespec { sec: inode.i_ctime as i64, nsec: 0 };
        attr.blocks = (inode.i_blocks as u64 * 512).div_ceil(fs.blksize as u64);
        attr.blksize = fs.blksize;
        attr.size = inode.size();
    }

    /// Builds (or fetches from the cache) the vnode for `ino`.
    fn child_vnode(&self, dir: &Arc<Vnode>, ino: u32) -> Result<Arc<Vnode>> {
        let mount = dir.mount.as_ref().ok_or(Errno::EUCLEAN)?;
        get_vnode(mount, ino as u64, || {
            Box::new(Ext2VnodeOps::new(self.fsys.clone()))
        })
    }
}

impl VnodeOps for Ext2VnodeOps {
    fn fill(&self, vp: &Arc<Vnode>) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            Self::update_vfs_inode(fs, vp, &file.inode);
            Ok(())
        })
    }

    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
        let ino = self.with_file(dir.ino, |fs, file| {
            fs.lookup_entry(dir.ino as u32, &file.inode, name)
        })?;
        self.child_vnode(dir, ino)
    }

    fn read(&self, vp: &Vnode, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_file(vp.ino, |fs, file| fs.file_read(file, buf, offset))
    }

    fn write(&self, vp: &Vnode, buf: &[u8], offset: u64) -> Result<usize> {
        let n = self.with_file(vp.ino, |fs, file| {
            let n = fs.file_write(file, buf, offset)?;
            Ok((n, file.inode.size()))
        })?;
        vp.attr.lock().size = n.1;
        Ok(n.0)
    }

    fn sync(&self, vp: &Vnode) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            fs.file_flush(file)?;
            fs.update_inode(file.ino, &file.inode)?;
            fs.flush(FLUSH_VALID)
        })
    }

    fn chmod(&self, vp: &Vnode, mode: u32) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            let perm = mode & pml_fs::mode::FULL_PERM;
            file.inode.i_mode = ((file.inode.i_mode as u32 & pml_fs::mode::S_IFMT) | perm) as u16;
            file.inode.i_ctime = (fs.clock)();
            fs.update_inode(file.ino, &file.inode)?;
            vp.attr.lock().mode = file.inode.i_mode as u32;
            Ok(())
        })
    }

    fn chown(&self, vp: &Vnode, uid: u32, gid: u32) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            if uid != u32::MAX {
                file.inode.i_uid = uid as u16;
            }
            if gid != u32::MAX {
                file.inode.i_gid = gid as u16;
            }
            file.inode.i_ctime = (fs.clock)();
            fs.update_inode(file.ino, &file.inode)?;
            let mut attr = vp.attr.lock();
            attr.uid = file.inode.i_uid as u32;
            attr.gid = file.inode.i_gid as u32;
            Ok(())
        })
    }

    fn create(
        &self,
        dir: &Arc<Vnode>,
        name: &str,
        mode: u32,
        rdev: u64,
        cred: &Cred,
    ) -> Result<Arc<Vnode>> {
        let ino = self.with_file(dir.ino, |fs, file| {
            if fs.lookup_entry(dir.ino as u32, &file.inode, name).is_ok() {
                return Err(Errno::EEXIST);
            }
            let (ino, _) = fs.new_file(
                dir.ino as u32,
                &mut file.inode,
                name,
                mode,
                cred.euid,
                cred.egid,
                rdev,
            )?;
            Ok(ino)
        })?;
        self.child_vnode(dir, ino)
    }

    fn mkdir(&self, dir: &Arc<Vnode>, name: &str, mode: u32, cred: &Cred) -> Result<Arc<Vnode>> {
        let ino = self.with_file(dir.ino, |fs, file| {
            if fs.lookup_entry(dir.ino as u32, &file.inode, name).is_ok() {
                return Err(Errno::EEXIST);
            }
            let mode = pml_fs::mode::S_IFDIR | (mode & pml_fs::mode::FULL_PERM);
            let (ino, _) = fs.new_dir(
                dir.ino as u32,
                &mut file.inode,
                name,
                mode,
                cred.euid,
                cred.egid,
            )?;
            Ok(ino)
        })?;
        dir.attr.lock().nlink += 1;
        self.child_vnode(dir, ino)
    }

    fn rename(
        &self,
        olddir: &Arc<Vnode>,
        oldname: &str,
        newdir: &Arc<Vnode>,
        newname: &str,
    ) -> Result<()> {
        self.fsys.with(|fs| {
            let mut old_inode = fs.read_inode(olddir.ino as u32)?;
            let mut new_inode = fs.read_inode(newdir.ino as u32)?;
            let ino = fs.lookup_entry(olddir.ino as u32, &old_inode, oldname)?;
            let target = fs.read_inode(ino)?;

            // An existing destination entry is replaced.
            if fs
                .lookup_entry(newdir.ino as u32, &new_inode, newname)
                .is_ok()
            {
                fs.unlink_dirent(newdir.ino as u32, &new_inode, newname)?;
                new_inode = fs.read_inode(newdir.ino as u32)?;
            }

            fs.add_link(
                newdir.ino as u32,
                &mut new_inode,
                newname,
                ino,
                dir_type(target.i_mode as u32),
            )?;
            fs.remove_dirent(olddir.ino as u32, &old_inode, oldname)?;

            // A moved directory re-parents its `..` entry.
            if pml_fs::mode::is_dir(target.i_mode as u32) && olddir.ino != newdir.ino {
                fs.reparent_dotdot(ino, &target, newdir.ino as u32)?;
                old_inode = fs.read_inode(olddir.ino as u32)?;
                old_inode.i_links_count = old_inode.i_links_count.saturating_sub(1);
                fs.update_inode(olddir.ino as u32, &old_inode)?;
                new_inode = fs.read_inode(newdir.ino as u32)?;
                new_inode.i_links_count += 1;
                fs.update_inode(newdir.ino as u32, &new_inode)?;
            }
            Ok(())
        })?;
        // The cached dir state went stale; drop the open-file copies.
        *self.file.lock() = None;
        Ok(())
    }

    fn link(&self, dir: &Arc<Vnode>, vp: &Arc<Vnode>, name: &str) -> Result<()> {
        self.with_file(dir.ino, |fs, file| {
            if fs.lookup_entry(dir.ino as u32, &file.inode, name).is_ok() {
                return Err(Errno::EEXIST);
            }
            let mut target = fs.read_inode(vp.ino as u32)?;
            if pml_fs::mode::is_dir(target.i_mode as u32) {
                return Err(Errno::EPERM);
            }
            fs.add_link(
                dir.ino as u32,
                &mut file.inode,
                name,
                vp.ino as u32,
                dir_type(target.i_mode as u32),
            )?;
            target.i_links_count += 1;
            fs.update_inode(vp.ino as u32, &target)?;
            vp.attr.lock().nlink = target.i_links_count as u32;
            Ok(())
        })
    }

    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> Result<()> {
        self.with_file(dir.ino, |fs, file| {
            fs.unlink_dirent(dir.ino as u32, &file.inode, name)?;
            Ok(())
        })
    }

    fn symlink(&self, dir: &Arc<Vnode>, name: &str, target: &str, cred: &Cred) -> Result<()> {
        self.with_file(dir.ino, |fs, file| {
            if fs.lookup_entry(dir.ino as u32, &file.inode, name).is_ok() {
                return Err(Errno::EEXIST);
            }
            let mode = pml_fs::mode::S_IFLNK | 0o777;
            let (ino, mut inode) = fs.new_file(
                dir.ino as u32,
                &mut file.inode,
                name,
                mode,
                cred.euid,
                cred.egid,
                0,
            )?;
            let bytes = target.as_bytes();
            if bytes.len() < 60 {
                // Fast symlink: the target lives in the block pointers.
                let mut raw = [0u8; 60];
                raw[..bytes.len()].copy_from_slice(bytes);
                for (i, slot) in inode.i_block.iter_mut().enumerate() {
                    *slot = u32::from_le_bytes([
                        raw[i * 4],
                        raw[i * 4 + 1],
                        raw[i * 4 + 2],
                        raw[i * 4 + 3],
                    ]);
                }
                inode.i_size = bytes.len() as u32;
                fs.update_inode(ino, &inode)?;
            } else {
                let mut link_file = fs.open_file(ino)?;
                fs.file_write(&mut link_file, bytes, 0)?;
            }
            Ok(())
        })
    }

    fn readdir(&self, dir: &Vnode, entry: &mut DirEntry, offset: i64) -> Result<i64> {
        self.with_file(dir.ino, |fs, file| {
            match fs.read_dirent(dir.ino as u32, &file.inode, offset as u64)? {
                None => Ok(0),
                Some((ino, ftype, name, next)) => {
                    entry.ino = ino as u64;
                    entry.name = name;
                    entry.vtype = match ftype {
                        crate::dir::FT_REG_FILE => VnodeType::Regular,
                        crate::dir::FT_DIR => VnodeType::Directory,
                        crate::dir::FT_CHRDEV => VnodeType::CharDevice,
                        crate::dir::FT_BLKDEV => VnodeType::BlockDevice,
                        crate::dir::FT_FIFO => VnodeType::Fifo,
                        crate::dir::FT_SOCK => VnodeType::Socket,
                        crate::dir::FT_SYMLINK => VnodeType::Symlink,
                        _ => VnodeType::None,
                    };
                    Ok(next as i64)
                }
            }
        })
    }

    fn readlink(&self, vp: &Vnode, buf: &mut [u8]) -> Result<usize> {
        self.with_file(vp.ino, |fs, file| {
            if file.inode.is_inline_symlink() {
                let len = file.inode.size() as usize;
                let mut raw = [0u8; 60];
                for (i, slot) in file.inode.i_block.iter().enumerate() {
                    raw[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
                }
                let n = len.min(buf.len());
                buf[..n].copy_from_slice(&raw[..n]);
                Ok(n)
            } else {
                fs.file_read(file, buf, 0)
            }
        })
    }

    fn truncate(&self, vp: &Vnode, len: u64) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            fs.file_set_size(file, len)?;
            vp.attr.lock().size = len;
            Ok(())
        })
    }

    fn utime(&self, vp: &Vnode, atime: Option<Timespec>, mtime: Option<Timespec>) -> Result<()> {
        self.with_file(vp.ino, |fs, file| {
            if let Some(atime) = atime {
                file.inode.i_atime = atime.sec as u32;
            }
            if let Some(mtime) = mtime {
                file.inode.i_mtime = mtime.sec as u32;
            }
            fs.update_inode(file.ino, &file.inode)?;
            let mut attr = vp.attr.lock();
            attr.atime = Timespec { sec: file.inode.i_atime as i64, nsec: 0 };
            attr.mtime = Timespec { sec: file.inode.i_mtime as i64, nsec: 0 };
            Ok(())
        })
    }

    fn bmap(&self, vp: &Vnode, block: u64) -> Result<u64> {
        self.with_file(vp.ino, |fs, file| {
            let (phys, _) = fs.bmap(file.ino, Some(&mut file.inode), 0, block, 0)?;
            Ok(phys)
        })
    }

    fn dealloc(&self, _vp: &Vnode) {
        // Flush any straggling buffered block; errors are unreportable
        // here. Lock order is engine first, then the file slot, matching
        // with_file.
        self.fsys.with(|fs| {
            let mut slot = self.file.lock();
            if let Some(file) = slot.as_mut() {
                let _ = fs.file_flush(file);
            }
            *slot = None;
        });
    }
}

impl Ext2Fs {
    /// Removes a directory record without touching the target inode (the
    /// rename path's half of unlink).
    pub fn remove_dirent(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        name: &str,
    ) -> Result<()> {
        let target = name.as_bytes();
        let mut prev_at: Option<usize> = None;
        let mut done = false;
        self.dir_iterate(
            dir_ino,
            dir_inode,
            crate::dir::DIRENT_FLAG_EMPTY,
            &mut |fs, _kind, buf, at, _size| {
                let prev = if at == 0 { None } else { prev_at };
                prev_at = Some(at);
                if crate::dir::de_name_len(buf, at) != target.len()
                    || crate::dir::de_name(buf, at) != target
                    || crate::dir::de_inode(buf, at) == 0
                {
                    return Ok(0);
                }
                match prev {
                    Some(prev) => {
                        let merged = fs.get_rec_len(buf, prev) + fs.get_rec_len(buf, at);
                        fs.set_rec_len(buf, prev, merged)?;
                    }
                    None => crate::dir::set_de_inode(buf, at, 0),
                }
                done = true;
                Ok(crate::dir::DIRENT_ABORT | crate::dir::DIRENT_CHANGED)
            },
        )?;
        if done { Ok(()) } else { Err(Errno::ENOENT) }
    }

    /// Points a moved directory's `..` at its new parent.
    pub fn reparent_dotdot(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        new_parent: u32,
    ) -> Result<()> {
        self.dir_iterate(dir_ino, dir_inode, 0, &mut |_fs, kind, buf, at, _size| {
            if kind == crate::dir::DirentKind::DotDot {
                crate::dir::set_de_inode(buf, at, new_parent);
                return Ok(crate::dir::DIRENT_ABORT | crate::dir::DIRENT_CHANGED);
            }
            Ok(0)
        })
    }
}

/// Probe hook: whether the device carries an ext2 magic number.
pub fn ext2_check(dev: &dyn BlockDevice) -> bool {
    let mut magic = [0u8; 2];
    match dev.read(&mut magic, EXT2_SUPER_OFFSET + 56) {
        Ok(2) => u16::from_le_bytes(magic) == crate::EXT2_MAGIC,
        _ => false,
    }
}

/// Mounts an ext2 filesystem from `dev`, returning the mount record with
/// its root vnode resolved and cached.
pub fn ext2_mount(
    dev: Arc<dyn BlockDevice>,
    device_name: &str,
    mflags: MountFlags,
) -> Result<Arc<Mount>> {
    let fs = Ext2Fs::open(dev, mflags)?;
    let mflags = fs.mflags;
    let fsys = Arc::new(Ext2Filesystem {
        fs: SpinLock::new(fs),
    });

    let mount = Mount::new(device_name, mflags);
    *mount.fs.lock() = Some(fsys.clone() as Arc<dyn Filesystem>);

    let root = Vnode::new(
        EXT2_ROOT_INO as u64,
        Box::new(Ext2VnodeOps::new(fsys)),
        Some(mount.clone()),
    );
    root.ops.fill(&root)?;
    mount.cache_insert(&root);
    *mount.root.lock() = Some(root);
    Ok(mount)
}

/// Unmounts: flushes the instance and breaks the mount/root cycle.
pub fn ext2_unmount(mount: &Mount) -> Result<()> {
    mount.clear_root();
    if let Some(fs) = mount.fs.lock().take() {
        fs.unmount()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use alloc::string::String;
    use alloc::vec;
    use pml_fs::mode::{S_IFREG, S_IROTH, S_IRUSR, S_IWUSR};
    use pml_fs::path::namei;
    use pml_fs::vnops;

    fn mount_test_fs() -> Arc<Mount> {
        let img = testfs::mkfs_basic(1024 * 1024);
        ext2_mount(img, "ram0", MountFlags::empty()).unwrap()
    }

    #[test]
    fn probe_detects_magic() {
        let img = testfs::mkfs_basic(1024 * 1024);
        assert!(ext2_check(img.as_ref()));
        let empty = testfs::MemDisk::new(64 * 1024);
        assert!(!ext2_check(empty.as_ref()));
    }

    #[test]
    fn create_write_read_through_vfs() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();

        let vp = vnops::vfs_create(&root, "foo", S_IFREG | 0o644, 0, &cred).unwrap();
        assert_eq!(vnops::vfs_write(&vp, b"hello", 0, &cred).unwrap(), 5);

        // Resolve it again by path and read back.
        let again = namei(&root, &root, "/foo", &cred, true).unwrap();
        assert!(Arc::ptr_eq(&vp, &again));
        let mut buf = [0u8; 8];
        let n = vnops::vfs_read(&again, &mut buf, 0, &cred).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(again.attr().size, 5);
    }

    #[test]
    fn unlink_then_lookup_is_enoent() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let vp = vnops::vfs_create(&root, "foo", S_IFREG | 0o644, 0, &cred).unwrap();
        vnops::vfs_write(&vp, b"hello", 0, &cred).unwrap();
        drop(vp);

        vnops::vfs_unlink(&root, "foo", &cred).unwrap();
        assert_eq!(
            namei(&root, &root, "/foo", &cred, true).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn mkdir_and_nested_create() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let dir = vnops::vfs_mkdir(&root, "sub", 0o755, &cred).unwrap();
        assert!(dir.is_dir());
        assert_eq!(root.attr().nlink, 3);

        let vp = vnops::vfs_create(&dir, "inner", S_IFREG | 0o600, 0, &cred).unwrap();
        vnops::vfs_write(&vp, b"x", 0, &cred).unwrap();
        let found = namei(&root, &root, "/sub/inner", &cred, true).unwrap();
        assert!(Arc::ptr_eq(&vp, &found));
    }

    #[test]
    fn readdir_lists_created_entries() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        vnops::vfs_create(&root, "a", S_IFREG | 0o644, 0, &cred).unwrap();
        vnops::vfs_mkdir(&root, "d", 0o755, &cred).unwrap();

        let mut names = alloc::vec::Vec::new();
        let mut offset = 0i64;
        loop {
            let mut entry = DirEntry::default();
            offset = vnops::vfs_readdir(&root, &mut entry, offset, &cred).unwrap();
            if offset == 0 {
                break;
            }
            assert_eq!(
                entry.reclen as usize,
                pml_fs::vnode::DIRENT_NAME_OFFSET + entry.name.len() + 1
            );
            names.push((entry.name.clone(), entry.vtype));
        }
        assert_eq!(names.len(), 4);
        assert_eq!(names[2], (String::from("a"), VnodeType::Regular));
        assert_eq!(names[3], (String::from("d"), VnodeType::Directory));
    }

    #[test]
    fn symlink_resolution_through_namei() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let vp = vnops::vfs_create(&root, "data", S_IFREG | 0o644, 0, &cred).unwrap();
        vnops::vfs_write(&vp, b"via link", 0, &cred).unwrap();
        vnops::vfs_symlink(&root, "ln", "/data", &cred).unwrap();

        let resolved = namei(&root, &root, "/ln", &cred, true).unwrap();
        assert!(Arc::ptr_eq(&vp, &resolved));
        let raw = namei(&root, &root, "/ln", &cred, false).unwrap();
        let mut buf = [0u8; 64];
        let n = vnops::vfs_readlink(&raw, &mut buf, &cred).unwrap();
        assert_eq!(&buf[..n], b"/data");
    }

    #[test]
    fn long_symlink_uses_data_blocks() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let target = "/some/very/long/path/".repeat(5);
        vnops::vfs_symlink(&root, "far", &target, &cred).unwrap();
        let raw = namei(&root, &root, "/far", &cred, false).unwrap();
        let mut buf = vec![0u8; 256];
        let n = vnops::vfs_readlink(&raw, &mut buf, &cred).unwrap();
        assert_eq!(&buf[..n], target.as_bytes());
    }

    #[test]
    fn rename_moves_entry() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let dir = vnops::vfs_mkdir(&root, "sub", 0o755, &cred).unwrap();
        let vp = vnops::vfs_create(&root, "from", S_IFREG | 0o644, 0, &cred).unwrap();
        vnops::vfs_write(&vp, b"payload", 0, &cred).unwrap();
        drop(vp);

        vnops::vfs_rename(&root, "from", &dir, "to", &cred).unwrap();
        assert_eq!(
            namei(&root, &root, "/from", &cred, true).unwrap_err(),
            Errno::ENOENT
        );
        let moved = namei(&root, &root, "/sub/to", &cred, true).unwrap();
        let mut buf = [0u8; 16];
        let n = vnops::vfs_read(&moved, &mut buf, 0, &cred).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn permissions_enforced_through_gate() {
        let mount = mount_test_fs();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let vp = vnops::vfs_create(&root, "private", S_IFREG | (S_IRUSR | S_IWUSR), 0, &cred)
            .unwrap();
        vnops::vfs_write(&vp, b"secret", 0, &cred).unwrap();

        let other = Cred { uid: 1000, euid: 1000, gid: 1000, egid: 1000 };
        let mut buf = [0u8; 8];
        assert_eq!(
            vnops::vfs_read(&vp, &mut buf, 0, &other).unwrap_err(),
            Errno::EACCES
        );
        vnops::vfs_chmod(&vp, (S_IRUSR | S_IWUSR | S_IROTH) as u32, &cred).unwrap();
        assert!(vnops::vfs_read(&vp, &mut buf, 0, &other).is_ok());
    }

    #[test]
    fn persists_across_remount() {
        let img = testfs::mkfs_basic(1024 * 1024);
        {
            let mount = ext2_mount(img.clone(), "ram0", MountFlags::empty()).unwrap();
            let root = mount.root_vnode().unwrap();
            let cred = Cred::root();
            let vp = vnops::vfs_create(&root, "keep", S_IFREG | 0o644, 0, &cred).unwrap();
            vnops::vfs_write(&vp, b"durable", 0, &cred).unwrap();
            drop(vp);
            drop(root);
            ext2_unmount(&mount).unwrap();
        }
        let mount = ext2_mount(img, "ram0", MountFlags::empty()).unwrap();
        let root = mount.root_vnode().unwrap();
        let cred = Cred::root();
        let vp = namei(&root, &root, "/keep", &cred, true).unwrap();
        let mut buf = [0u8; 16];
        let n = vnops::vfs_read(&vp, &mut buf, 0, &cred).unwrap();
        assert_eq!(&buf[..n], b"durable");
    }
}
