//! File syscalls: open, close, read, write, dup, pipe, unlink, mkdir,
//! ioctl, readdir.

use alloc::sync::Arc;

use pml_core::{Errno, Result};
use pml_fs::fd::with_system_fds;
use pml_fs::path::{namei, namei_parent};
use pml_fs::vnode::DirEntry;
use pml_fs::{mode, vnops, OpenFlags, Vnode};

use crate::ipc::pipe::make_pipe;
use crate::proc::try_with_current;
use crate::rootfs::resolve_context;

/// Binds `vnode` into a fresh system slot and the lowest free descriptor.
fn install_fd(vnode: Arc<Vnode>, path: &str, flags: OpenFlags) -> Result<i32> {
    let slot = with_system_fds(|sys| {
        let slot = sys.alloc()?;
        sys.fill(slot, vnode, path, flags);
        Ok(slot)
    })?;
    let bound = try_with_current(|p| {
        let fd = p.fds.alloc()?;
        p.fds.bind(fd, slot, flags.contains(OpenFlags::CLOEXEC));
        Ok(fd)
    })?;
    match bound {
        Ok(fd) => Ok(fd),
        Err(e) => {
            with_system_fds(|sys| sys.release(slot));
            Err(e)
        }
    }
}

/// Resolves a descriptor to its slot, vnode, offset and flags.
fn file_of(fd: i32) -> Result<(usize, Arc<Vnode>, u64, OpenFlags)> {
    let entry = try_with_current(|p| p.fds.get(fd))??;
    with_system_fds(|sys| {
        let file = sys.get(entry.slot)?;
        Ok((
            entry.slot,
            file.vnode.clone().ok_or(Errno::EBADF)?,
            file.offset,
            file.flags,
        ))
    })
}

/// `open(2)`.
///
/// Honours `O_NOFOLLOW`, `O_CREAT`, `O_EXCL`, `O_DIRECTORY` and `O_TRUNC`;
/// creation applies the caller's umask.
pub fn sys_open(path: &str, flags: OpenFlags, create_mode: u32) -> Result<i32> {
    let (root, cwd, cred) = resolve_context()?;
    let umask = try_with_current(|p| p.umask).unwrap_or(0o022);
    let follow = !flags.contains(OpenFlags::NOFOLLOW);

    let vnode = match namei(&root, &cwd, path, &cred, follow) {
        Ok(vp) => {
            if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                return Err(Errno::EEXIST);
            }
            if flags.contains(OpenFlags::DIRECTORY) && !vp.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            vp
        }
        Err(Errno::ENOENT) if flags.contains(OpenFlags::CREAT) => {
            let (dir, name) = namei_parent(&root, &cwd, path, &cred)?;
            if name == "." || name == ".." {
                return Err(Errno::ENOENT);
            }
            let perm = create_mode & mode::FULL_PERM & !umask;
            if flags.contains(OpenFlags::DIRECTORY) {
                vnops::vfs_mkdir(&dir, name, perm, &cred)?
            } else {
                vnops::vfs_create(&dir, name, mode::S_IFREG | perm, 0, &cred)?
            }
        }
        Err(e) => return Err(e),
    };

    if flags.contains(OpenFlags::TRUNC) && flags.writable() && mode::is_reg(vnode.mode()) {
        vnops::vfs_truncate(&vnode, 0, &cred)?;
    }
    install_fd(vnode, path, flags)
}

/// `close(2)`.
pub fn sys_close(fd: i32) -> Result<()> {
    try_with_current(|p| p.fds.close(fd))?
}

/// `read(2)`: reads at the shared offset and advances it.
pub fn sys_read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    let (slot, vnode, offset, flags) = file_of(fd)?;
    if !flags.readable() {
        return Err(Errno::EBADF);
    }
    let cred = try_with_current(|p| p.cred())?;
    let n = vnops::vfs_read(&vnode, buf, offset, &cred)?;
    with_system_fds(|sys| {
        if let Ok(file) = sys.get_mut(slot) {
            file.offset += n as u64;
        }
    });
    Ok(n)
}

/// `write(2)`: writes at the shared offset (end of file with `O_APPEND`)
/// and advances it.
pub fn sys_write(fd: i32, buf: &[u8]) -> Result<usize> {
    let (slot, vnode, mut offset, flags) = file_of(fd)?;
    if !flags.writable() {
        return Err(Errno::EBADF);
    }
    if flags.contains(OpenFlags::APPEND) {
        offset = vnode.attr().size;
    }
    let cred = try_with_current(|p| p.cred())?;
    let n = vnops::vfs_write(&vnode, buf, offset, &cred)?;
    with_system_fds(|sys| {
        if let Ok(file) = sys.get_mut(slot) {
            file.offset = offset + n as u64;
        }
    });
    Ok(n)
}

/// `dup(2)`.
pub fn sys_dup(fd: i32) -> Result<i32> {
    try_with_current(|p| p.fds.dup(fd))?
}

/// `dup2(2)`: atomically closes the destination first.
pub fn sys_dup2(fd: i32, new_fd: i32) -> Result<i32> {
    try_with_current(|p| p.fds.dup2(fd, new_fd, false))?
}

/// `pipe(2)`: returns `(read fd, write fd)`.
pub fn sys_pipe() -> Result<(i32, i32)> {
    let cred = try_with_current(|p| p.cred())?;
    let (read_end, write_end) = make_pipe();
    for end in [&read_end, &write_end] {
        let mut attr = end.attr.lock();
        attr.uid = cred.euid;
        attr.gid = cred.egid;
    }
    let rfd = install_fd(read_end, "pipe:[r]", OpenFlags::empty())?;
    let wfd = match install_fd(write_end, "pipe:[w]", OpenFlags::WRONLY) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = sys_close(rfd);
            return Err(e);
        }
    };
    Ok((rfd, wfd))
}

/// `unlink(2)`.
pub fn sys_unlink(path: &str) -> Result<()> {
    let (root, cwd, cred) = resolve_context()?;
    let (dir, name) = namei_parent(&root, &cwd, path, &cred)?;
    vnops::vfs_unlink(&dir, name, &cred)
}

/// `mkdir(2)`.
pub fn sys_mkdir(path: &str, create_mode: u32) -> Result<()> {
    let (root, cwd, cred) = resolve_context()?;
    let umask = try_with_current(|p| p.umask).unwrap_or(0o022);
    let (dir, name) = namei_parent(&root, &cwd, path, &cred)?;
    vnops::vfs_mkdir(&dir, name, create_mode & mode::FULL_PERM & !umask, &cred)?;
    Ok(())
}

/// `ioctl(2)`.
pub fn sys_ioctl(fd: i32, req: u64, arg: usize) -> Result<isize> {
    let (_, vnode, _, _) = file_of(fd)?;
    vnode.ops.ioctl(&vnode, req, arg)
}

/// `readdir`-style: fills `entry` with the next record of an open
/// directory, advancing the descriptor offset. Returns `false` at the end.
pub fn sys_readdir(fd: i32, entry: &mut DirEntry) -> Result<bool> {
    let (slot, vnode, offset, _) = file_of(fd)?;
    let cred = try_with_current(|p| p.cred())?;
    let next = vnops::vfs_readdir(&vnode, entry, offset as i64, &cred)?;
    if next == 0 {
        return Ok(false);
    }
    with_system_fds(|sys| {
        if let Ok(file) = sys.get_mut(slot) {
            file.offset = next as u64;
        }
    });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;
    use crate::rootfs;
    use pml_ext2::testfs::mkfs_basic;
    use pml_fs::MountFlags;

    fn boot_with_root() -> std::sync::MutexGuard<'static, ()> {
        let gate = fresh_system();
        let img = mkfs_basic(1024 * 1024);
        let mount = pml_ext2::ext2_mount(img, "ram0", MountFlags::empty()).unwrap();
        rootfs::set_root(mount);
        gate
    }

    #[test]
    fn create_write_close_read_back() {
        let _sys = boot_with_root();
        let fd = sys_open(
            "/foo",
            OpenFlags::CREAT | OpenFlags::WRONLY,
            0o644,
        )
        .unwrap();
        assert_eq!(sys_write(fd, b"hello").unwrap(), 5);
        sys_close(fd).unwrap();

        let fd = sys_open("/foo", OpenFlags::empty(), 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(sys_read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // The shared offset advanced; the next read hits EOF.
        assert_eq!(sys_read(fd, &mut buf).unwrap(), 0);
        sys_close(fd).unwrap();
    }

    #[test]
    fn unlink_removes_and_frees() {
        let _sys = boot_with_root();
        let fd = sys_open("/foo", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644).unwrap();
        sys_write(fd, b"hello").unwrap();
        sys_close(fd).unwrap();

        sys_unlink("/foo").unwrap();
        assert_eq!(
            sys_open("/foo", OpenFlags::empty(), 0).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn creat_excl_and_nofollow() {
        let _sys = boot_with_root();
        let fd = sys_open("/x", OpenFlags::CREAT | OpenFlags::WRONLY, 0o600).unwrap();
        sys_close(fd).unwrap();
        assert_eq!(
            sys_open("/x", OpenFlags::CREAT | OpenFlags::EXCL, 0o600).unwrap_err(),
            Errno::EEXIST
        );
        assert_eq!(
            sys_open("/absent", OpenFlags::empty(), 0).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn umask_applies_to_creation() {
        let _sys = boot_with_root();
        crate::proc::with_current(|p| p.umask = 0o077);
        let fd = sys_open("/masked", OpenFlags::CREAT | OpenFlags::WRONLY, 0o666).unwrap();
        sys_close(fd).unwrap();
        let vp = rootfs::resolve("/masked", true).unwrap();
        assert_eq!(vp.mode() & mode::FULL_PERM, 0o600);
        crate::proc::with_current(|p| p.umask = 0o022);
    }

    #[test]
    fn mkdir_and_directory_flag() {
        let _sys = boot_with_root();
        sys_mkdir("/dir", 0o755).unwrap();
        let fd = sys_open("/dir", OpenFlags::DIRECTORY, 0).unwrap();
        sys_close(fd).unwrap();
        let fd = sys_open("/file", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644).unwrap();
        sys_close(fd).unwrap();
        assert_eq!(
            sys_open("/file", OpenFlags::DIRECTORY, 0).unwrap_err(),
            Errno::ENOTDIR
        );
    }

    #[test]
    fn trunc_resets_contents() {
        let _sys = boot_with_root();
        let fd = sys_open("/t", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644).unwrap();
        sys_write(fd, b"0123456789").unwrap();
        sys_close(fd).unwrap();
        let fd = sys_open("/t", OpenFlags::WRONLY | OpenFlags::TRUNC, 0).unwrap();
        sys_close(fd).unwrap();
        let vp = rootfs::resolve("/t", true).unwrap();
        assert_eq!(vp.attr().size, 0);
    }

    #[test]
    fn append_writes_at_end() {
        let _sys = boot_with_root();
        let fd = sys_open("/log", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644).unwrap();
        sys_write(fd, b"one").unwrap();
        sys_close(fd).unwrap();
        let fd = sys_open("/log", OpenFlags::WRONLY | OpenFlags::APPEND, 0).unwrap();
        sys_write(fd, b"two").unwrap();
        sys_close(fd).unwrap();

        let fd = sys_open("/log", OpenFlags::empty(), 0).unwrap();
        let mut buf = [0u8; 16];
        let n = sys_read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"onetwo");
        sys_close(fd).unwrap();
    }

    #[test]
    fn pipe_through_descriptors() {
        let _sys = boot_with_root();
        let (rfd, wfd) = sys_pipe().unwrap();
        assert_eq!(sys_write(wfd, b"thread to thread").unwrap(), 16);
        let mut buf = [0u8; 32];
        assert_eq!(sys_read(rfd, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..16], b"thread to thread");
        // Read from the write end is refused at the fd layer.
        assert_eq!(sys_read(wfd, &mut buf).unwrap_err(), Errno::EBADF);
        sys_close(rfd).unwrap();
        sys_close(wfd).unwrap();
    }

    #[test]
    fn readdir_walks_root() {
        let _sys = boot_with_root();
        sys_mkdir("/a", 0o755).unwrap();
        let fd = sys_open("/b", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644).unwrap();
        sys_close(fd).unwrap();

        let dir = sys_open("/", OpenFlags::DIRECTORY, 0).unwrap();
        let mut names = alloc::vec::Vec::new();
        let mut entry = DirEntry::default();
        while sys_readdir(dir, &mut entry).unwrap() {
            names.push(entry.name.clone());
        }
        sys_close(dir).unwrap();
        assert_eq!(names, [".", "..", "a", "b"]);
    }

    #[test]
    fn dup_shares_offset() {
        let _sys = boot_with_root();
        let fd = sys_open("/d", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
        sys_write(fd, b"abcdef").unwrap();
        let entry = try_with_current(|p| p.fds.get(fd)).unwrap().unwrap();
        with_system_fds(|sys| {
            sys.get_mut(entry.slot).unwrap().offset = 0;
        });
        let dup = sys_dup(fd).unwrap();
        let mut buf = [0u8; 3];
        sys_read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        sys_read(dup, &mut buf).unwrap();
        // The duplicate shares the file offset.
        assert_eq!(&buf, b"def");
        sys_close(fd).unwrap();
        sys_close(dup).unwrap();
    }
}
