//! The mounted root filesystem and path resolution context.

use alloc::string::String;
use alloc::sync::Arc;

use pml_core::sync::SpinLock;
use pml_core::{kinfo, Errno, Result};
use pml_fs::path::namei;
use pml_fs::{Cred, Mount, MountFlags, Vnode};

use crate::drivers::lookup_device;
use crate::proc::try_with_current;

static ROOT_MOUNT: SpinLock<Option<Arc<Mount>>> = SpinLock::new(None);

/// Mounts the ext2 filesystem on `device` as the root.
pub fn mount_root(device: &str) -> Result<()> {
    let dev = lookup_device(device)?;
    if !pml_ext2::ext2_check(dev.as_ref()) {
        return Err(Errno::EINVAL);
    }
    let mount = pml_ext2::ext2_mount(dev, device, MountFlags::empty())?;
    kinfo!("root filesystem mounted from {}", device);
    *ROOT_MOUNT.lock() = Some(mount);
    Ok(())
}

/// Installs an already constructed mount as the root (tests, initrd).
pub fn set_root(mount: Arc<Mount>) {
    *ROOT_MOUNT.lock() = Some(mount);
}

/// Unmounts the root filesystem.
pub fn unmount_root() -> Result<()> {
    if let Some(mount) = ROOT_MOUNT.lock().take() {
        pml_ext2::vfs::ext2_unmount(&mount)?;
    }
    Ok(())
}

/// The root vnode.
pub fn root_vnode() -> Result<Arc<Vnode>> {
    ROOT_MOUNT
        .lock()
        .as_ref()
        .ok_or(Errno::ENOENT)?
        .root_vnode()
}

/// Resolution context of the calling process: root, cwd, credentials.
pub fn resolve_context() -> Result<(Arc<Vnode>, Arc<Vnode>, Cred)> {
    let root = root_vnode()?;
    let (cwd, cred) = try_with_current(|p| (p.cwd.clone(), p.cred()))
        .unwrap_or((None, Cred::root()));
    Ok((root.clone(), cwd.unwrap_or(root), cred))
}

/// Resolves `path` relative to the caller's context.
pub fn resolve(path: &str, follow: bool) -> Result<Arc<Vnode>> {
    let (root, cwd, cred) = resolve_context()?;
    namei(&root, &cwd, path, &cred, follow)
}

/// `chdir(2)`: repoints the caller's working directory.
pub fn sys_chdir(path: &str) -> Result<()> {
    let vp = resolve(path, true)?;
    if !vp.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    try_with_current(|p| {
        p.cwd = Some(vp.clone());
        p.cwd_path = String::from(path);
    })?;
    Ok(())
}
