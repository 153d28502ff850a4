//! Process syscalls: fork, execve, exit, identity.

use alloc::sync::Arc;

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};
use pml_fs::{perm, Vnode};

use crate::proc::wait::ExitKind;
use crate::proc::{self, Pid};
use crate::rootfs;

/// The program loader installed by the boot glue.
///
/// Parses the executable, builds a fresh address space and returns
/// `(entry point, stack top, new PML4)`. Binary format handling lives
/// outside the core kernel.
pub type ExecLoader = fn(&Arc<Vnode>) -> Result<(u64, u64, u64)>;

static EXEC_LOADER: SpinLock<Option<ExecLoader>> = SpinLock::new(None);

/// Installs the program loader.
pub fn set_exec_loader(loader: ExecLoader) {
    *EXEC_LOADER.lock() = Some(loader);
}

/// `fork(2)`.
pub fn sys_fork() -> Result<Pid> {
    proc::process_fork()
}

/// `execve(2)`.
///
/// Resolves and permission-checks the executable, hands it to the loader,
/// then swaps the calling thread's address space and resets close-on-exec
/// descriptors and caught signal dispositions.
pub fn sys_execve(path: &str) -> Result<()> {
    let vp = rootfs::resolve(path, true)?;
    let cred = proc::try_with_current(|p| p.cred())?;
    perm::can_exec(&vp, &cred, false)?;
    if !pml_fs::mode::is_reg(vp.mode()) {
        return Err(Errno::EACCES);
    }

    let loader = EXEC_LOADER.lock().ok_or(Errno::ENOSYS)?;
    let (entry, stack_top, pml4) = loader(&vp)?;

    proc::process_exec_reset();
    proc::with_current(|p| {
        let thread = p.current_thread_mut();
        thread.args.pml4 = pml4;
        thread.args.entry = entry;
        thread.args.stack = stack_top;
    });
    Ok(())
}

/// `exit(2)`: marks the process for reaping and yields away.
pub fn sys_exit(status: i32) {
    proc::process_exit(ExitKind::Exited(status & 0xff));
    proc::sched_yield();
}

/// `getpid(2)`.
pub fn sys_getpid() -> Pid {
    proc::current_pid()
}

/// `getppid(2)`.
pub fn sys_getppid() -> Pid {
    proc::with_current(|p| p.ppid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;
    use crate::rootfs;
    use pml_ext2::testfs::mkfs_basic;
    use pml_fs::{MountFlags, OpenFlags};

    #[test]
    fn execve_without_loader_is_enosys() {
        let _sys = fresh_system();
        let img = mkfs_basic(1024 * 1024);
        let mount = pml_ext2::ext2_mount(img, "ram0", MountFlags::empty()).unwrap();
        rootfs::set_root(mount);

        let fd = crate::syscall::vfs::sys_open(
            "/bin",
            OpenFlags::CREAT | OpenFlags::WRONLY,
            0o755,
        )
        .unwrap();
        crate::syscall::vfs::sys_write(fd, b"\x7fELF").unwrap();
        crate::syscall::vfs::sys_close(fd).unwrap();

        assert_eq!(sys_execve("/bin").unwrap_err(), Errno::ENOSYS);
    }

    #[test]
    fn execve_rejects_non_executable() {
        let _sys = fresh_system();
        let img = mkfs_basic(1024 * 1024);
        let mount = pml_ext2::ext2_mount(img, "ram0", MountFlags::empty()).unwrap();
        rootfs::set_root(mount);

        let fd = crate::syscall::vfs::sys_open(
            "/data",
            OpenFlags::CREAT | OpenFlags::WRONLY,
            0o644,
        )
        .unwrap();
        crate::syscall::vfs::sys_close(fd).unwrap();
        // No execute bit anywhere: even root is refused.
        assert_eq!(sys_execve("/data").unwrap_err(), Errno::EACCES);
    }

    #[test]
    fn getpid_and_ppid() {
        let _sys = fresh_system();
        let child = sys_fork().unwrap();
        crate::proc::with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            q.front = idx;
        });
        assert_eq!(sys_getpid(), child);
        assert_eq!(sys_getppid(), 0);
    }
}
