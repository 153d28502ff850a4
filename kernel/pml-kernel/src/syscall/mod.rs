//! The system call surface.
//!
//! Handlers take kernel-typed arguments and return `Result`s; the raw
//! entry point decodes registers, builds user slices, and encodes failures
//! as `-errno` for the return register.

pub mod memory;
pub mod process;
pub mod vfs;

use pml_core::errno::encode_ret;
use pml_core::{Errno, Result};

/// Syscall numbers.
pub mod nr {
    pub const OPEN: usize = 0;
    pub const CLOSE: usize = 1;
    pub const READ: usize = 2;
    pub const WRITE: usize = 3;
    pub const DUP: usize = 4;
    pub const DUP2: usize = 5;
    pub const PIPE: usize = 6;
    pub const UNLINK: usize = 7;
    pub const MKDIR: usize = 8;
    pub const IOCTL: usize = 9;
    pub const MMAP: usize = 10;
    pub const MUNMAP: usize = 11;
    pub const MSYNC: usize = 12;
    pub const FORK: usize = 13;
    pub const EXECVE: usize = 14;
    pub const EXIT: usize = 15;
    pub const WAIT4: usize = 16;
    pub const KILL: usize = 17;
    pub const KILLPG: usize = 18;
    pub const SIGACTION: usize = 19;
    pub const SIGPROCMASK: usize = 20;
    pub const GETPID: usize = 21;
    pub const GETPPID: usize = 22;
    pub const GETPRIORITY: usize = 23;
    pub const SETPRIORITY: usize = 24;
    pub const GETRUSAGE: usize = 25;
    pub const GETHOSTNAME: usize = 26;
    pub const SETHOSTNAME: usize = 27;
    pub const UNAME: usize = 28;
    pub const GETRANDOM: usize = 29;
    pub const CHDIR: usize = 30;
}

/// Builds a path `&str` from a user pointer.
///
/// # Safety
///
/// `ptr..ptr+len` must be readable memory in the current address space.
unsafe fn user_str<'a>(ptr: usize, len: usize) -> Result<&'a str> {
    if ptr == 0 {
        return Err(Errno::EFAULT);
    }
    // SAFETY: Per the function contract.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    core::str::from_utf8(bytes).map_err(|_| Errno::EINVAL)
}

/// Raw syscall entry: decodes arguments and dispatches.
///
/// # Safety
///
/// Pointer-typed arguments must reference valid memory of the advertised
/// length in the calling thread's address space; the interrupt stub is
/// responsible for range-checking them against the user half.
pub unsafe fn syscall_dispatch(
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    // SAFETY: Forwarded from the caller for every pointer below.
    unsafe {
        match nr {
            nr::OPEN => encode_ret(user_str(a0, a1).and_then(|path| {
                vfs::sys_open(
                    path,
                    pml_fs::OpenFlags::from_bits_truncate(a2 as u32),
                    a3 as u32,
                )
                .map(|fd| fd as isize)
            })),
            nr::CLOSE => encode_ret(vfs::sys_close(a0 as i32).map(|()| 0)),
            nr::READ => {
                let buf = core::slice::from_raw_parts_mut(a1 as *mut u8, a2);
                encode_ret(vfs::sys_read(a0 as i32, buf).map(|n| n as isize))
            }
            nr::WRITE => {
                let buf = core::slice::from_raw_parts(a1 as *const u8, a2);
                encode_ret(vfs::sys_write(a0 as i32, buf).map(|n| n as isize))
            }
            nr::DUP => encode_ret(vfs::sys_dup(a0 as i32).map(|fd| fd as isize)),
            nr::DUP2 => encode_ret(vfs::sys_dup2(a0 as i32, a1 as i32).map(|fd| fd as isize)),
            nr::PIPE => encode_ret(vfs::sys_pipe().map(|(r, w)| {
                let out = a0 as *mut i32;
                out.write(r);
                out.add(1).write(w);
                0
            })),
            nr::UNLINK => {
                encode_ret(user_str(a0, a1).and_then(|p| vfs::sys_unlink(p).map(|()| 0)))
            }
            nr::MKDIR => encode_ret(
                user_str(a0, a1).and_then(|p| vfs::sys_mkdir(p, a2 as u32).map(|()| 0)),
            ),
            nr::IOCTL => encode_ret(vfs::sys_ioctl(a0 as i32, a1 as u64, a2)),
            nr::MMAP => encode_ret(
                memory::sys_mmap(
                    a0 as u64,
                    a1 as u64,
                    a2 as u32,
                    a3 as u32,
                    a4 as i32,
                    a5 as u64,
                )
                .map(|addr| addr as isize),
            ),
            nr::MUNMAP => {
                encode_ret(memory::sys_munmap(a0 as u64, a1 as u64).map(|()| 0))
            }
            nr::MSYNC => encode_ret(
                memory::sys_msync(a0 as u64, a1 as u64, a2 as u32).map(|()| 0),
            ),
            nr::FORK => encode_ret(process::sys_fork().map(|pid| pid as isize)),
            nr::EXECVE => {
                encode_ret(user_str(a0, a1).and_then(|p| process::sys_execve(p).map(|()| 0)))
            }
            nr::EXIT => {
                process::sys_exit(a0 as i32);
                0
            }
            nr::WAIT4 => encode_ret(
                crate::proc::wait::sys_wait4(a0 as i32, a2 as i32).map(|(pid, status, _)| {
                    if a1 != 0 {
                        (a1 as *mut i32).write(status);
                    }
                    pid as isize
                }),
            ),
            nr::KILL => encode_ret(
                crate::proc::signal::sys_kill(a0 as i32, a1 as i32).map(|()| 0),
            ),
            nr::KILLPG => encode_ret(
                crate::proc::signal::sys_killpg(a0 as i32, a1 as i32).map(|()| 0),
            ),
            nr::SIGACTION => encode_ret(
                crate::proc::signal::sys_sigaction(
                    a0 as i32,
                    if a1 == 0 {
                        None
                    } else {
                        Some((a1 as *const crate::proc::signal::SigAction).read())
                    },
                )
                .map(|old| {
                    if a2 != 0 {
                        (a2 as *mut crate::proc::signal::SigAction).write(old);
                    }
                    0
                }),
            ),
            nr::GETRUSAGE => encode_ret(
                crate::proc::resource::sys_getrusage(a0 as i32).map(|usage| {
                    if a1 != 0 {
                        (a1 as *mut crate::proc::resource::Rusage).write(usage);
                    }
                    0
                }),
            ),
            nr::SIGPROCMASK => encode_ret(
                crate::proc::signal::sys_sigprocmask(
                    a0 as i32,
                    if a1 == 0 { None } else { Some((a1 as *const u64).read()) },
                )
                .map(|old| {
                    if a2 != 0 {
                        (a2 as *mut u64).write(old);
                    }
                    0
                }),
            ),
            nr::GETPID => process::sys_getpid() as isize,
            nr::GETPPID => process::sys_getppid() as isize,
            nr::GETPRIORITY => encode_ret(
                crate::proc::resource::sys_getpriority(a0 as i32, a1 as i32)
                    .map(|p| p as isize),
            ),
            nr::SETPRIORITY => encode_ret(
                crate::proc::resource::sys_setpriority(a0 as i32, a1 as i32, a2 as i32)
                    .map(|()| 0),
            ),
            nr::GETHOSTNAME => {
                let buf = core::slice::from_raw_parts_mut(a0 as *mut u8, a1);
                encode_ret(crate::uname::sys_gethostname(buf).map(|n| n as isize))
            }
            nr::SETHOSTNAME => {
                let buf = core::slice::from_raw_parts(a0 as *const u8, a1);
                encode_ret(crate::uname::sys_sethostname(buf).map(|()| 0))
            }
            nr::UNAME => {
                let uts = crate::uname::sys_uname();
                (a0 as *mut crate::uname::Utsname).write(uts);
                0
            }
            nr::GETRANDOM => {
                let buf = core::slice::from_raw_parts_mut(a0 as *mut u8, a1);
                crate::random::sys_getrandom(buf, a2 as u32)
            }
            nr::CHDIR => {
                encode_ret(user_str(a0, a1).and_then(|p| crate::rootfs::sys_chdir(p).map(|()| 0)))
            }
            _ => Errno::ENOSYS.as_ret(),
        }
    }
}
