//! Late boot: command line, devices, root mount, init.
//!
//! The early glue (tables, interrupt controllers, memory map, frame stack)
//! runs before this and hands over a parsed memory map and the block
//! devices it found. From here the kernel mounts the root filesystem,
//! starts the scheduler clock of the world, and becomes init's parent.

use alloc::string::String;

use pml_core::log::LogLevel;
use pml_core::{kinfo, kprintln, Errno, Result};

use crate::proc::wait;
use crate::proc::{self, signal};
use crate::syscall::vfs::{sys_dup, sys_open};
use crate::{drivers, random, rootfs, syscall, VERSION};

/// Options recognized on the kernel command line.
#[derive(Debug, Clone, Default)]
pub struct BootOptions {
    /// Device holding the root filesystem (`root=`); mandatory.
    pub root_device: String,
    /// Console echo threshold (`loglevel=0..4`), if given.
    pub log_level: Option<LogLevel>,
}

/// Parses the whitespace-separated `key=value` kernel command line.
///
/// Unknown keys are ignored; a missing `root=` is a boot-stopping error.
pub fn init_command_line(cmdline: &str) -> Result<BootOptions> {
    let mut options = BootOptions::default();
    for word in cmdline.split_whitespace() {
        let (key, value) = match word.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (word, None),
        };
        match key {
            "root" => {
                let value = value.ok_or(Errno::EINVAL)?;
                options.root_device = String::from(value);
            }
            "loglevel" => {
                options.log_level = match value {
                    Some("0") => Some(LogLevel::Fatal),
                    Some("1") => Some(LogLevel::Error),
                    Some("2") => Some(LogLevel::Warn),
                    Some("3") => Some(LogLevel::Info),
                    Some("4") => Some(LogLevel::Debug),
                    _ => return Err(Errno::EINVAL),
                };
            }
            _ => {}
        }
    }
    if options.root_device.is_empty() {
        return Err(Errno::EINVAL);
    }
    Ok(options)
}

/// Prints the boot banner.
pub fn splash(boot_time: i64) {
    kprintln!();
    kprintln!("Welcome to PML {}", VERSION);
    kprintln!("System time: {}", boot_time);
}

/// Attempts to exec a program; on failure execution simply continues.
fn try_execve(path: &str) {
    if let Err(e) = syscall::process::sys_execve(path) {
        kinfo!("could not exec {} (errno {})", path, e.code());
    }
}

/// Forks the kernel process and runs the init chain in the child.
///
/// The parent waits forever; init going away is fatal.
///
/// # Panics
///
/// Panics when no init program can be started or when init terminates.
pub fn fork_init() -> ! {
    let pid = proc::process_fork().expect("failed to fork init process");
    if pid == 0 {
        // Child: wire the standard streams to the console and run init.
        if let Ok(fd) = sys_open("/dev/console", pml_fs::OpenFlags::RDWR, 0) {
            let _ = sys_dup(fd);
            let _ = sys_dup(fd);
        }
        try_execve("/sbin/init");
        try_execve("/bin/init");
        try_execve("/init");
        try_execve("/bin/sh");
        panic!("no init process could be run");
    }

    let (_, status, _) = wait::sys_wait4(pid, 0).expect("wait for init failed");
    if wait::wifexited(status) {
        panic!("init process terminated with status {}", wait::wexitstatus(status));
    } else if wait::wifsignaled(status) {
        panic!("init process received signal {}", wait::wtermsig(status));
    } else {
        panic!("init process killed");
    }
}

/// Late kernel entry, after the memory manager and scheduler are up.
///
/// Mirrors the boot sequence: command line, device maps, root mount,
/// entropy, first yield, banner, then init.
pub fn kentry(cmdline: &str, boot_ticks: u64, boot_time: i64) -> ! {
    let options = init_command_line(cmdline).expect("boot option `root' missing");
    if let Some(level) = options.log_level {
        pml_core::log::set_echo_threshold(level);
    }
    drivers::device_map_init();
    rootfs::mount_root(&options.root_device).expect("cannot mount root filesystem");
    random::random_init(boot_ticks);
    let _ = signal::sys_sigprocmask(signal::SIG_SETMASK, Some(0));
    proc::sched_yield();

    splash(boot_time);
    fork_init();
}

/// Yields in a loop forever; the scheduler runs everything else.
pub fn idle() -> ! {
    loop {
        proc::sched_yield();
        crate::arch::halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_requires_root() {
        let opts = init_command_line("console=ttyS0 root=sd0p1 quiet").unwrap();
        assert_eq!(opts.root_device, "sd0p1");
        assert!(init_command_line("console=ttyS0 quiet").is_err());
        assert!(init_command_line("root").is_err());
    }

    #[test]
    fn unknown_keys_ignored() {
        let opts = init_command_line("a=b root=ram0 c d=e=f").unwrap();
        assert_eq!(opts.root_device, "ram0");
        assert_eq!(opts.log_level, None);
    }

    #[test]
    fn loglevel_option_parses_and_bounds() {
        let opts = init_command_line("root=ram0 loglevel=4").unwrap();
        assert_eq!(opts.log_level, Some(LogLevel::Debug));
        assert!(init_command_line("root=ram0 loglevel=9").is_err());
        assert!(init_command_line("root=ram0 loglevel").is_err());
    }

    #[test]
    fn splash_does_not_require_a_sink() {
        splash(0);
    }
}
