//! Minimal terminal device.
//!
//! Carries termios state and the window size, and forwards bytes to the
//! console sink. Window resizes raise `SIGWINCH` on the foreground process
//! group; everything below (line discipline, VT100 emulation) belongs to
//! the console driver.

use alloc::boxed::Box;
use alloc::sync::Arc;

use pml_core::sync::SpinLock;
use pml_core::{kprint, Errno, Result};
use pml_fs::vnode::{Vnode, VnodeOps};

use crate::proc::signal::{self, SIGWINCH};
use crate::proc::Pid;

/// Get termios state.
pub const TCGETS: u64 = 0x5401;
/// Set termios state immediately.
pub const TCSETS: u64 = 0x5402;
/// Set termios state after draining output.
pub const TCSETSW: u64 = 0x5403;
/// Set termios state after draining and flushing input.
pub const TCSETSF: u64 = 0x5404;
/// Get the foreground process group.
pub const TIOCGPGRP: u64 = 0x540f;
/// Set the foreground process group.
pub const TIOCSPGRP: u64 = 0x5410;
/// Get the window size.
pub const TIOCGWINSZ: u64 = 0x5413;
/// Set the window size.
pub const TIOCSWINSZ: u64 = 0x5414;

/// Number of control characters.
pub const NCCS: usize = 32;

/// Terminal modes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Termios {
    pub c_iflag: u32,
    pub c_oflag: u32,
    pub c_cflag: u32,
    pub c_lflag: u32,
    pub c_line: u8,
    pub c_cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        Self {
            c_iflag: 0o11400,  // ICRNL | IXON-ish defaults
            c_oflag: 0o5,      // OPOST | ONLCR
            c_cflag: 0o2277,   // B38400 | CS8 | CREAD
            c_lflag: 0o105073, // ISIG | ICANON | ECHO ...
            c_line: 0,
            c_cc: [0; NCCS],
        }
    }
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

struct TtyState {
    termios: Termios,
    winsize: Winsize,
    /// Foreground process group; resizes signal it.
    fg_pgid: Pid,
}

/// A terminal character device.
pub struct Tty {
    state: SpinLock<TtyState>,
    /// Pulls one byte of input, `None` when no input driver is attached.
    input: Option<fn() -> Option<u8>>,
}

impl Tty {
    /// Creates a terminal vnode with an 80x25 window.
    pub fn new_vnode(input: Option<fn() -> Option<u8>>) -> Arc<Vnode> {
        let tty = Self {
            state: SpinLock::new(TtyState {
                termios: Termios::default(),
                winsize: Winsize {
                    ws_row: 25,
                    ws_col: 80,
                    ws_xpixel: 0,
                    ws_ypixel: 0,
                },
                fg_pgid: 0,
            }),
            input,
        };
        let vp = Vnode::new(0, Box::new(tty), None);
        vp.attr.lock().mode = pml_fs::mode::S_IFCHR | 0o666;
        vp
    }
}

impl VnodeOps for Tty {
    fn read(&self, _vp: &Vnode, buf: &mut [u8], _offset: u64) -> Result<usize> {
        let Some(input) = self.input else {
            return Ok(0);
        };
        let mut n = 0;
        while n < buf.len() {
            match input() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                    if byte == b'\n' {
                        break;
                    }
                }
                None if n == 0 => {
                    crate::proc::sched_yield();
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&self, _vp: &Vnode, buf: &[u8], _offset: u64) -> Result<usize> {
        for chunk in buf.utf8_chunks() {
            kprint!("{}", chunk.valid());
        }
        Ok(buf.len())
    }

    fn ioctl(&self, _vp: &Vnode, req: u64, arg: usize) -> Result<isize> {
        match req {
            TCGETS => {
                let state = self.state.lock();
                // SAFETY: The syscall layer validated `arg` as a writable
                // user pointer of the right size.
                unsafe { (arg as *mut Termios).write(state.termios) };
                Ok(0)
            }
            TCSETS | TCSETSW | TCSETSF => {
                let mut state = self.state.lock();
                // SAFETY: As above, for reads.
                state.termios = unsafe { (arg as *const Termios).read() };
                Ok(0)
            }
            TIOCGWINSZ => {
                let state = self.state.lock();
                // SAFETY: As above.
                unsafe { (arg as *mut Winsize).write(state.winsize) };
                Ok(0)
            }
            TIOCSWINSZ => {
                let pgid = {
                    let mut state = self.state.lock();
                    // SAFETY: As above.
                    state.winsize = unsafe { (arg as *const Winsize).read() };
                    state.fg_pgid
                };
                if pgid > 0 {
                    let _ = signal::sys_killpg(pgid, SIGWINCH);
                }
                Ok(0)
            }
            TIOCGPGRP => {
                let state = self.state.lock();
                // SAFETY: As above.
                unsafe { (arg as *mut Pid).write(state.fg_pgid) };
                Ok(0)
            }
            TIOCSPGRP => {
                let mut state = self.state.lock();
                // SAFETY: As above.
                state.fg_pgid = unsafe { (arg as *const Pid).read() };
                Ok(0)
            }
            _ => Err(Errno::ENOTTY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;

    #[test]
    fn termios_roundtrip() {
        let _sys = fresh_system();
        let vp = Tty::new_vnode(None);
        let mut t = Termios::default();
        vp.ops.ioctl(&vp, TCGETS, &mut t as *mut _ as usize).unwrap();
        t.c_lflag = 0;
        vp.ops.ioctl(&vp, TCSETS, &t as *const _ as usize).unwrap();
        let mut back = Termios::default();
        vp.ops
            .ioctl(&vp, TCGETS, &mut back as *mut _ as usize)
            .unwrap();
        assert_eq!(back.c_lflag, 0);
    }

    #[test]
    fn winsize_resize_signals_foreground_group() {
        let _sys = fresh_system();
        let child = crate::proc::process_fork().unwrap();
        crate::proc::with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            q.queue[idx].pgid = 3;
        });

        let vp = Tty::new_vnode(None);
        let ws = Winsize { ws_row: 50, ws_col: 132, ws_xpixel: 0, ws_ypixel: 0 };
        // Resizing with no foreground group signals nobody.
        vp.ops.ioctl(&vp, TIOCSWINSZ, &ws as *const _ as usize).unwrap();
        crate::proc::with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            assert_eq!(q.queue[idx].threads.queue[0].sigpending, 0);
        });

        let pgid: Pid = 3;
        vp.ops.ioctl(&vp, TIOCSPGRP, &pgid as *const _ as usize).unwrap();
        vp.ops.ioctl(&vp, TIOCSWINSZ, &ws as *const _ as usize).unwrap();
        crate::proc::with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            assert_ne!(
                q.queue[idx].threads.queue[0].sigpending & (1 << SIGWINCH),
                0
            );
        });

        let mut got = Winsize::default();
        vp.ops.ioctl(&vp, TIOCGWINSZ, &mut got as *mut _ as usize).unwrap();
        assert_eq!(got.ws_col, 132);
        assert_eq!(vp.ops.ioctl(&vp, 0x9999, 0).unwrap_err(), Errno::ENOTTY);
    }
}
