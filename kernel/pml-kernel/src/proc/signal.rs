//! Signal queuing.
//!
//! Delivery to user space (stack frame construction, `sigreturn`) belongs
//! to the interrupt plumbing; this module owns the pending/blocked sets,
//! the disposition table, and target selection.

use pml_core::{Errno, Result};

use super::{with_current, with_queue, Pid, Process, Thread, ThreadState};
use crate::NSIG;

/// Hangup.
pub const SIGHUP: i32 = 1;
/// Interrupt.
pub const SIGINT: i32 = 2;
/// Illegal instruction.
pub const SIGILL: i32 = 4;
/// Kill (uncatchable).
pub const SIGKILL: i32 = 9;
/// Invalid memory reference.
pub const SIGSEGV: i32 = 11;
/// Broken pipe.
pub const SIGPIPE: i32 = 13;
/// Termination request.
pub const SIGTERM: i32 = 15;
/// Child state change.
pub const SIGCHLD: i32 = 17;
/// Stop (uncatchable).
pub const SIGSTOP: i32 = 19;
/// Window size change.
pub const SIGWINCH: i32 = 28;

/// Disposition values for `sigaction.handler`.
pub const SIG_DFL: usize = 0;
/// Ignore the signal.
pub const SIG_IGN: usize = 1;

/// `sigprocmask` operations.
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// Details queued with a signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    /// Signal number.
    pub signo: i32,
    /// Origin code.
    pub code: i32,
    /// Associated errno.
    pub errno: i32,
    /// Sending process.
    pub pid: Pid,
    /// Sending user.
    pub uid: u32,
}

/// One entry of the disposition table.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SigAction {
    /// Handler address, or `SIG_DFL` / `SIG_IGN`.
    pub handler: usize,
    /// Signals blocked while the handler runs.
    pub mask: u64,
    /// `SA_*` flags.
    pub flags: u32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
        }
    }
}

impl SigAction {
    /// An action catching the signal at `handler`.
    pub fn handler(handler: usize) -> Self {
        Self {
            handler,
            mask: 0,
            flags: 0,
        }
    }

    /// The ignore action.
    pub fn ignore() -> Self {
        Self {
            handler: SIG_IGN,
            mask: 0,
            flags: 0,
        }
    }

    /// Whether this is the default disposition.
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    /// Whether the signal is ignored.
    pub fn is_ignored(&self) -> bool {
        self.handler == SIG_IGN
    }
}

fn sig_bit(sig: i32) -> u64 {
    1u64 << (sig as u64)
}

/// Whether `sig` is a valid, alterable signal number.
fn sig_valid(sig: i32) -> bool {
    sig > 0 && (sig as usize) < NSIG
}

/// Queues `sig` on a specific thread; duplicates coalesce.
pub fn send_signal_thread(thread: &mut Thread, sig: i32, info: SigInfo) {
    if thread.sigpending & sig_bit(sig) != 0 {
        return;
    }
    thread.sigpending |= sig_bit(sig);
    thread.siginfo[sig as usize] = info;
}

/// Queues `sig` on a process.
///
/// Prefers a RUNNING thread that does not block the signal, then any
/// RUNNING thread, then thread 0 as a last resort.
pub fn send_signal(process: &mut Process, sig: i32, info: SigInfo) {
    let target = process
        .threads
        .queue
        .iter()
        .position(|t| t.state == ThreadState::Running && t.sigblocked & sig_bit(sig) == 0)
        .or_else(|| {
            process
                .threads
                .queue
                .iter()
                .position(|t| t.state == ThreadState::Running)
        })
        .unwrap_or(0);
    send_signal_thread(&mut process.threads.queue[target], sig, info);
}

/// `kill(2)`: signal a process by pid.
pub fn sys_kill(target: Pid, sig: i32) -> Result<()> {
    if !sig_valid(sig) {
        return Err(Errno::EINVAL);
    }
    let (from_pid, from_uid) = with_current(|p| (p.pid, p.uid));
    let info = SigInfo {
        signo: sig,
        code: 0,
        errno: 0,
        pid: from_pid,
        uid: from_uid,
    };
    with_queue(|q| {
        let index = q.index_of(target).ok_or(Errno::ESRCH)?;
        send_signal(&mut q.queue[index], sig, info);
        Ok(())
    })
}

/// `killpg(2)`: signal every process in a group.
pub fn sys_killpg(pgid: Pid, sig: i32) -> Result<()> {
    if !sig_valid(sig) {
        return Err(Errno::EINVAL);
    }
    let (from_pid, from_uid) = with_current(|p| (p.pid, p.uid));
    let info = SigInfo {
        signo: sig,
        code: 0,
        errno: 0,
        pid: from_pid,
        uid: from_uid,
    };
    with_queue(|q| {
        let mut hit = false;
        for process in q.queue.iter_mut() {
            if process.pgid == pgid {
                send_signal(process, sig, info);
                hit = true;
            }
        }
        if hit { Ok(()) } else { Err(Errno::ESRCH) }
    })
}

/// `sigaction(2)`: queries and/or replaces a disposition.
///
/// `SIGKILL` and `SIGSTOP` cannot be altered.
pub fn sys_sigaction(sig: i32, act: Option<SigAction>) -> Result<SigAction> {
    if !sig_valid(sig) || sig == SIGKILL || sig == SIGSTOP {
        return Err(Errno::EINVAL);
    }
    Ok(with_current(|process| {
        let old = process.sighandlers[sig as usize];
        if let Some(act) = act {
            process.sighandlers[sig as usize] = act;
        }
        old
    }))
}

/// `signal(2)` in terms of `sigaction`.
pub fn sys_signal(sig: i32, handler: usize) -> Result<usize> {
    let old = sys_sigaction(sig, Some(SigAction::handler(handler)))?;
    Ok(old.handler)
}

/// `sigprocmask(2)` on the current thread; returns the previous mask.
pub fn sys_sigprocmask(how: i32, set: Option<u64>) -> Result<u64> {
    with_current(|process| {
        let thread = process.current_thread_mut();
        let old = thread.sigblocked;
        if let Some(set) = set {
            // KILL and STOP stay unblockable.
            let set = set & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
            thread.sigblocked = match how {
                SIG_BLOCK => old | set,
                SIG_UNBLOCK => old & !set,
                SIG_SETMASK => set,
                _ => return Err(Errno::EINVAL),
            };
        }
        Ok(old)
    })
}

/// Takes the lowest pending, unblocked signal off the current thread.
pub fn dequeue_signal() -> Option<(i32, SigInfo)> {
    with_current(|process| {
        let thread = process.current_thread_mut();
        let ready = thread.sigpending & !thread.sigblocked;
        if ready == 0 {
            return None;
        }
        let sig = ready.trailing_zeros() as i32;
        thread.sigpending &= !sig_bit(sig);
        Some((sig, thread.siginfo[sig as usize]))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;
    use crate::proc::{process_fork, with_queue};

    #[test]
    fn coalesces_duplicates() {
        let _sys = fresh_system();
        with_current(|p| {
            let t = p.current_thread_mut();
            send_signal_thread(t, SIGTERM, SigInfo { signo: SIGTERM, pid: 42, ..Default::default() });
            send_signal_thread(t, SIGTERM, SigInfo { signo: SIGTERM, pid: 99, ..Default::default() });
            assert_eq!(t.sigpending.count_ones(), 1);
            // The first queued info wins.
            assert_eq!(t.siginfo[SIGTERM as usize].pid, 42);
        });
    }

    #[test]
    fn prefers_unblocking_running_thread() {
        let _sys = fresh_system();
        with_current(|p| {
            let mut second = crate::proc::Thread::new(Default::default()).unwrap();
            second.sigblocked = 0;
            p.threads.queue[0].sigblocked = 1 << SIGINT;
            p.attach_thread(second);

            send_signal(p, SIGINT, SigInfo::default());
            assert_eq!(p.threads.queue[0].sigpending, 0);
            assert_ne!(p.threads.queue[1].sigpending & (1 << SIGINT), 0);
        });
    }

    #[test]
    fn kill_and_killpg_target_correctly() {
        let _sys = fresh_system();
        let a = process_fork().unwrap();
        let b = process_fork().unwrap();
        with_queue(|q| {
            let idx = q.index_of(b).unwrap();
            q.queue[idx].pgid = 5;
        });
        sys_kill(a, SIGTERM).unwrap();
        sys_killpg(5, SIGHUP).unwrap();
        with_queue(|q| {
            let ia = q.index_of(a).unwrap();
            assert_ne!(q.queue[ia].threads.queue[0].sigpending & (1 << SIGTERM), 0);
            let ib = q.index_of(b).unwrap();
            assert_ne!(q.queue[ib].threads.queue[0].sigpending & (1 << SIGHUP), 0);
        });
        assert_eq!(sys_kill(9999, SIGTERM).unwrap_err(), Errno::ESRCH);
        assert_eq!(sys_killpg(77, SIGTERM).unwrap_err(), Errno::ESRCH);
    }

    #[test]
    fn kill_stop_unalterable() {
        let _sys = fresh_system();
        assert_eq!(
            sys_sigaction(SIGKILL, Some(SigAction::ignore())).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            sys_sigaction(SIGSTOP, Some(SigAction::ignore())).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn sigprocmask_round_trips() {
        let _sys = fresh_system();
        let initial = sys_sigprocmask(SIG_SETMASK, None).unwrap();
        let _ = sys_sigprocmask(SIG_SETMASK, Some(1 << SIGTERM | 1 << SIGINT)).unwrap();
        let old = sys_sigprocmask(SIG_BLOCK, Some(1 << SIGHUP)).unwrap();
        assert_eq!(old, 1 << SIGTERM | 1 << SIGINT);
        // Restoring the saved mask returns the set to its initial value.
        sys_sigprocmask(SIG_SETMASK, Some(initial)).unwrap();
        assert_eq!(sys_sigprocmask(SIG_SETMASK, None).unwrap(), initial);
    }

    #[test]
    fn blocked_signals_stay_queued() {
        let _sys = fresh_system();
        sys_sigprocmask(SIG_BLOCK, Some(1 << SIGTERM)).unwrap();
        with_current(|p| {
            let pid = p.pid;
            send_signal(p, SIGTERM, SigInfo { signo: SIGTERM, pid, ..Default::default() });
        });
        assert!(dequeue_signal().is_none());
        sys_sigprocmask(SIG_UNBLOCK, Some(1 << SIGTERM)).unwrap();
        let (sig, _) = dequeue_signal().unwrap();
        assert_eq!(sig, SIGTERM);
    }
}
