//! The `wait4` rendezvous.
//!
//! A waiting parent fills its wait slot and polls it on every yield; the
//! scheduler's reaper fills the slot when a matching child goes away.

use pml_core::{Errno, Result};

use super::resource::Rusage;
use super::{pid_exists, sched_yield, with_current, Pid, Process};

/// `wait4` flag: return immediately when no child has changed state.
pub const WNOHANG: i32 = 1;
/// `wait4` flag: also report stopped children.
pub const WUNTRACED: i32 = 2;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// Stopped by a signal.
    Stopped(i32),
}

/// Rendezvous status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStatus {
    /// No wait in progress.
    #[default]
    None,
    /// The parent is waiting.
    Waiting,
    /// A child exited.
    Exited,
    /// A child died to a signal.
    Signaled,
    /// A child stopped.
    Stopped,
}

/// Per-process wait slot.
#[derive(Debug, Clone, Default)]
pub struct WaitState {
    /// Requested pid (`-1`/`0` for any / same group).
    pub pid: Pid,
    /// Slot state.
    pub status: WaitStatus,
    /// Exit code or signal number.
    pub code: i32,
    /// Process group of the reported child.
    pub pgid: Pid,
    /// Usage of the reported child.
    pub rusage: Rusage,
    /// Whether stopped children should be reported.
    pub do_stopped: bool,
}

/// Encodes a wait status word: normal exit in the high byte, termination
/// signal in the low seven bits, `0x7f` marking a stop.
pub fn encode_status(kind: ExitKind) -> i32 {
    match kind {
        ExitKind::Exited(code) => (code & 0xff) << 8,
        ExitKind::Signaled(sig) => sig & 0x7f,
        ExitKind::Stopped(sig) => ((sig & 0xff) << 8) | 0x7f,
    }
}

/// `WIFEXITED` over an encoded status.
pub fn wifexited(status: i32) -> bool {
    status & 0x7f == 0
}

/// `WEXITSTATUS` over an encoded status.
pub fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// `WIFSIGNALED` over an encoded status.
pub fn wifsignaled(status: i32) -> bool {
    ((status & 0x7f) + 1) >> 1 > 0
}

/// `WTERMSIG` over an encoded status.
pub fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}

/// Called by the reaper: hand `kind` to `parent` if it is waiting for this
/// child.
pub fn notify_parent(parent: &mut Process, child: Pid, child_pgid: Pid, kind: ExitKind, rusage: &Rusage) {
    let ws = &mut parent.wait;
    if ws.status != WaitStatus::Waiting {
        return;
    }
    if ws.pid > 0 && ws.pid != child {
        return;
    }
    if matches!(kind, ExitKind::Stopped(_)) && !ws.do_stopped {
        return;
    }
    ws.status = match kind {
        ExitKind::Exited(_) => WaitStatus::Exited,
        ExitKind::Signaled(_) => WaitStatus::Signaled,
        ExitKind::Stopped(_) => WaitStatus::Stopped,
    };
    ws.code = match kind {
        ExitKind::Exited(code) | ExitKind::Signaled(code) | ExitKind::Stopped(code) => code,
    };
    ws.pid = child;
    ws.pgid = child_pgid;
    ws.rusage = rusage.clone();
}

/// One non-blocking check of the wait slot.
///
/// Returns `Some((pid, status, rusage))` when a child has been delivered.
fn do_wait(req_pid: Pid, own_pgid: Pid) -> Option<(Pid, i32, Rusage)> {
    with_current(|process| {
        let ws = &mut process.wait;
        match ws.status {
            WaitStatus::None | WaitStatus::Waiting => return None,
            _ => {}
        }
        // A pgid-scoped wait only accepts children of the caller's group.
        if req_pid == 0 && ws.pgid != own_pgid {
            return None;
        }
        let kind = match ws.status {
            WaitStatus::Exited => ExitKind::Exited(ws.code),
            WaitStatus::Signaled => ExitKind::Signaled(ws.code),
            WaitStatus::Stopped => ExitKind::Stopped(ws.code),
            _ => unreachable!(),
        };
        let result = (ws.pid, encode_status(kind), ws.rusage.clone());
        ws.status = WaitStatus::None;
        Some(result)
    })
}

/// `wait4(2)`: waits for a child state change.
///
/// Negative pids wait on the process group `-pid`; `WNOHANG` makes a
/// single check and returns pid 0 when nothing is ready.
pub fn sys_wait4(pid: Pid, flags: i32) -> Result<(Pid, i32, Rusage)> {
    let pid = if pid < -1 { -pid } else { pid };
    let (own_pgid, has_children, already_waited) = with_current(|p| {
        (p.pgid, !p.cpids.is_empty(), p.wait.status != WaitStatus::None)
    });
    if !has_children && !already_waited {
        return Err(Errno::ECHILD);
    }
    if pid > 0 && !pid_exists(pid) && !already_waited {
        return Err(Errno::ESRCH);
    }

    with_current(|p| {
        if p.wait.status == WaitStatus::None || p.wait.status == WaitStatus::Waiting {
            p.wait.pid = pid;
            p.wait.status = WaitStatus::Waiting;
            p.wait.do_stopped = flags & WUNTRACED != 0;
        }
    });

    if flags & WNOHANG != 0 {
        return Ok(do_wait(pid, own_pgid).unwrap_or((0, 0, Rusage::default())));
    }
    loop {
        if let Some(result) = do_wait(pid, own_pgid) {
            return Ok(result);
        }
        sched_yield();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;
    use crate::proc::{process_exit, process_fork, with_queue};

    fn run_as(pid: Pid) {
        with_queue(|q| {
            let idx = q.index_of(pid).unwrap();
            q.front = idx;
        });
    }

    #[test]
    fn status_encoding_matches_posix_macros() {
        let exited = encode_status(ExitKind::Exited(3));
        assert!(wifexited(exited));
        assert_eq!(wexitstatus(exited), 3);
        assert!(!wifsignaled(exited));

        let killed = encode_status(ExitKind::Signaled(11));
        assert!(wifsignaled(killed));
        assert_eq!(wtermsig(killed), 11);
        assert!(!wifexited(killed));
    }

    #[test]
    fn wait_collects_exited_child() {
        let _sys = fresh_system();
        let parent = with_current(|p| p.pid);
        let child = process_fork().unwrap();

        // Parent registers interest first (WNOHANG poll with nothing ready).
        let (ready, _, _) = sys_wait4(child, WNOHANG).unwrap();
        assert_eq!(ready, 0);

        // Child runs and exits 3.
        run_as(child);
        process_exit(ExitKind::Exited(3));
        crate::proc::sched_yield();

        run_as(parent);
        let (pid, status, _) = sys_wait4(child, 0).unwrap();
        assert_eq!(pid, child);
        assert!(wifexited(status));
        assert_eq!(wexitstatus(status), 3);
    }

    #[test]
    fn wait_reports_signal_death() {
        let _sys = fresh_system();
        let parent = with_current(|p| p.pid);
        let child = process_fork().unwrap();
        sys_wait4(-1, WNOHANG).unwrap();

        run_as(child);
        process_exit(ExitKind::Signaled(11));
        crate::proc::sched_yield();

        run_as(parent);
        let (pid, status, _) = sys_wait4(-1, 0).unwrap();
        assert_eq!(pid, child);
        assert!(wifsignaled(status));
        assert_eq!(wtermsig(status), 11);
    }

    #[test]
    fn no_children_is_echild() {
        let _sys = fresh_system();
        assert_eq!(sys_wait4(-1, 0).unwrap_err(), Errno::ECHILD);
    }

    #[test]
    fn bad_pid_is_esrch() {
        let _sys = fresh_system();
        process_fork().unwrap();
        assert_eq!(sys_wait4(4242, WNOHANG).unwrap_err(), Errno::ESRCH);
    }
}
