//! Resource usage accounting and scheduling priority.
//!
//! Priorities are stored and permission-checked but the scheduler ignores
//! them in this revision.

use pml_core::{Errno, Result};

use super::{with_current, with_queue, Pid, PRIO_MAX, PRIO_MIN};

/// `getrusage` selector: the calling process.
pub const RUSAGE_SELF: i32 = 0;
/// `getrusage` selector: reaped children.
pub const RUSAGE_CHILDREN: i32 = -1;

/// `get/setpriority` selector: a single process.
pub const PRIO_PROCESS: i32 = 0;
/// Selector: a process group.
pub const PRIO_PGRP: i32 = 1;
/// Selector: every process of a user.
pub const PRIO_USER: i32 = 2;

/// Resource usage counters (microseconds and event counts).
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct Rusage {
    /// User CPU time in microseconds.
    pub utime_us: u64,
    /// System CPU time in microseconds.
    pub stime_us: u64,
    /// Peak resident set size.
    pub maxrss: u64,
    /// Minor page faults.
    pub minflt: u64,
    /// Major page faults.
    pub majflt: u64,
    /// Blocks read.
    pub inblock: u64,
    /// Blocks written.
    pub oublock: u64,
    /// Voluntary context switches.
    pub nvcsw: u64,
    /// Involuntary context switches.
    pub nivcsw: u64,
}

impl Rusage {
    /// Folds another usage record into this one (child reaping).
    pub fn accumulate(&mut self, other: &Rusage) {
        self.utime_us += other.utime_us;
        self.stime_us += other.stime_us;
        self.maxrss = self.maxrss.max(other.maxrss);
        self.minflt += other.minflt;
        self.majflt += other.majflt;
        self.inblock += other.inblock;
        self.oublock += other.oublock;
        self.nvcsw += other.nvcsw;
        self.nivcsw += other.nivcsw;
    }
}

/// `getrusage(2)`.
pub fn sys_getrusage(who: i32) -> Result<Rusage> {
    match who {
        RUSAGE_SELF => Ok(with_current(|p| p.rusage_self.clone())),
        RUSAGE_CHILDREN => Ok(with_current(|p| p.rusage_children.clone())),
        _ => Err(Errno::EINVAL),
    }
}

/// `getpriority(2)`: the strongest (lowest) priority matching the selector.
pub fn sys_getpriority(which: i32, who: i32) -> Result<i32> {
    let current = with_current(|p| (p.pid, p.pgid, p.uid));
    with_queue(|q| {
        let mut prio = PRIO_MIN + 1;
        match which {
            PRIO_PROCESS => {
                let pid = if who == 0 { current.0 } else { who as Pid };
                let index = q.index_of(pid).ok_or(Errno::ESRCH)?;
                prio = q.queue[index].priority;
            }
            PRIO_PGRP => {
                let pgid = if who == 0 { current.1 } else { who as Pid };
                for process in &q.queue {
                    if process.pgid == pgid && process.priority < prio {
                        prio = process.priority;
                    }
                }
            }
            PRIO_USER => {
                let uid = if who == 0 { current.2 } else { who as u32 };
                for process in &q.queue {
                    if process.euid == uid && process.priority < prio {
                        prio = process.priority;
                    }
                }
            }
            _ => return Err(Errno::EINVAL),
        }
        if prio > PRIO_MIN {
            return Err(Errno::ESRCH);
        }
        Ok(prio)
    })
}

/// `setpriority(2)`.
///
/// The value clamps into `[-20, 19]`. Non-root callers may only touch
/// processes running as themselves, and may only weaken (raise) priority.
pub fn sys_setpriority(which: i32, who: i32, prio: i32) -> Result<()> {
    let prio = prio.clamp(PRIO_MAX, PRIO_MIN);
    let current = with_current(|p| (p.pid, p.pgid, p.uid, p.euid));
    let (cur_pid, cur_pgid, cur_uid, cur_euid) = current;
    with_queue(|q| {
        let mut touched = false;
        for process in q.queue.iter_mut() {
            let selected = match which {
                PRIO_PROCESS => {
                    let pid = if who == 0 { cur_pid } else { who as Pid };
                    process.pid == pid
                }
                PRIO_PGRP => {
                    let pgid = if who == 0 { cur_pgid } else { who as Pid };
                    process.pgid == pgid
                }
                PRIO_USER => {
                    let uid = if who == 0 { cur_uid } else { who as u32 };
                    process.euid == uid
                }
                _ => return Err(Errno::EINVAL),
            };
            if !selected {
                continue;
            }
            if cur_euid != 0 && cur_euid != process.euid && cur_euid != process.uid {
                return Err(Errno::EPERM);
            }
            if cur_euid != 0 && prio < process.priority {
                return Err(Errno::EACCES);
            }
            process.priority = prio;
            touched = true;
        }
        if touched { Ok(()) } else { Err(Errno::ESRCH) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::testhooks::fresh_system;
    use crate::proc::process_fork;

    #[test]
    fn rusage_selectors() {
        let _sys = fresh_system();
        with_current(|p| {
            p.rusage_self.utime_us = 500;
            p.rusage_children.utime_us = 900;
        });
        assert_eq!(sys_getrusage(RUSAGE_SELF).unwrap().utime_us, 500);
        assert_eq!(sys_getrusage(RUSAGE_CHILDREN).unwrap().utime_us, 900);
        assert_eq!(sys_getrusage(7).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn priority_clamps_and_reads_back() {
        let _sys = fresh_system();
        sys_setpriority(PRIO_PROCESS, 0, 100).unwrap();
        assert_eq!(sys_getpriority(PRIO_PROCESS, 0).unwrap(), PRIO_MIN);
        sys_setpriority(PRIO_PROCESS, 0, -100).unwrap();
        assert_eq!(sys_getpriority(PRIO_PROCESS, 0).unwrap(), PRIO_MAX);
    }

    #[test]
    fn non_root_may_only_weaken() {
        let _sys = fresh_system();
        let child = process_fork().unwrap();
        with_queue(|q| {
            // Run unprivileged over a same-uid child at priority 5.
            let front = q.front;
            q.queue[front].euid = 100;
            q.queue[front].uid = 100;
            let idx = q.index_of(child).unwrap();
            q.queue[idx].euid = 100;
            q.queue[idx].uid = 100;
            q.queue[idx].priority = 5;
        });
        // Strengthening (nicing down) fails, weakening succeeds.
        assert_eq!(
            sys_setpriority(PRIO_PROCESS, child, 0).unwrap_err(),
            Errno::EACCES
        );
        sys_setpriority(PRIO_PROCESS, child, 10).unwrap();
        assert_eq!(sys_getpriority(PRIO_PROCESS, child).unwrap(), 10);

        // A foreign-uid process is off limits entirely.
        with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            q.queue[idx].euid = 200;
            q.queue[idx].uid = 200;
        });
        assert_eq!(
            sys_setpriority(PRIO_PROCESS, child, 15).unwrap_err(),
            Errno::EPERM
        );
    }

    #[test]
    fn group_priority_is_minimum() {
        let _sys = fresh_system();
        let a = process_fork().unwrap();
        let b = process_fork().unwrap();
        with_queue(|q| {
            let ia = q.index_of(a).unwrap();
            q.queue[ia].pgid = 9;
            q.queue[ia].priority = 4;
            let ib = q.index_of(b).unwrap();
            q.queue[ib].pgid = 9;
            q.queue[ib].priority = -3;
        });
        assert_eq!(sys_getpriority(PRIO_PGRP, 9).unwrap(), -3);
    }
}
