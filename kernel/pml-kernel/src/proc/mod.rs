//! Processes, threads, and the cooperative scheduler.
//!
//! One CPU runs everything. The scheduler walks a ring of processes, each
//! holding a ring of threads; `sched_yield` advances the cursors to the
//! next RUNNING thread and, once boot arms it, performs the hardware
//! switch. Any code mutating the queues holds the global switch lock so
//! the current process stays pinned across the critical section.

pub mod pid;
pub mod resource;
pub mod signal;
pub mod wait;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use pml_core::sync::SpinLock;
use pml_core::{kdebug, Errno, Result};
use pml_fs::fd::FdTable;
use pml_fs::{Cred, Vnode};

use crate::arch;
use crate::mman::MmapTable;
use crate::NSIG;
pub use self::pid::Pid;
use self::resource::Rusage;
use self::signal::{SigAction, SigInfo};
use self::wait::WaitState;

/// Minimum (weakest) process priority.
pub const PRIO_MIN: i32 = 19;
/// Maximum (strongest) process priority.
pub const PRIO_MAX: i32 = -20;

/// Thread scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run.
    Running,
    /// Waiting on a semaphore.
    Blocked,
    /// Waiting on an I/O operation.
    Io,
}

/// Properties a thread needs to run: its address space and stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadArgs {
    /// Physical address of the thread's PML4.
    pub pml4: u64,
    /// Current stack pointer (virtual).
    pub stack: u64,
    /// Bottom of the stack.
    pub stack_base: u64,
    /// Stack size in bytes.
    pub stack_size: u64,
    /// Entry point for a thread that has never run.
    pub entry: u64,
    /// Argument handed to `entry`.
    pub arg: u64,
    /// Saved kernel context while suspended.
    pub context: arch::Context,
}

/// A thread of execution.
pub struct Thread {
    /// Thread id (shares the PID namespace).
    pub tid: Pid,
    /// Execution properties.
    pub args: ThreadArgs,
    /// Scheduling state.
    pub state: ThreadState,
    /// Pending signal bits.
    pub sigpending: u64,
    /// Blocked signal bits.
    pub sigblocked: u64,
    /// Queued signal details, one slot per signal.
    pub siginfo: [SigInfo; NSIG],
    /// Thread-local errno.
    pub error: i32,
}

impl Thread {
    /// Creates a RUNNING thread with a fresh id.
    pub fn new(args: ThreadArgs) -> Result<Self> {
        let tid = pid::alloc_pid()?;
        Ok(Self {
            tid,
            args,
            state: ThreadState::Running,
            sigpending: 0,
            sigblocked: 0,
            siginfo: [SigInfo::default(); NSIG],
            error: 0,
        })
    }
}

/// Ring of threads owned by one process.
#[derive(Default)]
pub struct ThreadQueue {
    /// The threads.
    pub queue: Vec<Thread>,
    /// Index of the currently scheduled thread.
    pub front: usize,
}

/// A process.
pub struct Process {
    /// Process id (equals the first thread's tid).
    pub pid: Pid,
    /// Parent process id.
    pub ppid: Pid,
    /// Process group id.
    pub pgid: Pid,
    /// Session id.
    pub sid: Pid,
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective group id.
    pub egid: u32,
    /// Current working directory vnode.
    pub cwd: Option<Arc<Vnode>>,
    /// Absolute path of the working directory.
    pub cwd_path: String,
    /// Thread ring; non-empty while the process is alive.
    pub threads: ThreadQueue,
    /// Nice value in `[-20, 19]`; stored but not yet scheduled on.
    pub priority: i32,
    /// Per-process file descriptors.
    pub fds: FdTable,
    /// Memory mappings, sorted by base.
    pub mmaps: MmapTable,
    /// Signal dispositions.
    pub sighandlers: [SigAction; NSIG],
    /// Live child process ids.
    pub cpids: Vec<Pid>,
    /// Rendezvous slot for `wait4`.
    pub wait: WaitState,
    /// Resource usage of this process.
    pub rusage_self: Rusage,
    /// Accumulated usage of reaped children.
    pub rusage_children: Rusage,
    /// File creation mask.
    pub umask: u32,
}

impl Process {
    /// Allocates an empty process (no threads, not enqueued).
    pub fn new(priority: i32) -> Self {
        Self {
            pid: 0,
            ppid: 0,
            pgid: 0,
            sid: 0,
            uid: 0,
            euid: 0,
            gid: 0,
            egid: 0,
            cwd: None,
            cwd_path: String::new(),
            threads: ThreadQueue::default(),
            priority,
            fds: FdTable::new(),
            mmaps: MmapTable::new(),
            sighandlers: [SigAction::default(); NSIG],
            cpids: Vec::new(),
            wait: WaitState::default(),
            rusage_self: Rusage::default(),
            rusage_children: Rusage::default(),
            umask: 0o022,
        }
    }

    /// Attaches a thread; the first one fixes the process id.
    pub fn attach_thread(&mut self, thread: Thread) {
        if self.threads.queue.is_empty() {
            self.pid = thread.tid;
        }
        self.threads.queue.push(thread);
    }

    /// The currently scheduled thread of this process.
    pub fn current_thread(&self) -> &Thread {
        &self.threads.queue[self.threads.front]
    }

    /// Mutable access to the currently scheduled thread.
    pub fn current_thread_mut(&mut self) -> &mut Thread {
        &mut self.threads.queue[self.threads.front]
    }

    /// Credentials snapshot for VFS permission checks.
    pub fn cred(&self) -> Cred {
        Cred {
            uid: self.uid,
            euid: self.euid,
            gid: self.gid,
            egid: self.egid,
        }
    }
}

/// Ring of all processes.
#[derive(Default)]
pub struct ProcessQueue {
    /// The processes.
    pub queue: Vec<Process>,
    /// Index of the currently scheduled process.
    pub front: usize,
}

impl ProcessQueue {
    /// Index of the process with `pid`, if enqueued.
    pub fn index_of(&self, pid: Pid) -> Option<usize> {
        self.queue.iter().position(|p| p.pid == pid)
    }
}

static PROCESS_QUEUE: SpinLock<ProcessQueue> = SpinLock::new(ProcessQueue {
    queue: Vec::new(),
    front: 0,
});

/// Non-zero while thread switching must not occur.
static THREAD_SWITCH_LOCK: AtomicU32 = AtomicU32::new(0);

/// Pending reap recorded by `process_exit`: `(queue index, wait code)`.
static EXIT_PENDING: SpinLock<Option<(usize, wait::ExitKind)>> = SpinLock::new(None);

/// RAII guard over the global thread-switch lock.
pub struct SwitchGuard(());

impl SwitchGuard {
    /// Takes the switch lock.
    pub fn lock() -> Self {
        THREAD_SWITCH_LOCK.fetch_add(1, Ordering::AcqRel);
        Self(())
    }
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        THREAD_SWITCH_LOCK.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Whether the scheduler must treat the context as uninterruptible.
pub fn switching_locked() -> bool {
    THREAD_SWITCH_LOCK.load(Ordering::Acquire) != 0
}

/// Runs a closure with the locked process queue.
pub fn with_queue<R>(f: impl FnOnce(&mut ProcessQueue) -> R) -> R {
    f(&mut PROCESS_QUEUE.lock())
}

/// Runs a closure with the currently scheduled process.
///
/// Fails with `ESRCH` before the scheduler is seeded.
pub fn try_with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Result<R> {
    with_queue(|q| {
        if q.queue.is_empty() {
            return Err(Errno::ESRCH);
        }
        let front = q.front;
        Ok(f(&mut q.queue[front]))
    })
}

/// Runs a closure with the currently scheduled process.
///
/// # Panics
///
/// Panics before `sched_init` has seeded the queue.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> R {
    try_with_current(f).expect("scheduler not initialized")
}

/// Pid of the current process.
pub fn current_pid() -> Pid {
    with_current(|p| p.pid)
}

/// Looks up whether `pid` names a live process.
pub fn pid_exists(pid: Pid) -> bool {
    with_queue(|q| q.index_of(pid).is_some())
}

/// Seeds the scheduler with the kernel process and its boot thread.
///
/// The boot thread reuses the running stack; its id is 0 by construction.
pub fn sched_init(kernel_pml4: u64, stack_base: u64, stack_size: u64) {
    pid::init_pid_allocator();
    let mut kernel = Process::new(PRIO_MIN);
    kernel.cwd_path = String::from("/");
    let thread = Thread {
        tid: 0,
        args: ThreadArgs {
            pml4: kernel_pml4,
            stack: 0,
            stack_base,
            stack_size,
            entry: 0,
            arg: 0,
            context: arch::Context::default(),
        },
        state: ThreadState::Running,
        sigpending: 0,
        sigblocked: 0,
        siginfo: [SigInfo::default(); NSIG],
        error: 0,
    };
    kernel.attach_thread(thread);
    kernel.pid = 0;
    with_queue(|q| {
        q.queue.push(kernel);
        q.front = 0;
    });
}

/// Advances the cursors to the next RUNNING thread.
///
/// Returns `false` when no thread anywhere is runnable (the ring was
/// walked once without finding one).
fn advance(q: &mut ProcessQueue) -> bool {
    if q.queue.is_empty() {
        return false;
    }
    let total: usize = q.queue.iter().map(|p| p.threads.queue.len().max(1)).sum();
    for _ in 0..=total {
        let process = &mut q.queue[q.front];
        process.threads.front += 1;
        if process.threads.front >= process.threads.queue.len() {
            // All threads of this process ran; go to the next process.
            process.threads.front = 0;
            q.front += 1;
            if q.front >= q.queue.len() {
                q.front = 0;
            }
        }
        let process = &q.queue[q.front];
        if !process.threads.queue.is_empty()
            && process.current_thread().state == ThreadState::Running
        {
            return true;
        }
    }
    false
}

/// Releases everything a dead process owned and notifies its parent.
fn release_process(q: &mut ProcessQueue, index: usize, kind: wait::ExitKind) {
    if index >= q.queue.len() {
        return;
    }
    let mut process = q.queue.remove(index);
    if index < q.front {
        q.front -= 1;
    }
    if q.front >= q.queue.len() {
        q.front = 0;
    }

    process.fds.close_all();
    process.mmaps.release_files();
    for thread in &process.threads.queue {
        pid::free_pid(thread.tid);
    }
    kdebug!("process {} reaped", process.pid);

    // Hand the exit status to a waiting parent.
    if let Some(parent_index) = q.index_of(process.ppid) {
        let parent = &mut q.queue[parent_index];
        parent.cpids.retain(|&pid| pid != process.pid);
        parent.rusage_children.accumulate(&process.rusage_self);
        parent.rusage_children.accumulate(&process.rusage_children);
        wait::notify_parent(parent, process.pid, process.pgid, kind, &process.rusage_self);
    }
}

/// Marks the current process for reaping on the next scheduler entry.
pub fn process_exit(kind: wait::ExitKind) {
    let front = with_queue(|q| q.front);
    *EXIT_PENDING.lock() = Some((front, kind));
}

/// Cooperative yield: reap, pick the next RUNNING thread, and switch.
///
/// With the switch lock held the context is uninterruptible and the call
/// returns immediately.
pub fn sched_yield() {
    if switching_locked() {
        return;
    }
    let pending = EXIT_PENDING.lock().take();
    with_queue(|q| {
        if let Some((index, kind)) = pending {
            release_process(q, index, kind);
        }
        if !advance(q) {
            return;
        }
        if arch::switching_enabled() {
            // The hardware switch would load the next thread's context
            // here; this revision runs one flow on the boot CPU, so moving
            // the cursors is the whole switch.
            let process = &q.queue[q.front];
            let thread = process.current_thread();
            // SAFETY: The thread's PML4 was built by the VMM and maps the
            // kernel half.
            unsafe { arch::set_cr3(thread.args.pml4) };
        }
    });
}

/// Forks the current process.
///
/// The child gets one thread (its tid is the new pid), a copy-on-write
/// stack clone of the caller's address space, duplicated fd and mmap
/// tables, the caller's working directory reference, and inherited ids,
/// priority and signal dispositions. Returns the child pid.
pub fn process_fork() -> Result<Pid> {
    let _guard = SwitchGuard::lock();
    let tid = pid::alloc_pid()?;

    let result = with_queue(|q| -> Result<()> {
        if q.queue.is_empty() {
            return Err(Errno::ESRCH);
        }
        let front = q.front;

        // Clone the address space (CoW stack) while the parent is pinned.
        let parent = &q.queue[front];
        let cur = parent.current_thread();
        let pml4 = if crate::mm::is_installed() && cur.args.pml4 != 0 {
            crate::mm::with_mm(|frames, phys| {
                // SAFETY: The thread's PML4 is a valid table root owned by
                // this process and reachable through the linear map.
                let space = unsafe {
                    pml_mm::paging::AddrSpace::from_root(
                        pml_mm::PhysAddr::new(cur.args.pml4),
                        phys,
                    )
                };
                Ok(space.clone_space(frames)?.root().as_u64())
            })?
        } else {
            cur.args.pml4
        };

        let parent = &mut q.queue[front];
        let cur = parent.current_thread();
        let mut args = cur.args;
        args.pml4 = pml4;
        let thread = Thread {
            tid,
            args,
            state: ThreadState::Running,
            sigpending: 0,
            sigblocked: cur.sigblocked,
            siginfo: [SigInfo::default(); NSIG],
            error: 0,
        };

        let mut child = Process::new(parent.priority);
        child.pid = tid;
        child.ppid = parent.pid;
        child.pgid = parent.pgid;
        child.sid = parent.sid;
        child.uid = parent.uid;
        child.euid = parent.euid;
        child.gid = parent.gid;
        child.egid = parent.egid;
        child.cwd = parent.cwd.clone();
        child.cwd_path = parent.cwd_path.clone();
        child.umask = parent.umask;
        child.sighandlers = parent.sighandlers;
        child.fds = parent.fds.fork_copy();
        child.mmaps = parent.mmaps.fork_copy();
        child.threads.queue.push(thread);
        parent.cpids.push(tid);
        q.queue.push(child);
        Ok(())
    });

    match result {
        Ok(()) => Ok(tid),
        Err(e) => {
            pid::free_pid(tid);
            Err(e)
        }
    }
}

/// Post-`execve` bookkeeping: close-on-exec descriptors go away and every
/// caught signal reverts to its default disposition.
pub fn process_exec_reset() {
    with_current(|process| {
        process.fds.close_cloexec();
        for action in process.sighandlers.iter_mut() {
            if !action.is_ignored() {
                *action = SigAction::default();
            }
        }
    });
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::wait::ExitKind;

    #[test]
    fn fork_copies_identity_and_tables() {
        let _sys = testhooks::fresh_system();
        with_current(|p| {
            p.uid = 7;
            p.euid = 7;
            p.priority = 5;
        });
        let child = process_fork().unwrap();
        assert!(child > 0);
        with_queue(|q| {
            let parent = &q.queue[0];
            assert_eq!(parent.cpids, vec![child]);
            let idx = q.index_of(child).unwrap();
            let forked = &q.queue[idx];
            assert_eq!(forked.ppid, parent.pid);
            assert_eq!(forked.uid, 7);
            assert_eq!(forked.priority, 5);
            assert_eq!(forked.threads.queue.len(), 1);
            // First thread's tid equals the pid.
            assert_eq!(forked.threads.queue[0].tid, forked.pid);
        });
    }

    #[test]
    fn round_robin_skips_blocked() {
        let _sys = testhooks::fresh_system();
        let a = process_fork().unwrap();
        let b = process_fork().unwrap();
        // Block process `a`'s only thread.
        with_queue(|q| {
            let idx = q.index_of(a).unwrap();
            q.queue[idx].threads.queue[0].state = ThreadState::Blocked;
        });

        // Walk the ring twice; the blocked process never lands in front.
        let mut seen = Vec::new();
        for _ in 0..4 {
            sched_yield();
            seen.push(with_current(|p| p.pid));
        }
        assert!(seen.contains(&b));
        assert!(!seen.contains(&a));
    }

    #[test]
    fn switch_lock_pins_front() {
        let _sys = testhooks::fresh_system();
        process_fork().unwrap();
        let before = with_queue(|q| q.front);
        {
            let _guard = SwitchGuard::lock();
            sched_yield();
            assert_eq!(with_queue(|q| q.front), before);
        }
        sched_yield();
        assert_ne!(with_queue(|q| q.front), before);
    }

    #[test]
    fn exit_reaps_on_next_yield() {
        let _sys = testhooks::fresh_system();
        let child = process_fork().unwrap();
        // Run as the child and exit.
        with_queue(|q| {
            let idx = q.index_of(child).unwrap();
            q.front = idx;
        });
        process_exit(ExitKind::Exited(3));
        sched_yield();
        assert!(!pid_exists(child));
        // The pid can be allocated again.
        assert_eq!(pid::alloc_pid().unwrap(), child);
    }

    #[test]
    fn exec_reset_clears_caught_handlers() {
        let _sys = testhooks::fresh_system();
        with_current(|p| {
            p.sighandlers[10] = SigAction::handler(0x4000_0000);
            p.sighandlers[12] = SigAction::ignore();
        });
        process_exec_reset();
        with_current(|p| {
            assert!(p.sighandlers[10].is_default());
            assert!(p.sighandlers[12].is_ignored());
        });
    }
}
