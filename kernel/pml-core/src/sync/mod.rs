//! Synchronization primitives.
//!
//! The kernel runs cooperatively on one CPU, but fd and vnode reference
//! counts and these primitives use real atomics so the fork dup-all path
//! stays correct if more CPUs ever run threads.

mod semaphore;
mod spinlock;

pub use self::semaphore::Semaphore;
pub use self::spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

/// Thread identifier as seen by the semaphore blocked list.
///
/// Thread ids share the PID namespace; the scheduler owns the mapping back
/// to thread structures.
pub type Tid = i32;
