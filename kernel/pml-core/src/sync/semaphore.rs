//! Counting semaphore with a blocked-thread list.
//!
//! The scheduler glue lives above this crate: a thread that fails to take a
//! permit registers its id here, marks itself blocked, and yields. Whoever
//! signals the semaphore asks for the next id to wake.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use super::{SpinLock, Tid};

/// A counting semaphore.
///
/// Permits are taken with [`try_acquire`](Self::try_acquire); a caller that
/// cannot take one parks itself via [`block`](Self::block). Releasing a
/// permit returns the id of a thread to unblock, if any is waiting.
pub struct Semaphore {
    permits: AtomicU32,
    blocked: SpinLock<VecDeque<Tid>>,
}

impl Semaphore {
    /// Creates a semaphore with the given initial permit count.
    pub const fn new(permits: u32) -> Self {
        Self {
            permits: AtomicU32::new(permits),
            blocked: SpinLock::new(VecDeque::new()),
        }
    }

    /// Tries to take a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        loop {
            let current = self.permits.load(Ordering::Relaxed);
            if current == 0 {
                return false;
            }
            if self
                .permits
                .compare_exchange_weak(current, current - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Adds `tid` to the blocked list.
    ///
    /// Returns `false` if a permit became available in the meantime, in
    /// which case the permit was taken and the thread must not block.
    pub fn block(&self, tid: Tid) -> bool {
        let mut blocked = self.blocked.lock();
        // Recheck under the list lock so a concurrent release cannot strand
        // this thread on the list with a free permit.
        if self.try_acquire() {
            return false;
        }
        blocked.push_back(tid);
        true
    }

    /// Releases a permit.
    ///
    /// Returns the id of a blocked thread that should be made runnable, or
    /// `None` if nothing was waiting. The woken thread retries the acquire.
    pub fn release(&self) -> Option<Tid> {
        self.permits.fetch_add(1, Ordering::Release);
        self.blocked.lock().pop_front()
    }

    /// Drains the blocked list, e.g. when the semaphore's owner dies.
    ///
    /// Every returned thread must be made runnable by the caller.
    pub fn drain_blocked(&self) -> VecDeque<Tid> {
        core::mem::take(&mut *self.blocked.lock())
    }

    /// Returns the number of currently available permits.
    pub fn available_permits(&self) -> u32 {
        self.permits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_permits() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn release_wakes_in_fifo_order() {
        let sem = Semaphore::new(0);
        assert!(sem.block(10));
        assert!(sem.block(11));
        assert_eq!(sem.release(), Some(10));
        assert_eq!(sem.release(), Some(11));
        assert_eq!(sem.release(), None);
        assert_eq!(sem.available_permits(), 3);
    }

    #[test]
    fn block_takes_permit_if_one_appeared() {
        let sem = Semaphore::new(1);
        // A permit is free, so the would-be blocker grabs it instead.
        assert!(!sem.block(5));
        assert_eq!(sem.available_permits(), 0);
        assert!(sem.drain_blocked().is_empty());
    }
}
