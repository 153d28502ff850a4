//! Test-and-set spinlocks.
//!
//! The kernel's elementary lock is one word that is atomically swapped to 1
//! to acquire and stored back to 0 to release; waiters spin on plain loads
//! in between so the line stays shared while the lock is held. On the
//! single boot CPU these locks only ever exclude interrupt-window reentry,
//! but the word is a real atomic so the named locks (the PID bitmap, the
//! entropy pool, the heap) survive an SMP port unchanged.
//!
//! [`RawSpinLock`] is the bare word for flag-style uses; [`SpinLock`]
//! couples one with the data it guards and hands out an RAII guard.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A bare one-word spinlock with no associated data.
pub struct RawSpinLock {
    word: AtomicU32,
}

impl RawSpinLock {
    /// A released lock.
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Spins until the lock word is taken.
    pub fn acquire(&self) {
        while self.word.swap(1, Ordering::Acquire) != 0 {
            // Wait on plain loads; the swap above is what takes the lock.
            while self.word.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self) -> bool {
        self.word.swap(1, Ordering::Acquire) == 0
    }

    /// Releases the lock word.
    ///
    /// The caller must hold the lock; releasing a free lock is a logic bug
    /// upstream that this cannot detect.
    pub fn release(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Whether somebody holds the lock at this instant.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Data guarded by a [`RawSpinLock`].
///
/// Const-constructable so the kernel's global tables can live in `static`
/// items; access goes through [`lock`](Self::lock), which returns a guard
/// that releases on drop.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: The raw lock serializes every access to the cell, so sharing the
// wrapper between threads only requires the payload itself to be sendable.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `value` behind a released lock.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock and returns the access guard.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    /// Returns a guard only if the lock is free right now.
    ///
    /// Panic and fault paths use this so a report never spins on a lock the
    /// failing context itself may hold.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Direct access through an exclusive reference, no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` proves no guard is outstanding.
        unsafe { &mut *self.data.get() }
    }

    /// Consumes the lock and returns the payload.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Holds a [`SpinLock`] until dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Constructing the guard acquired the raw lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Constructing the guard acquired the raw lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}
