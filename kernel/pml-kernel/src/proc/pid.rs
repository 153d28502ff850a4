//! Process and thread ID allocation.
//!
//! An expanding bit array with a monotonic cursor; freeing an id pulls the
//! cursor back so the smallest free id at or above it is handed out next.

use alloc::vec::Vec;

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};

/// Process/thread identifier.
pub type Pid = i32;

/// Bytes the bitmap grows by at a time.
const PID_BITMAP_INCREMENT: usize = 1024;
/// Hard cap on the bitmap (ids up to 8 * this).
const PID_BITMAP_SIZE_LIMIT: usize = 32768 / 8;

struct PidBitmap {
    bits: Vec<u8>,
    next: usize,
}

static PID_BITMAP: SpinLock<Option<PidBitmap>> = SpinLock::new(None);

fn test(bits: &[u8], id: usize) -> bool {
    bits[id / 8] & (1 << (id % 8)) != 0
}

fn set(bits: &mut [u8], id: usize) {
    bits[id / 8] |= 1 << (id % 8);
}

fn clear(bits: &mut [u8], id: usize) {
    bits[id / 8] &= !(1 << (id % 8));
}

/// Initializes the allocator, reserving id 0.
pub fn init_pid_allocator() {
    let mut bitmap = PID_BITMAP.lock();
    if bitmap.is_some() {
        return;
    }
    let mut bits = Vec::new();
    bits.resize(PID_BITMAP_INCREMENT, 0);
    set(&mut bits, 0);
    *bitmap = Some(PidBitmap { bits, next: 1 });
}

/// Resets the allocator (test teardown).
#[cfg(test)]
pub fn reset_pid_allocator() {
    *PID_BITMAP.lock() = None;
}

/// Allocates an unused id.
///
/// Ids are unique until freed; the space tops out at 32768.
pub fn alloc_pid() -> Result<Pid> {
    let mut guard = PID_BITMAP.lock();
    let bitmap = guard.as_mut().ok_or(Errno::ENOMEM)?;
    loop {
        while bitmap.next < bitmap.bits.len() * 8 {
            if !test(&bitmap.bits, bitmap.next) {
                let pid = bitmap.next;
                set(&mut bitmap.bits, pid);
                bitmap.next = pid + 1;
                return Ok(pid as Pid);
            }
            bitmap.next += 1;
        }
        if bitmap.bits.len() >= PID_BITMAP_SIZE_LIMIT {
            return Err(Errno::ENOMEM);
        }
        let new_len = bitmap.bits.len() + PID_BITMAP_INCREMENT;
        bitmap.bits.resize(new_len, 0);
    }
}

/// Returns an id to the pool.
pub fn free_pid(pid: Pid) {
    if pid < 0 {
        return;
    }
    let mut guard = PID_BITMAP.lock();
    let Some(bitmap) = guard.as_mut() else {
        return;
    };
    let id = pid as usize;
    if id < bitmap.bits.len() * 8 {
        clear(&mut bitmap.bits, id);
        if id < bitmap.next {
            bitmap.next = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The allocator is global state; tests that reset it take turns.
    static GATE: Mutex<()> = Mutex::new(());

    #[test]
    fn monotonic_then_reuses_freed() {
        let _gate = GATE.lock().unwrap();
        reset_pid_allocator();
        init_pid_allocator();
        let a = alloc_pid().unwrap();
        let b = alloc_pid().unwrap();
        let c = alloc_pid().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        // Freed then allocated returns the smallest free id at or above it.
        free_pid(b);
        assert_eq!(alloc_pid().unwrap(), b);
        assert_eq!(alloc_pid().unwrap(), 4);
    }

    #[test]
    fn zero_is_reserved() {
        let _gate = GATE.lock().unwrap();
        reset_pid_allocator();
        init_pid_allocator();
        for _ in 0..16 {
            assert_ne!(alloc_pid().unwrap(), 0);
        }
    }

    #[test]
    fn exhaustion_is_enomem() {
        let _gate = GATE.lock().unwrap();
        reset_pid_allocator();
        init_pid_allocator();
        let mut last = 0;
        while let Ok(pid) = alloc_pid() {
            last = pid;
        }
        assert_eq!(last, 32767);
        assert_eq!(alloc_pid().unwrap_err(), Errno::ENOMEM);
        reset_pid_allocator();
    }
}
