//! Global memory-management state.
//!
//! Boot hands the frame allocator and the linear-map handle over once the
//! memory map is known; everything else reaches them through the lock.

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};
use pml_mm::pmm::FrameAllocator;
use pml_mm::{PhysAddr, PhysMap};

struct MmState {
    frames: FrameAllocator,
    phys: PhysMap,
}

static MM: SpinLock<Option<MmState>> = SpinLock::new(None);

/// Installs the physical allocator and linear map.
///
/// Called once from boot; tests install an arena-backed pair instead.
pub fn install(frames: FrameAllocator, phys: PhysMap) {
    *MM.lock() = Some(MmState { frames, phys });
}

/// Drops the installed state (test teardown).
pub fn uninstall() {
    *MM.lock() = None;
}

/// Whether the memory manager has been installed.
pub fn is_installed() -> bool {
    MM.lock().is_some()
}

/// Runs a closure with the frame allocator and linear map.
pub fn with_mm<R>(f: impl FnOnce(&mut FrameAllocator, PhysMap) -> Result<R>) -> Result<R> {
    let mut mm = MM.lock();
    let state = mm.as_mut().ok_or(Errno::ENOMEM)?;
    let phys = state.phys;
    f(&mut state.frames, phys)
}

/// Allocates one zeroed frame.
pub fn alloc_page() -> Result<PhysAddr> {
    with_mm(|frames, _| frames.alloc_frame().ok_or(Errno::ENOMEM))
}

/// Returns a frame to the free stack.
pub fn free_page(pa: PhysAddr) {
    let _ = with_mm(|frames, _| {
        frames.free_frame(pa);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pml_mm::pmm::MemoryRegion;
    use pml_mm::PAGE_SIZE;
    use std::alloc::Layout;

    #[test]
    fn page_alloc_through_installed_state() {
        // The memory-manager global is shared with the syscall tests;
        // take the scheduler gate to serialize against them.
        let _gate = crate::proc::testhooks::fresh_system();
        let size = 16 * PAGE_SIZE as usize;
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());

        let phys = unsafe { PhysMap::new(base as u64) };
        let usable = [MemoryRegion { start: 0, end: size as u64 }];
        let frames = unsafe {
            pml_mm::pmm::FrameAllocator::new(
                phys,
                PhysAddr::zero(),
                PAGE_SIZE,
                size as u64,
                &usable,
            )
            .unwrap()
        };
        install(frames, phys);
        assert!(is_installed());

        let a = alloc_page().unwrap();
        let b = alloc_page().unwrap();
        assert_ne!(a, b);
        free_page(a);
        assert_eq!(alloc_page().unwrap(), a);

        uninstall();
        assert!(alloc_page().is_err());
        unsafe { std::alloc::dealloc(base, layout) };
    }
}
