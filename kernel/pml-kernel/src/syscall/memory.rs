//! Memory syscalls: mmap, munmap, msync.

use alloc::sync::Arc;

use pml_core::{Errno, Result};
use pml_fs::fd::with_system_fds;
use pml_fs::{OpenFlags, Vnode};
use pml_mm::paging::AddrSpace;
use pml_mm::PhysAddr;

use crate::mman::{self, MAP_ANONYMOUS};
use crate::proc::{with_queue, SwitchGuard};

fn file_for(fd: i32) -> Result<(usize, Arc<Vnode>, OpenFlags, i32)> {
    let entry = crate::proc::try_with_current(|p| p.fds.get(fd))??;
    with_system_fds(|sys| {
        let file = sys.get(entry.slot)?;
        Ok((
            entry.slot,
            file.vnode.clone().ok_or(Errno::EBADF)?,
            file.flags,
            fd,
        ))
    })
}

/// `mmap(2)` over the calling thread's address space.
pub fn sys_mmap(
    addr: u64,
    len: u64,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u64,
) -> Result<u64> {
    let file = if flags & MAP_ANONYMOUS == 0 {
        Some(file_for(fd)?)
    } else {
        None
    };
    let _guard = SwitchGuard::lock();
    with_queue(|q| {
        if q.queue.is_empty() {
            return Err(Errno::ESRCH);
        }
        let front = q.front;
        let process = &mut q.queue[front];
        let cred = process.cred();
        let pml4 = process.current_thread().args.pml4;
        let mmaps = &mut process.mmaps;
        crate::mm::with_mm(|frames, phys| {
            // SAFETY: The thread's PML4 came from the VMM and is reachable
            // through the installed linear map.
            let mut space = unsafe { AddrSpace::from_root(PhysAddr::new(pml4), phys) };
            mman::mmap(
                mmaps, &mut space, frames, addr, len, prot, flags, file, offset, &cred,
            )
        })
    })
}

/// `munmap(2)`.
pub fn sys_munmap(addr: u64, len: u64) -> Result<()> {
    let _guard = SwitchGuard::lock();
    with_queue(|q| {
        if q.queue.is_empty() {
            return Err(Errno::ESRCH);
        }
        let front = q.front;
        let process = &mut q.queue[front];
        let cred = process.cred();
        let pml4 = process.current_thread().args.pml4;
        let mmaps = &mut process.mmaps;
        crate::mm::with_mm(|frames, phys| {
            // SAFETY: As in sys_mmap.
            let mut space = unsafe { AddrSpace::from_root(PhysAddr::new(pml4), phys) };
            mman::munmap(mmaps, &mut space, frames, addr, len, &cred)
        })
    })
}

/// `msync(2)`.
pub fn sys_msync(addr: u64, len: u64, flags: u32) -> Result<()> {
    with_queue(|q| {
        if q.queue.is_empty() {
            return Err(Errno::ESRCH);
        }
        let front = q.front;
        let process = &mut q.queue[front];
        let cred = process.cred();
        let pml4 = process.current_thread().args.pml4;
        let mmaps = &process.mmaps;
        crate::mm::with_mm(|frames, phys| {
            let _ = frames;
            // SAFETY: As in sys_mmap.
            let space = unsafe { AddrSpace::from_root(PhysAddr::new(pml4), phys) };
            mman::msync(mmaps, &space, addr, len, flags, &cred)
        })
    })
}
