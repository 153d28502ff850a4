//! Thin architecture glue for x86-64.
//!
//! Everything here is a register poke or a context-switch primitive; the
//! interesting machinery lives above. The scheduler only calls these once
//! the boot glue has flipped [`enable_switching`].

use core::sync::atomic::{AtomicBool, Ordering};

/// Whether real context switching is wired up (set once by boot).
static SWITCHING: AtomicBool = AtomicBool::new(false);

/// Arms hardware context switching; before this the scheduler only moves
/// its cursors.
pub fn enable_switching() {
    SWITCHING.store(true, Ordering::Release);
}

/// Whether the scheduler should perform real switches.
pub fn switching_enabled() -> bool {
    SWITCHING.load(Ordering::Acquire)
}

/// Loads a new top-level page table.
///
/// # Safety
///
/// `pml4_phys` must be the physical address of a valid PML4 that maps the
/// currently executing code.
#[inline]
pub unsafe fn set_cr3(pml4_phys: u64) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: Per the function contract.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) pml4_phys, options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = pml4_phys;
}

/// Invalidates the TLB entry covering `va`.
#[inline]
pub fn invlpg(va: u64) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: invlpg has no side effects beyond the TLB.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack));
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = va;
}

/// Flushes the whole TLB by reloading CR3.
#[inline]
pub fn flush_tlb() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: Re-writing CR3 with its own value only drops TLB entries.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack)
        );
    }
}

/// Stops the CPU until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: hlt merely idles the CPU.
    unsafe {
        core::arch::asm!("hlt", options(nostack, nomem));
    }
}

/// Saved callee state of a suspended thread: its kernel stack pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// Kernel stack pointer at suspension.
    pub rsp: u64,
}

/// Switches stacks and address spaces to the next thread.
///
/// Pushes the callee-saved registers, stores the stack pointer through
/// `old_rsp`, loads `new_cr3` and `new_rsp`, and pops the next thread's
/// registers. A brand-new thread's stack must have been seeded so that the
/// final `ret` lands on its entry trampoline with its argument in place.
///
/// # Safety
///
/// Both stacks and the new page table must be valid; the caller must hold
/// no locks the next thread could take.
#[cfg(target_arch = "x86_64")]
pub unsafe fn context_switch(old_rsp: *mut u64, new_rsp: u64, new_cr3: u64) {
    // SAFETY: Per the function contract; the asm preserves the sysv ABI's
    // callee-saved set around the stack swap.
    unsafe {
        core::arch::asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [{old}], rsp",
            "mov cr3, {cr3}",
            "mov rsp, {new}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            old = in(reg) old_rsp,
            new = in(reg) new_rsp,
            cr3 = in(reg) new_cr3,
        );
    }
}

/// Stub for non-x86 hosts so the crate stays buildable everywhere.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn context_switch(_old_rsp: *mut u64, _new_rsp: u64, _new_cr3: u64) {}
