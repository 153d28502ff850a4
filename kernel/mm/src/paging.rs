//! Four-level page-table manager.
//!
//! An [`AddrSpace`] is identified by the physical address of its PML4 and
//! does all table walks through the linear physical mapping. The layout it
//! manages:
//!
//! ```text
//! 0x0000000000000000-0x00007fffffffffff  user space
//! ...                                    kernel text/data, heap
//! 0xfffffdff00000000 + 4G                per-thread-local region (stack on top)
//! 0xfffffe0000000000 + 2T                linear map of physical memory
//! ```

use bitflags::bitflags;
use pml_core::{Errno, Result};

use crate::pmm::FrameAllocator;
use crate::{
    HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE, PHYS_ADDR_LIMIT, PHYS_MAP_BASE, PhysAddr, PhysMap,
    THREAD_LOCAL_BASE, VirtAddr,
};

bitflags! {
    /// x86-64 page-table entry flags.
    ///
    /// `COW` borrows a software-available bit to mark copy-on-write stack
    /// pages cloned at fork.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is present.
        const PRESENT = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// Accessible from ring 3.
        const USER = 1 << 2;
        /// Write-through caching.
        const WTHRU = 1 << 3;
        /// Caching disabled.
        const NOCACHE = 1 << 4;
        /// Accessed by the CPU.
        const ACCESSED = 1 << 5;
        /// Written by the CPU.
        const DIRTY = 1 << 6;
        /// Terminal large/huge mapping at a non-PT level.
        const SIZE = 1 << 7;
        /// Not flushed on CR3 switch.
        const GLOBAL = 1 << 8;
        /// Software: copy-on-write page (cloned stack).
        const COW = 1 << 9;
    }
}

/// Mask of the physical-address bits of a page-table entry.
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Number of entries in one page-table structure.
const ENTRIES: usize = 512;

/// Index of the stack PDT within the thread-local PDPT.
pub const STACK_PDT_SLOT: usize = ENTRIES - 1;

/// Size of the per-thread-local region (4 GiB).
pub const THREAD_LOCAL_SIZE: u64 = 0x1_0000_0000;

/// Top of the thread-local region; the kernel stack grows down from here.
pub const THREAD_STACK_TOP: u64 = THREAD_LOCAL_BASE + THREAD_LOCAL_SIZE;

fn entry_addr(entry: u64) -> PhysAddr {
    PhysAddr::new(entry & ENTRY_ADDR_MASK)
}

/// A four-level address space rooted at a PML4.
pub struct AddrSpace {
    pml4: PhysAddr,
    phys: PhysMap,
}

impl AddrSpace {
    /// Wraps an existing PML4.
    ///
    /// # Safety
    ///
    /// `pml4` must point at a valid, exclusively owned page-table root
    /// reachable through `phys`.
    pub unsafe fn from_root(pml4: PhysAddr, phys: PhysMap) -> Self {
        Self { pml4, phys }
    }

    /// Allocates an empty address space.
    pub fn new(frames: &mut FrameAllocator, phys: PhysMap) -> Result<Self> {
        let pml4 = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        Ok(Self { pml4, phys })
    }

    /// Physical address of the PML4 (the CR3 value sans flags).
    pub fn root(&self) -> PhysAddr {
        self.pml4
    }

    /// The linear-map handle this space walks through.
    pub fn phys_map(&self) -> PhysMap {
        self.phys
    }

    fn entry(&self, table: PhysAddr, index: usize) -> u64 {
        // SAFETY: Page tables in this space are owned by it and reachable
        // through the linear map.
        unsafe { self.phys.table(table).add(index).read() }
    }

    fn set_entry(&mut self, table: PhysAddr, index: usize, value: u64) {
        // SAFETY: As in `entry`; the mutable receiver serializes writers.
        unsafe { self.phys.table(table).add(index).write(value) };
    }

    /// Translates a virtual address, honouring large and huge mappings.
    ///
    /// Returns `None` for non-canonical or unmapped addresses.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        if !va.is_canonical() {
            return None;
        }
        let pml4e = self.entry(self.pml4, va.pml4_index());
        if pml4e & PageFlags::PRESENT.bits() == 0 {
            return None;
        }

        let pdpte = self.entry(entry_addr(pml4e), va.pdpt_index());
        if pdpte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pdpte & PageFlags::SIZE.bits() != 0 {
            let base = entry_addr(pdpte).as_u64() & !(HUGE_PAGE_SIZE - 1);
            return Some(PhysAddr::new(base | (va.as_u64() & (HUGE_PAGE_SIZE - 1))));
        }

        let pdte = self.entry(entry_addr(pdpte), va.pdt_index());
        if pdte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        if pdte & PageFlags::SIZE.bits() != 0 {
            let base = entry_addr(pdte).as_u64() & !(LARGE_PAGE_SIZE - 1);
            return Some(PhysAddr::new(base | (va.as_u64() & (LARGE_PAGE_SIZE - 1))));
        }

        let pte = self.entry(entry_addr(pdte), va.pt_index());
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new(
            entry_addr(pte).as_u64() | (va.as_u64() & (PAGE_SIZE - 1)),
        ))
    }

    /// Returns the child table behind `table[index]`, allocating it if absent.
    ///
    /// Intermediate levels are created user-accessible and writable so leaf
    /// protection alone decides what ring 3 may touch.
    fn child_table(
        &mut self,
        frames: &mut FrameAllocator,
        table: PhysAddr,
        index: usize,
    ) -> Result<PhysAddr> {
        let entry = self.entry(table, index);
        if entry & PageFlags::PRESENT.bits() != 0 {
            return Ok(entry_addr(entry));
        }
        let child = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        let flags = PageFlags::PRESENT | PageFlags::RW | PageFlags::USER;
        self.set_entry(table, index, child.as_u64() | flags.bits());
        Ok(child)
    }

    /// Maps a 4 KiB page at `va` to the frame at `pa`.
    ///
    /// `extra` is ORed into `PRESENT`; pass `RW`/`USER` etc. as required.
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        pa: PhysAddr,
        va: VirtAddr,
        extra: PageFlags,
    ) -> Result<()> {
        if !va.is_canonical() || !pa.is_aligned(PAGE_SIZE) {
            return Err(Errno::EINVAL);
        }
        let pdpt = self.child_table(frames, self.pml4, va.pml4_index())?;
        let pdt = self.child_table(frames, pdpt, va.pdpt_index())?;
        let pt = self.child_table(frames, pdt, va.pdt_index())?;
        let flags = PageFlags::PRESENT | extra;
        self.set_entry(pt, va.pt_index(), pa.as_u64() | flags.bits());
        Ok(())
    }

    /// Maps a 1 GiB huge page at `va`.
    pub fn map_huge(
        &mut self,
        frames: &mut FrameAllocator,
        pa: PhysAddr,
        va: VirtAddr,
        extra: PageFlags,
    ) -> Result<()> {
        if !va.is_canonical() || !pa.is_aligned(HUGE_PAGE_SIZE) {
            return Err(Errno::EINVAL);
        }
        let pdpt = self.child_table(frames, self.pml4, va.pml4_index())?;
        let flags = PageFlags::PRESENT | PageFlags::SIZE | extra;
        self.set_entry(pdpt, va.pdpt_index(), pa.as_u64() | flags.bits());
        Ok(())
    }

    /// Unmaps the 4 KiB page at `va`.
    ///
    /// Fails with `EFAULT` if no mapping exists. Intermediate tables are not
    /// reclaimed here; teardown handles them.
    pub fn unmap(&mut self, va: VirtAddr) -> Result<()> {
        if !va.is_canonical() {
            return Err(Errno::EINVAL);
        }
        let pml4e = self.entry(self.pml4, va.pml4_index());
        if pml4e & PageFlags::PRESENT.bits() == 0 {
            return Err(Errno::EFAULT);
        }
        let pdpte = self.entry(entry_addr(pml4e), va.pdpt_index());
        if pdpte & PageFlags::PRESENT.bits() == 0 || pdpte & PageFlags::SIZE.bits() != 0 {
            return Err(Errno::EFAULT);
        }
        let pdte = self.entry(entry_addr(pdpte), va.pdt_index());
        if pdte & PageFlags::PRESENT.bits() == 0 || pdte & PageFlags::SIZE.bits() != 0 {
            return Err(Errno::EFAULT);
        }
        let pt = entry_addr(pdte);
        if self.entry(pt, va.pt_index()) & PageFlags::PRESENT.bits() == 0 {
            return Err(Errno::EFAULT);
        }
        self.set_entry(pt, va.pt_index(), 0);
        Ok(())
    }

    /// Clones this space for `fork`.
    ///
    /// User and kernel halves share their lower-level tables through copied
    /// root entries; the thread-local PDPT is duplicated and its stack PDT
    /// is replaced by a copy-on-write clone (entries lose `RW`, gain `COW`).
    pub fn clone_space(&self, frames: &mut FrameAllocator) -> Result<AddrSpace> {
        let mut new = AddrSpace::new(frames, self.phys)?;
        for i in 0..ENTRIES {
            let entry = self.entry(self.pml4, i);
            new.set_entry(new.pml4, i, entry);
        }

        let tl_index = VirtAddr::new(THREAD_LOCAL_BASE).pml4_index();
        let src_pdpte = self.entry(self.pml4, tl_index);
        if src_pdpte & PageFlags::PRESENT.bits() == 0 {
            return Ok(new);
        }
        let src_pdpt = entry_addr(src_pdpte);
        let new_pdpt = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        for i in 0..ENTRIES {
            let entry = self.entry(src_pdpt, i);
            new.set_entry(new_pdpt, i, entry);
        }
        new.set_entry(
            new.pml4,
            tl_index,
            new_pdpt.as_u64() | (src_pdpte & !ENTRY_ADDR_MASK),
        );

        let src_stack_pdte = self.entry(src_pdpt, STACK_PDT_SLOT);
        if src_stack_pdte & PageFlags::PRESENT.bits() != 0 {
            let cow_pdt = self.cow_clone_stack_pdt(frames, entry_addr(src_stack_pdte))?;
            new.set_entry(
                new_pdpt,
                STACK_PDT_SLOT,
                cow_pdt.as_u64() | (src_stack_pdte & !ENTRY_ADDR_MASK),
            );
        }
        Ok(new)
    }

    /// Copies the stack PDT with every present entry marked copy-on-write.
    ///
    /// A later write fault on such a page must duplicate it and remap
    /// writable; the fault half lives with the exception handlers.
    fn cow_clone_stack_pdt(
        &self,
        frames: &mut FrameAllocator,
        src_pdt: PhysAddr,
    ) -> Result<PhysAddr> {
        let new_pdt = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        for i in 0..ENTRIES {
            let mut entry = self.entry(src_pdt, i);
            if entry & PageFlags::PRESENT.bits() != 0 {
                entry &= !PageFlags::RW.bits();
                entry |= PageFlags::COW.bits();
            }
            // SAFETY: new_pdt is a fresh zeroed frame owned here.
            unsafe { self.phys.table(new_pdt).add(i).write(entry) };
        }
        Ok(new_pdt)
    }

    /// Recursively frees a page-table tree.
    ///
    /// `level` is 4 for a PML4 down to 1 for a page table. Every present,
    /// non-`SIZE` child is freed depth-first, then the table itself.
    ///
    /// # Safety
    ///
    /// Nothing may reference `table` or its children afterwards; frames
    /// shared with other spaces must have been unlinked first.
    pub unsafe fn free_table(
        &mut self,
        frames: &mut FrameAllocator,
        level: u8,
        table: PhysAddr,
    ) {
        if level > 1 {
            for i in 0..ENTRIES {
                let entry = self.entry(table, i);
                if entry & PageFlags::PRESENT.bits() != 0
                    && entry & PageFlags::SIZE.bits() == 0
                {
                    // SAFETY: Forwarded from the caller's contract.
                    unsafe { self.free_table(frames, level - 1, entry_addr(entry)) };
                }
            }
        }
        frames.free_frame(table);
    }
}

/// Builds the kernel address space.
///
/// Identity-maps up to 2 TiB of physical memory as 1 GiB global huge pages
/// at [`PHYS_MAP_BASE`] and reserves an empty thread-local PDPT. The caller
/// maps the boot stack and loads CR3.
pub fn init_kernel_space(
    frames: &mut FrameAllocator,
    phys: PhysMap,
    total_mem: u64,
) -> Result<AddrSpace> {
    let mut space = AddrSpace::new(frames, phys)?;
    let limit = total_mem.min(PHYS_ADDR_LIMIT);
    let mut pa = 0u64;
    while pa < limit {
        space.map_huge(
            frames,
            PhysAddr::new(pa),
            VirtAddr::new(PHYS_MAP_BASE + pa),
            PageFlags::RW | PageFlags::GLOBAL,
        )?;
        pa += HUGE_PAGE_SIZE;
    }
    let tl_index = VirtAddr::new(THREAD_LOCAL_BASE).pml4_index();
    space.child_table(frames, space.pml4, tl_index)?;
    Ok(space)
}

/// Maps a kernel stack of `size` bytes ending at [`THREAD_STACK_TOP`].
///
/// Returns the stack top virtual address.
pub fn map_kernel_stack(
    space: &mut AddrSpace,
    frames: &mut FrameAllocator,
    size: u64,
) -> Result<VirtAddr> {
    let base = THREAD_STACK_TOP - size;
    let mut va = base;
    while va < THREAD_STACK_TOP {
        let frame = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        space.map(frames, frame, VirtAddr::new(va), PageFlags::RW | PageFlags::GLOBAL)?;
        va += PAGE_SIZE;
    }
    Ok(VirtAddr::new(THREAD_STACK_TOP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::tests::{Arena, arena_allocator};

    fn setup() -> (Arena, FrameAllocator) {
        let arena = Arena::new(256);
        let pmm = arena_allocator(&arena);
        (arena, pmm)
    }

    #[test]
    fn map_translate_unmap() {
        let (arena, mut pmm) = setup();
        let mut space = AddrSpace::new(&mut pmm, arena.phys_map()).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        let va = VirtAddr::new(0x4000_2000);
        space
            .map(&mut pmm, frame, va, PageFlags::RW | PageFlags::USER)
            .unwrap();
        assert_eq!(space.translate(va).unwrap(), frame);
        assert_eq!(
            space.translate(VirtAddr::new(0x4000_2123)).unwrap().as_u64(),
            frame.as_u64() + 0x123
        );
        space.unmap(va).unwrap();
        assert!(space.translate(va).is_none());
        assert_eq!(space.unmap(va), Err(pml_core::Errno::EFAULT));
    }

    #[test]
    fn rejects_noncanonical() {
        let (arena, mut pmm) = setup();
        let space = AddrSpace::new(&mut pmm, arena.phys_map()).unwrap();
        assert!(space.translate(VirtAddr::new(0x0001_0000_0000_0000)).is_none());
    }

    #[test]
    fn huge_page_terminates_walk() {
        let (arena, mut pmm) = setup();
        let mut space = AddrSpace::new(&mut pmm, arena.phys_map()).unwrap();
        space
            .map_huge(
                &mut pmm,
                PhysAddr::new(HUGE_PAGE_SIZE),
                VirtAddr::new(PHYS_MAP_BASE),
                PageFlags::RW | PageFlags::GLOBAL,
            )
            .unwrap();
        let pa = space
            .translate(VirtAddr::new(PHYS_MAP_BASE + 0x1234_5678))
            .unwrap();
        assert_eq!(pa.as_u64(), HUGE_PAGE_SIZE + 0x1234_5678);
    }

    #[test]
    fn clone_space_marks_stack_cow() {
        let (arena, mut pmm) = setup();
        let mut space = AddrSpace::new(&mut pmm, arena.phys_map()).unwrap();
        // Build a stack mapping inside the thread-local region.
        let stack_va = VirtAddr::new(THREAD_STACK_TOP - PAGE_SIZE);
        let stack_frame = pmm.alloc_frame().unwrap();
        space
            .map(&mut pmm, stack_frame, stack_va, PageFlags::RW)
            .unwrap();

        let clone = space.clone_space(&mut pmm).unwrap();
        assert_ne!(clone.root(), space.root());
        // The clone still translates the stack page to the shared frame.
        assert_eq!(clone.translate(stack_va).unwrap(), stack_frame);

        // The clone's stack PDT entry carries COW and no RW.
        let tl = VirtAddr::new(THREAD_LOCAL_BASE).pml4_index();
        let pdpt = entry_addr(clone.entry(clone.pml4, tl));
        let pdte = clone.entry(pdpt, STACK_PDT_SLOT);
        let stack_pdt = entry_addr(pdte);
        let cow_entry = clone.entry(stack_pdt, stack_va.pdt_index());
        assert_ne!(cow_entry & PageFlags::COW.bits(), 0);
        assert_eq!(cow_entry & PageFlags::RW.bits(), 0);

        // The parent's entry is untouched.
        let src_pdpt = entry_addr(space.entry(space.pml4, tl));
        let src_pdt = entry_addr(space.entry(src_pdpt, STACK_PDT_SLOT));
        let src_entry = space.entry(src_pdt, stack_va.pdt_index());
        assert_ne!(src_entry & PageFlags::RW.bits(), 0);
    }

    #[test]
    fn free_table_returns_frames() {
        let (arena, mut pmm) = setup();
        let mut space = AddrSpace::new(&mut pmm, arena.phys_map()).unwrap();
        let frame = pmm.alloc_frame().unwrap();
        space
            .map(&mut pmm, frame, VirtAddr::new(0x1000), PageFlags::RW)
            .unwrap();
        let before = pmm.free_stack_len();
        let root = space.root();
        // PML4 + PDPT + PDT + PT = four frames come back (leaf data frames
        // are the caller's problem).
        unsafe { space.free_table(&mut pmm, 4, root) };
        assert_eq!(pmm.free_stack_len(), before + 4);
    }

    #[test]
    fn kernel_space_linear_map() {
        let (arena, mut pmm) = setup();
        let space = init_kernel_space(&mut pmm, arena.phys_map(), 2 * HUGE_PAGE_SIZE).unwrap();
        let pa = space
            .translate(VirtAddr::new(PHYS_MAP_BASE + HUGE_PAGE_SIZE + 42))
            .unwrap();
        assert_eq!(pa.as_u64(), HUGE_PAGE_SIZE + 42);
    }
}
