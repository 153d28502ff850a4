//! Anonymous and file-backed memory mappings.
//!
//! Each process keeps its regions sorted by base with no overlap. Mapping
//! allocates and zero-fills frames first, copies file contents in through
//! the linear map, and only then applies the requested protection; any
//! failure rolls the pages mapped so far back.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pml_core::{Errno, Result};
use pml_fs::fd::with_system_fds;
use pml_fs::{vnops, Cred, OpenFlags, Vnode};
use pml_mm::paging::{AddrSpace, PageFlags};
use pml_mm::pmm::FrameAllocator;
use pml_mm::{align_up, PAGE_SIZE, USER_MEM_TOP, VirtAddr};

/// Mapping may not be accessed.
pub const PROT_NONE: u32 = 1 << 0;
/// Mapping may be read.
pub const PROT_READ: u32 = 1 << 1;
/// Mapping may be written.
pub const PROT_WRITE: u32 = 1 << 2;
/// Mapping may be executed.
pub const PROT_EXEC: u32 = 1 << 3;

/// Writes are shared with the file.
pub const MAP_SHARED: u32 = 1 << 0;
/// Writes are private to the process.
pub const MAP_PRIVATE: u32 = 1 << 1;
/// Place the mapping exactly at the requested address.
pub const MAP_FIXED: u32 = 1 << 4;
/// No backing file.
pub const MAP_ANONYMOUS: u32 = 1 << 5;

/// `msync` flag: asynchronous writeback (unsupported).
pub const MS_ASYNC: u32 = 1 << 0;
/// `msync` flag: invalidate cached pages.
pub const MS_INVALIDATE: u32 = 1 << 1;
/// `msync` flag: synchronous writeback.
pub const MS_SYNC: u32 = 1 << 2;

/// Default base for mappings without an address hint.
pub const USER_MMAP_BASE: u64 = 0x0000_7f00_0000_0000;

/// Backing file of a region; the system fd slot holds a reference.
pub struct MappedFile {
    /// System fd table slot.
    pub slot: usize,
    /// The mapped vnode.
    pub vnode: Arc<Vnode>,
    /// Process-level descriptor number used at `mmap` time.
    pub fd: i32,
}

/// One mapped region.
pub struct MmapRegion {
    /// First mapped byte (page-aligned).
    pub base: u64,
    /// Length in bytes (page-aligned).
    pub len: u64,
    /// `PROT_*` bits.
    pub prot: u32,
    /// `MAP_*` bits.
    pub flags: u32,
    /// Backing file for non-anonymous mappings.
    pub file: Option<MappedFile>,
    /// Byte offset into the file.
    pub offset: u64,
}

/// Per-process table of mapped regions, sorted by base.
#[derive(Default)]
pub struct MmapTable {
    /// The regions.
    pub regions: Vec<MmapRegion>,
}

impl MmapTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last region with `base` strictly below `addr`.
    pub fn find_region_before(&self, addr: u64) -> Option<usize> {
        let mut found = None;
        for (i, region) in self.regions.iter().enumerate() {
            if region.base >= addr {
                break;
            }
            found = Some(i);
        }
        found
    }

    /// Index of the last region with `base` at or below `addr`.
    pub fn find_region_before_equal(&self, addr: u64) -> Option<usize> {
        let mut found = None;
        for (i, region) in self.regions.iter().enumerate() {
            if region.base > addr {
                break;
            }
            found = Some(i);
        }
        found
    }

    /// Inserts `region` at its sorted position.
    pub fn insert_sorted(&mut self, region: MmapRegion) {
        let at = self
            .regions
            .iter()
            .position(|r| r.base > region.base)
            .unwrap_or(self.regions.len());
        self.regions.insert(at, region);
    }

    /// Copies the table for `fork`, adding a file reference per region.
    pub fn fork_copy(&self) -> Self {
        let regions = self
            .regions
            .iter()
            .map(|r| MmapRegion {
                base: r.base,
                len: r.len,
                prot: r.prot,
                flags: r.flags,
                file: r.file.as_ref().map(|f| {
                    with_system_fds(|sys| sys.reference(f.slot));
                    MappedFile {
                        slot: f.slot,
                        vnode: f.vnode.clone(),
                        fd: f.fd,
                    }
                }),
                offset: r.offset,
            })
            .collect();
        Self { regions }
    }

    /// Drops every region's file reference (process teardown).
    pub fn release_files(&mut self) {
        for region in self.regions.drain(..) {
            if let Some(file) = region.file {
                with_system_fds(|sys| sys.release(file.slot));
            }
        }
    }

    /// Checks the sorted/no-overlap invariant.
    pub fn check(&self) -> bool {
        self.regions.windows(2).all(|w| w[0].base + w[0].len <= w[1].base)
    }
}

/// Page flags derived from a `PROT_*` set: no `USER` for `PROT_NONE`,
/// `RW` only for `PROT_WRITE`; reads are always allowed once `USER` is on.
fn prot_page_flags(prot: u32) -> PageFlags {
    let mut flags = PageFlags::empty();
    if prot != PROT_NONE {
        flags |= PageFlags::USER;
    }
    if prot & PROT_WRITE != 0 {
        flags |= PageFlags::RW;
    }
    flags
}

fn unmap_and_free(space: &mut AddrSpace, frames: &mut FrameAllocator, va: u64) -> Result<()> {
    // The frame allocator wants physical addresses, so translate before
    // tearing the mapping down.
    let pa = space.translate(VirtAddr::new(va)).ok_or(Errno::EFAULT)?;
    space.unmap(VirtAddr::new(va))?;
    frames.free_frame(pa);
    crate::arch::invlpg(va);
    Ok(())
}

/// Writes the file-backed bytes of every region overlapping
/// `[addr, addr+len)` back through the vnode write path.
pub fn sync_mappings(
    table: &MmapTable,
    space: &AddrSpace,
    addr: u64,
    len: u64,
    cred: &Cred,
) -> Result<()> {
    let end = addr + len;
    for region in &table.regions {
        let Some(file) = region.file.as_ref() else {
            continue;
        };
        let rstart = region.base.max(addr);
        let rend = (region.base + region.len).min(end);
        if rstart >= rend {
            continue;
        }
        // Copy page by page out of the mapping and push it to the file.
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let mut va = rstart;
        while va < rend {
            let take = (PAGE_SIZE - (va % PAGE_SIZE)).min(rend - va) as usize;
            let pa = space.translate(VirtAddr::new(va)).ok_or(Errno::EFAULT)?;
            // SAFETY: The page is mapped in this address space and owned by
            // the region being synced.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    space.phys_map().ptr(pa),
                    page.as_mut_ptr(),
                    take,
                );
            }
            let file_off = region.offset + (va - region.base);
            vnops::vfs_write(&file.vnode, &page[..take], file_off, cred)?;
            va += take as u64;
        }
    }
    Ok(())
}

/// Removes every mapping inside `[addr, addr+len)`, optionally syncing
/// file-backed contents first. Partial overlaps truncate a region's head
/// or tail; fully covered regions are removed and their file reference
/// dropped.
pub fn clear_mappings(
    table: &mut MmapTable,
    space: &mut AddrSpace,
    frames: &mut FrameAllocator,
    addr: u64,
    len: u64,
    sync: bool,
    cred: &Cred,
) -> Result<()> {
    if sync {
        sync_mappings(table, space, addr, len, cred)?;
    }
    let end = addr + len;

    // A region extending past `addr` from below is tail-truncated.
    if let Some(index) = table.find_region_before(addr) {
        let region = &mut table.regions[index];
        let old_end = region.base + region.len;
        if old_end > addr {
            region.len = addr - region.base;
            let mut va = addr;
            while va < old_end.min(end) {
                unmap_and_free(space, frames, va)?;
                va += PAGE_SIZE;
            }
        }
    }

    let mut index = table.find_region_before(addr).map_or(0, |i| i + 1);
    while index < table.regions.len() {
        let (base, rlen) = {
            let region = &table.regions[index];
            (region.base, region.len)
        };
        if base >= end {
            break;
        }
        if end >= base + rlen {
            // Fully covered: unmap everything and drop the region.
            let mut va = base;
            while va < base + rlen {
                unmap_and_free(space, frames, va)?;
                va += PAGE_SIZE;
            }
            let region = table.regions.remove(index);
            if let Some(file) = region.file {
                with_system_fds(|sys| sys.release(file.slot));
            }
            continue;
        }
        // Head overlap: cut the front off.
        let cut = end - base;
        let mut va = base;
        while va < end {
            unmap_and_free(space, frames, va)?;
            va += PAGE_SIZE;
        }
        let region = &mut table.regions[index];
        region.base += cut;
        region.len -= cut;
        region.offset += cut;
        break;
    }
    Ok(())
}

/// Creates a mapping.
///
/// `file` carries `(system slot, vnode, open flags, fd)` for file-backed
/// mappings. Returns the mapped base address.
#[allow(clippy::too_many_arguments)]
pub fn mmap(
    table: &mut MmapTable,
    space: &mut AddrSpace,
    frames: &mut FrameAllocator,
    addr: u64,
    len: u64,
    prot: u32,
    flags: u32,
    file: Option<(usize, Arc<Vnode>, OpenFlags, i32)>,
    offset: u64,
    cred: &Cred,
) -> Result<u64> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    if (flags & MAP_SHARED != 0) == (flags & MAP_PRIVATE != 0) {
        return Err(Errno::EINVAL);
    }

    let file = if flags & MAP_ANONYMOUS == 0 {
        let (slot, vnode, oflags, fd) = file.ok_or(Errno::EBADF)?;
        let attr = vnode.attr();
        if !pml_fs::mode::is_reg(attr.mode) {
            return Err(Errno::EACCES);
        }
        if offset > attr.size || offset % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        if prot & PROT_READ != 0 && !oflags.readable() {
            return Err(Errno::EACCES);
        }
        if prot & PROT_WRITE != 0 && flags & MAP_SHARED != 0 && !oflags.writable() {
            return Err(Errno::EACCES);
        }
        Some((slot, vnode, fd))
    } else {
        None
    };

    let bytes = len;
    let len = align_up(len, PAGE_SIZE);
    let mut base = if addr != 0 {
        if addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        addr
    } else {
        USER_MMAP_BASE
    };

    if flags & MAP_FIXED != 0 {
        clear_mappings(table, space, frames, base, len, true, cred)?;
    } else {
        // First gap of at least `len` bytes at or above the hint.
        let mut candidate = base;
        for region in &table.regions {
            if region.base + region.len <= candidate {
                continue;
            }
            if region.base >= candidate + len {
                break;
            }
            candidate = region.base + region.len;
        }
        base = candidate;
    }
    if base + len > USER_MEM_TOP {
        return Err(Errno::EINVAL);
    }

    // Map writable first so the contents can be filled in.
    let mut mapped = 0u64;
    let map_result = (|| -> Result<()> {
        while mapped < len {
            let frame = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
            if let Err(e) = space.map(
                frames,
                frame,
                VirtAddr::new(base + mapped),
                PageFlags::RW,
            ) {
                frames.free_frame(frame);
                return Err(e);
            }
            mapped += PAGE_SIZE;
        }
        Ok(())
    })();
    if let Err(e) = map_result {
        let mut va = base;
        while va < base + mapped {
            let _ = unmap_and_free(space, frames, va);
            va += PAGE_SIZE;
        }
        return Err(e);
    }

    // Pull the file contents in synchronously.
    if let Some((_, vnode, _)) = file.as_ref() {
        let want = bytes.min(vnode.attr().size.saturating_sub(offset));
        let mut done = 0u64;
        let mut page = vec![0u8; PAGE_SIZE as usize];
        while done < want {
            let take = (PAGE_SIZE).min(want - done) as usize;
            let n = vnops::vfs_read(vnode, &mut page[..take], offset + done, cred)?;
            if n == 0 {
                break;
            }
            let pa = space
                .translate(VirtAddr::new(base + done))
                .ok_or(Errno::EFAULT)?;
            // SAFETY: The page was just mapped above and is exclusively
            // owned until the region is published.
            unsafe {
                core::ptr::copy_nonoverlapping(page.as_ptr(), space.phys_map().ptr(pa), n);
            }
            done += n as u64;
        }
    }

    // Drop to the requested protection.
    let final_flags = prot_page_flags(prot);
    let mut va = base;
    while va < base + len {
        let pa = space.translate(VirtAddr::new(va)).ok_or(Errno::EFAULT)?;
        space.map(frames, pa, VirtAddr::new(va), final_flags)?;
        crate::arch::invlpg(va);
        va += PAGE_SIZE;
    }

    if let Some((slot, _, _)) = file.as_ref() {
        with_system_fds(|sys| sys.reference(*slot));
    }
    table.insert_sorted(MmapRegion {
        base,
        len,
        prot,
        flags,
        file: file.map(|(slot, vnode, fd)| MappedFile { slot, vnode, fd }),
        offset,
    });
    Ok(base)
}

/// Removes mappings without syncing anonymous contents.
pub fn munmap(
    table: &mut MmapTable,
    space: &mut AddrSpace,
    frames: &mut FrameAllocator,
    addr: u64,
    len: u64,
    cred: &Cred,
) -> Result<()> {
    if addr % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    clear_mappings(table, space, frames, addr, len, false, cred)
}

/// Writes dirty file-backed bytes in the range back to their files.
///
/// `MS_ASYNC` alone is `ENOTSUP`; combining it with `MS_SYNC` is `EINVAL`.
pub fn msync(
    table: &MmapTable,
    space: &AddrSpace,
    addr: u64,
    len: u64,
    flags: u32,
    cred: &Cred,
) -> Result<()> {
    if addr % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    if flags & MS_ASYNC != 0 && flags & MS_SYNC != 0 {
        return Err(Errno::EINVAL);
    }
    if flags & (MS_ASYNC | MS_SYNC | MS_INVALIDATE) == 0 {
        return Err(Errno::EINVAL);
    }
    if flags & MS_ASYNC != 0 {
        return Err(Errno::ENOTSUP);
    }
    sync_mappings(table, space, addr, len, cred)
}

/// Grows the region containing `addr` to `new_len` bytes.
///
/// Used by the exec loader while building a process image; deliberately
/// skips the forward-overlap check.
pub fn expand_mmap(
    table: &mut MmapTable,
    space: &mut AddrSpace,
    frames: &mut FrameAllocator,
    addr: u64,
    new_len: u64,
) -> Result<()> {
    let index = table.find_region_before_equal(addr).ok_or(Errno::ENOMEM)?;
    let region = &table.regions[index];
    let base = region.base;
    let old_len = region.len;
    let new_len = align_up(new_len, PAGE_SIZE);
    if new_len <= old_len {
        return Err(Errno::EINVAL);
    }

    let mut va = base + old_len;
    while va < base + new_len {
        let frame = frames.alloc_frame().ok_or(Errno::ENOMEM)?;
        let mapped = space.map(
            frames,
            frame,
            VirtAddr::new(va),
            PageFlags::USER | PageFlags::RW,
        );
        if mapped.is_err() {
            frames.free_frame(frame);
            let mut undo = base + old_len;
            while undo < va {
                let _ = unmap_and_free(space, frames, undo);
                undo += PAGE_SIZE;
            }
            return Err(Errno::ENOMEM);
        }
        va += PAGE_SIZE;
    }
    table.regions[index].len = new_len;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pml_core::sync::SpinLock;
    use pml_fs::vnode::{Vnode, VnodeOps};
    use pml_fs::mode::S_IFREG;
    use std::alloc::Layout;

    struct Arena {
        base: *mut u8,
        size: usize,
    }

    impl Arena {
        fn new(pages: usize) -> Self {
            let size = pages * PAGE_SIZE as usize;
            let layout = Layout::from_size_align(size, PAGE_SIZE as usize).unwrap();
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self { base, size }
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, PAGE_SIZE as usize).unwrap();
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    fn setup(arena: &Arena) -> (FrameAllocator, AddrSpace) {
        let phys = unsafe { pml_mm::PhysMap::new(arena.base as u64) };
        let usable = [pml_mm::pmm::MemoryRegion {
            start: 0,
            end: arena.size as u64,
        }];
        let mut frames = unsafe {
            FrameAllocator::new(
                phys,
                pml_mm::PhysAddr::zero(),
                PAGE_SIZE,
                arena.size as u64,
                &usable,
            )
            .unwrap()
        };
        let space = AddrSpace::new(&mut frames, phys).unwrap();
        (frames, space)
    }

    /// Vnode backed by a byte vector, enough for mapping tests.
    struct VecFile {
        data: SpinLock<Vec<u8>>,
    }

    impl VnodeOps for VecFile {
        fn read(&self, _vp: &Vnode, buf: &mut [u8], offset: u64) -> pml_core::Result<usize> {
            let data = self.data.lock();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn write(&self, _vp: &Vnode, buf: &[u8], offset: u64) -> pml_core::Result<usize> {
            let mut data = self.data.lock();
            let offset = offset as usize;
            if offset + buf.len() > data.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn vec_file(contents: &[u8]) -> Arc<Vnode> {
        let vp = Vnode::new(
            1,
            Box::new(VecFile {
                data: SpinLock::new(contents.to_vec()),
            }),
            None,
        );
        {
            let mut attr = vp.attr.lock();
            attr.mode = S_IFREG | 0o644;
            attr.size = contents.len() as u64;
        }
        vp
    }

    fn sys_slot(vp: &Arc<Vnode>) -> usize {
        with_system_fds(|sys| {
            let slot = sys.alloc().unwrap();
            sys.fill(slot, vp.clone(), "/mapped", OpenFlags::RDWR);
            slot
        })
    }

    fn read_user(space: &AddrSpace, va: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (i, byte) in out.iter_mut().enumerate() {
            let pa = space.translate(VirtAddr::new(va + i as u64)).unwrap();
            *byte = unsafe { space.phys_map().ptr(pa).read() };
        }
        out
    }

    fn write_user(space: &AddrSpace, va: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let pa = space.translate(VirtAddr::new(va + i as u64)).unwrap();
            unsafe { space.phys_map().ptr(pa).write(byte) };
        }
    }

    #[test]
    fn anonymous_mapping_is_zeroed_and_sorted() {
        let arena = Arena::new(128);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();

        let a = mmap(
            &mut table, &mut space, &mut frames,
            0, 8192, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None, 0, &cred,
        )
        .unwrap();
        assert_eq!(a, USER_MMAP_BASE);
        assert!(read_user(&space, a, 32).iter().all(|&b| b == 0));

        let b = mmap(
            &mut table, &mut space, &mut frames,
            0, 4096, PROT_READ, MAP_PRIVATE | MAP_ANONYMOUS, None, 0, &cred,
        )
        .unwrap();
        // The second mapping lands after the first; the table stays sorted
        // and non-overlapping.
        assert_eq!(b, a + 8192);
        assert!(table.check());
        assert_eq!(table.regions.len(), 2);
    }

    #[test]
    fn shared_xor_private_enforced() {
        let arena = Arena::new(32);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        for flags in [MAP_ANONYMOUS, MAP_ANONYMOUS | MAP_SHARED | MAP_PRIVATE] {
            assert_eq!(
                mmap(
                    &mut table, &mut space, &mut frames,
                    0, 4096, PROT_READ, flags, None, 0, &cred,
                )
                .unwrap_err(),
                Errno::EINVAL
            );
        }
    }

    #[test]
    fn file_backed_read_zero_tail() {
        let arena = Arena::new(64);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let vp = vec_file(b"abc");
        let slot = sys_slot(&vp);

        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 4096, PROT_READ, MAP_PRIVATE,
            Some((slot, vp, OpenFlags::RDWR, 3)), 0, &cred,
        )
        .unwrap();
        let bytes = read_user(&space, addr, 4096);
        assert_eq!(&bytes[..3], b"abc");
        assert!(bytes[3..].iter().all(|&b| b == 0));
        // The mapping took its own reference on the slot.
        assert_eq!(with_system_fds(|sys| sys.get(slot).unwrap().count), 2);
    }

    #[test]
    fn munmap_returns_frames_and_drops_refs() {
        let arena = Arena::new(64);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let vp = vec_file(b"abc");
        let slot = sys_slot(&vp);

        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 8192, PROT_READ | PROT_WRITE, MAP_PRIVATE,
            Some((slot, vp, OpenFlags::RDWR, 3)), 0, &cred,
        )
        .unwrap();
        let free_before = frames.free_stack_len();
        munmap(&mut table, &mut space, &mut frames, addr, 8192, &cred).unwrap();
        assert!(table.regions.is_empty());
        assert_eq!(frames.free_stack_len(), free_before + 2);
        assert!(space.translate(VirtAddr::new(addr)).is_none());
        with_system_fds(|sys| sys.release(slot));
    }

    #[test]
    fn munmap_truncates_partial_overlaps() {
        let arena = Arena::new(128);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 4 * 4096, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None, 0, &cred,
        )
        .unwrap();
        // Drop the trailing two pages; the region keeps its head.
        munmap(&mut table, &mut space, &mut frames, addr + 2 * 4096, 2 * 4096, &cred).unwrap();
        assert_eq!(table.regions.len(), 1);
        assert_eq!(table.regions[0].base, addr);
        assert_eq!(table.regions[0].len, 2 * 4096);
        assert!(space.translate(VirtAddr::new(addr)).is_some());
        assert!(space.translate(VirtAddr::new(addr + 2 * 4096)).is_none());

        // Now drop the leading page; the survivor advances its base.
        munmap(&mut table, &mut space, &mut frames, addr, 4096, &cred).unwrap();
        assert_eq!(table.regions.len(), 1);
        assert_eq!(table.regions[0].base, addr + 4096);
        assert_eq!(table.regions[0].len, 4096);
        assert!(table.check());
    }

    #[test]
    fn msync_writes_back_and_rejects_async() {
        let arena = Arena::new(64);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let vp = vec_file(b"abc");
        let slot = sys_slot(&vp);

        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 4096, PROT_READ | PROT_WRITE, MAP_SHARED,
            Some((slot, vp.clone(), OpenFlags::RDWR, 3)), 0, &cred,
        )
        .unwrap();
        write_user(&space, addr, b"xyz");

        assert_eq!(
            msync(&table, &space, addr, 4096, MS_ASYNC, &cred).unwrap_err(),
            Errno::ENOTSUP
        );
        assert_eq!(
            msync(&table, &space, addr, 4096, MS_ASYNC | MS_SYNC, &cred).unwrap_err(),
            Errno::EINVAL
        );
        msync(&table, &space, addr, 4096, MS_SYNC, &cred).unwrap();

        let mut back = [0u8; 3];
        vnops::vfs_read(&vp, &mut back, 0, &cred).unwrap();
        assert_eq!(&back, b"xyz");
    }

    #[test]
    fn map_fixed_replaces_existing() {
        let arena = Arena::new(128);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 8192, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None, 0, &cred,
        )
        .unwrap();
        write_user(&space, addr, &[0x55; 16]);

        let again = mmap(
            &mut table, &mut space, &mut frames,
            addr, 8192, PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED, None, 0, &cred,
        )
        .unwrap();
        assert_eq!(again, addr);
        assert_eq!(table.regions.len(), 1);
        assert!(table.check());
        // Fresh zero pages replaced the old contents.
        assert!(read_user(&space, addr, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn expand_mmap_grows_in_place() {
        let arena = Arena::new(64);
        let (mut frames, mut space) = setup(&arena);
        let mut table = MmapTable::new();
        let cred = Cred::root();
        let addr = mmap(
            &mut table, &mut space, &mut frames,
            0, 4096, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, None, 0, &cred,
        )
        .unwrap();
        expand_mmap(&mut table, &mut space, &mut frames, addr, 3 * 4096).unwrap();
        assert_eq!(table.regions[0].len, 3 * 4096);
        assert!(space.translate(VirtAddr::new(addr + 2 * 4096)).is_some());
    }
}
