//! Block and inode allocation bitmaps.
//!
//! Two representations share one interface: the classic flat 32-bit bitmap
//! and a 64-bit variant with pluggable backends. Only the bit-array backend
//! exists; asking for any other backend is `EUCLEAN`. Bitmaps load from
//! disk one group at a time, with checksum validation and `BLOCK_UNINIT` /
//! `INODE_UNINIT` handling.

use alloc::vec;
use alloc::vec::Vec;

use pml_core::{Errno, Result};

use crate::{BgFlags, Ext2Fs, FsFlags};

/// Sets bit `bit` in an LSB-first byte array.
pub fn set_bit(bits: &mut [u8], bit: u64) {
    bits[(bit / 8) as usize] |= 1 << (bit % 8);
}

/// Clears bit `bit` in an LSB-first byte array.
pub fn clear_bit(bits: &mut [u8], bit: u64) {
    bits[(bit / 8) as usize] &= !(1 << (bit % 8));
}

/// Tests bit `bit` in an LSB-first byte array.
pub fn test_bit(bits: &[u8], bit: u64) -> bool {
    bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

/// What a bitmap tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapKind {
    /// Block usage.
    Block,
    /// Inode usage.
    Inode,
}

/// Backend selector for 64-bit bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapType {
    /// Flat bit array.
    Bitarray,
    /// Red-black tree of extents (unimplemented).
    RbTree,
    /// Automatic choice for directories (unimplemented).
    Autodir,
}

/// Flat 32-bit bitmap.
#[derive(Debug)]
pub struct Bitmap32 {
    kind: BitmapKind,
    start: u32,
    end: u32,
    real_end: u32,
    bits: Vec<u8>,
}

/// 64-bit bitmap backend storage.
#[derive(Debug)]
enum Backend {
    Bitarray(Vec<u8>),
}

/// 64-bit bitmap with a tagged backend.
#[derive(Debug)]
pub struct Bitmap64 {
    kind: BitmapKind,
    cluster_bits: u32,
    start: u64,
    end: u64,
    real_end: u64,
    backend: Backend,
}

/// An allocation bitmap in either representation.
#[derive(Debug)]
pub enum Bitmap {
    /// Flat 32-bit form.
    Flat32(Bitmap32),
    /// 64-bit form with a backend.
    Wide64(Bitmap64),
}

fn range_bytes(start: u64, real_end: u64) -> usize {
    (((real_end - start) / 8) + 1) as usize
}

impl Bitmap {
    /// Creates a flat 32-bit bitmap covering `[start, end]` with padding up
    /// to `real_end`.
    pub fn new32(kind: BitmapKind, start: u32, end: u32, real_end: u32) -> Self {
        let size = (range_bytes(start as u64, real_end as u64) + 7) & !3;
        Self::Flat32(Bitmap32 {
            kind,
            start,
            end,
            real_end,
            bits: vec![0u8; size],
        })
    }

    /// Creates a 64-bit bitmap with the requested backend.
    ///
    /// Only [`BitmapType::Bitarray`] is implemented; anything else is
    /// reported as `EUCLEAN` just like an unrecognized on-disk magic.
    pub fn new64(
        kind: BitmapKind,
        backend: BitmapType,
        cluster_bits: u32,
        start: u64,
        end: u64,
        real_end: u64,
    ) -> Result<Self> {
        let backend = match backend {
            BitmapType::Bitarray => Backend::Bitarray(vec![0u8; range_bytes(start, real_end)]),
            _ => return Err(Errno::EUCLEAN),
        };
        Ok(Self::Wide64(Bitmap64 {
            kind,
            cluster_bits,
            start,
            end,
            real_end,
            backend,
        }))
    }

    /// What this bitmap tracks.
    pub fn kind(&self) -> BitmapKind {
        match self {
            Self::Flat32(b) => b.kind,
            Self::Wide64(b) => b.kind,
        }
    }

    /// First tracked unit.
    pub fn start(&self) -> u64 {
        match self {
            Self::Flat32(b) => b.start as u64,
            Self::Wide64(b) => b.start,
        }
    }

    /// Last meaningful unit.
    pub fn end(&self) -> u64 {
        match self {
            Self::Flat32(b) => b.end as u64,
            Self::Wide64(b) => b.end,
        }
    }

    /// Last stored unit (including group padding).
    pub fn real_end(&self) -> u64 {
        match self {
            Self::Flat32(b) => b.real_end as u64,
            Self::Wide64(b) => b.real_end,
        }
    }

    fn scale(&self, arg: u64) -> u64 {
        match self {
            Self::Flat32(_) => arg,
            Self::Wide64(b) => arg >> b.cluster_bits,
        }
    }

    /// Marks one unit used. Out-of-range arguments are ignored.
    pub fn mark(&mut self, arg: u64) {
        let arg = self.scale(arg);
        match self {
            Self::Flat32(b) => {
                if arg > u32::MAX as u64 || arg < b.start as u64 || arg > b.end as u64 {
                    return;
                }
                set_bit(&mut b.bits, arg - b.start as u64);
            }
            Self::Wide64(b) => {
                if arg < b.start || arg > b.end {
                    return;
                }
                let Backend::Bitarray(bits) = &mut b.backend;
                set_bit(bits, arg - b.start);
            }
        }
    }

    /// Marks one unit free. Out-of-range arguments are ignored.
    pub fn unmark(&mut self, arg: u64) {
        let arg = self.scale(arg);
        match self {
            Self::Flat32(b) => {
                if arg > u32::MAX as u64 || arg < b.start as u64 || arg > b.end as u64 {
                    return;
                }
                clear_bit(&mut b.bits, arg - b.start as u64);
            }
            Self::Wide64(b) => {
                if arg < b.start || arg > b.end {
                    return;
                }
                let Backend::Bitarray(bits) = &mut b.backend;
                clear_bit(bits, arg - b.start);
            }
        }
    }

    /// Tests one unit; out-of-range arguments read as free.
    pub fn test(&self, arg: u64) -> bool {
        let arg = self.scale(arg);
        match self {
            Self::Flat32(b) => {
                if arg > u32::MAX as u64 || arg < b.start as u64 || arg > b.end as u64 {
                    return false;
                }
                test_bit(&b.bits, arg - b.start as u64)
            }
            Self::Wide64(b) => {
                if arg < b.start || arg > b.end {
                    return false;
                }
                let Backend::Bitarray(bits) = &b.backend;
                test_bit(bits, arg - b.start)
            }
        }
    }

    /// Marks a run of blocks used, rounding to clusters on 64-bit maps.
    pub fn mark_range(&mut self, block: u64, num: u64) {
        match self {
            Self::Flat32(b) => {
                if block > u32::MAX as u64 || block + num - 1 > u32::MAX as u64 {
                    return;
                }
                if block < b.start as u64 || block + num - 1 > b.end as u64 {
                    return;
                }
                for i in 0..num {
                    set_bit(&mut b.bits, block + i - b.start as u64);
                }
            }
            Self::Wide64(b) => {
                let start = block >> b.cluster_bits;
                let end = (block + num + (1 << b.cluster_bits) - 1) >> b.cluster_bits;
                let num = end - start;
                if start < b.start || start > b.end || start + num - 1 > b.end {
                    return;
                }
                let Backend::Bitarray(bits) = &mut b.backend;
                for i in 0..num {
                    set_bit(bits, start + i - b.start);
                }
            }
        }
    }

    /// Copies `num` bits from `data` into the bitmap at `start`.
    pub fn set_range(&mut self, start: u64, num: u64, data: &[u8]) -> Result<()> {
        let bytes = ((num + 7) / 8) as usize;
        match self {
            Self::Flat32(b) => {
                if start + num - 1 > u32::MAX as u64 {
                    return Err(Errno::EUCLEAN);
                }
                if start < b.start as u64 || start + num - 1 > b.real_end as u64 {
                    return Err(Errno::EUCLEAN);
                }
                let at = ((start - b.start as u64) / 8) as usize;
                b.bits[at..at + bytes].copy_from_slice(&data[..bytes]);
                Ok(())
            }
            Self::Wide64(b) => {
                if start < b.start || start + num - 1 > b.real_end {
                    return Err(Errno::EUCLEAN);
                }
                let Backend::Bitarray(bits) = &mut b.backend;
                let at = ((start - b.start) / 8) as usize;
                bits[at..at + bytes].copy_from_slice(&data[..bytes]);
                Ok(())
            }
        }
    }

    /// Copies `num` bits out of the bitmap at `start` into `data`.
    pub fn get_range(&self, start: u64, num: u64, data: &mut [u8]) -> Result<()> {
        let bytes = ((num + 7) / 8) as usize;
        match self {
            Self::Flat32(b) => {
                if start + num - 1 > u32::MAX as u64 {
                    return Err(Errno::EUCLEAN);
                }
                if start < b.start as u64 || start + num - 1 > b.real_end as u64 {
                    return Err(Errno::EUCLEAN);
                }
                let at = ((start - b.start as u64) / 8) as usize;
                data[..bytes].copy_from_slice(&b.bits[at..at + bytes]);
                Ok(())
            }
            Self::Wide64(b) => {
                if start < b.start || start + num - 1 > b.real_end {
                    return Err(Errno::EUCLEAN);
                }
                let Backend::Bitarray(bits) = &b.backend;
                let at = ((start - b.start) / 8) as usize;
                data[..bytes].copy_from_slice(&bits[at..at + bytes]);
                Ok(())
            }
        }
    }

    /// Finds the first zero bit in `[start, end]`.
    pub fn find_first_zero(&self, start: u64, end: u64) -> Result<u64> {
        match self {
            Self::Flat32(b) => {
                if start > u32::MAX as u64 || end > u32::MAX as u64 {
                    return Err(Errno::EUCLEAN);
                }
                if start < b.start as u64 || end > b.end as u64 || start > end {
                    return Err(Errno::EUCLEAN);
                }
                let mut at = start;
                while at <= end {
                    if !test_bit(&b.bits, at - b.start as u64) {
                        return Ok(at);
                    }
                    at += 1;
                }
                Err(Errno::ENOENT)
            }
            Self::Wide64(b) => {
                let cstart = start >> b.cluster_bits;
                let cend = end >> b.cluster_bits;
                if cstart < b.start || cend > b.end || start > end {
                    return Err(Errno::EUCLEAN);
                }
                let Backend::Bitarray(bits) = &b.backend;
                let mut at = cstart;
                while at <= cend {
                    if !test_bit(bits, at - b.start) {
                        let found = at << b.cluster_bits;
                        return Ok(found.max(start));
                    }
                    at += 1;
                }
                Err(Errno::ENOENT)
            }
        }
    }

    /// Finds the first set bit in `[start, end]`.
    pub fn find_first_set(&self, start: u64, end: u64) -> Result<u64> {
        match self {
            Self::Flat32(b) => {
                if start < b.start as u64 || end > b.end as u64 || start > end {
                    return Err(Errno::EUCLEAN);
                }
                let mut at = start;
                while at <= end {
                    if test_bit(&b.bits, at - b.start as u64) {
                        return Ok(at);
                    }
                    at += 1;
                }
                Err(Errno::ENOENT)
            }
            Self::Wide64(b) => {
                let cstart = start >> b.cluster_bits;
                let cend = end >> b.cluster_bits;
                if cstart < b.start || cend > b.end || start > end {
                    return Err(Errno::EUCLEAN);
                }
                let Backend::Bitarray(bits) = &b.backend;
                let mut at = cstart;
                while at <= cend {
                    if test_bit(bits, at - b.start) {
                        let found = at << b.cluster_bits;
                        return Ok(found.max(start));
                    }
                    at += 1;
                }
                Err(Errno::ENOENT)
            }
        }
    }
}

/// Bitmap selector flags for [`Ext2Fs::read_bitmap`].
pub const BITMAP_BLOCK: u32 = 1 << 0;
/// Inode bitmap selector.
pub const BITMAP_INODE: u32 = 1 << 1;

impl Ext2Fs {
    fn allocate_block_bitmap(&self) -> Result<Bitmap> {
        let start = self.b2c(self.sb.s_first_data_block as u64);
        let end = self.b2c(self.sb.blocks_count() - 1);
        let real_end = self.sb.s_clusters_per_group as u64 * self.group_desc_count as u64 - 1
            + start;
        if self.flags.contains(FsFlags::WIDE) {
            return Bitmap::new64(
                BitmapKind::Block,
                BitmapType::Bitarray,
                self.cluster_ratio_bits,
                start,
                end,
                real_end,
            );
        }
        if end > u32::MAX as u64 || real_end > u32::MAX as u64 {
            return Err(Errno::EUCLEAN);
        }
        Ok(Bitmap::new32(
            BitmapKind::Block,
            start as u32,
            end as u32,
            real_end as u32,
        ))
    }

    fn allocate_inode_bitmap(&self) -> Result<Bitmap> {
        let start = 1u64;
        let end = self.sb.s_inodes_count as u64;
        let real_end = self.sb.s_inodes_per_group as u64 * self.group_desc_count as u64;
        if self.flags.contains(FsFlags::WIDE) {
            return Bitmap::new64(BitmapKind::Inode, BitmapType::Bitarray, 0, start, end, real_end);
        }
        Ok(Bitmap::new32(
            BitmapKind::Inode,
            start as u32,
            end as u32,
            real_end as u32,
        ))
    }

    /// Marks the blocks `group`'s superblock, descriptors and inode
    /// metadata occupy, for groups whose bitmap is not on disk.
    pub(crate) fn reserve_super_bgd(&mut self, group: u32) {
        let (super_block, old_desc, new_desc, _) = self.super_bgd_loc(group);
        let old_desc_nblocks = if self.sb.incompat().contains(crate::FeatureIncompat::META_BG) {
            self.sb.s_first_meta_bg as u64
        } else {
            self.desc_blocks + self.sb.s_reserved_gdt_blocks as u64
        };
        let blocks_count = self.sb.blocks_count();
        let Some(bmap) = self.block_bitmap.as_mut() else {
            return;
        };
        if super_block != 0 || group == 0 {
            bmap.mark(super_block);
        }
        if group == 0 && self.blksize == 1024 && self.cluster_ratio_bits > 0 {
            bmap.mark(0);
        }
        if old_desc != 0 {
            let mut nblocks = old_desc_nblocks;
            if old_desc + nblocks >= blocks_count {
                nblocks = blocks_count - old_desc;
            }
            bmap.mark_range(old_desc, nblocks);
        }
        if new_desc != 0 {
            bmap.mark(new_desc);
        }
    }

    fn mark_uninit_bg_group_blocks(&mut self) {
        for group in 0..self.group_desc_count {
            if !self.bg_test_flags(group, BgFlags::BLOCK_UNINIT) {
                continue;
            }
            self.reserve_super_bgd(group);
            let itable = self.inode_table_loc(group);
            let nblocks = self.inode_blocks_per_group as u64;
            let bbitmap = self.block_bitmap_loc(group);
            let ibitmap = self.inode_bitmap_loc(group);
            if let Some(bmap) = self.block_bitmap.as_mut() {
                if itable != 0 {
                    bmap.mark_range(itable, nblocks);
                }
                if bbitmap != 0 {
                    bmap.mark(bbitmap);
                }
                if ibitmap != 0 {
                    bmap.mark(ibitmap);
                }
            }
        }
    }

    /// Reads the selected bitmaps for groups `start..=end` from disk.
    ///
    /// Groups flagged uninitialized (with a valid descriptor checksum) are
    /// treated as all-zero; checksummed bitmaps that fail validation abort
    /// the read with `EUCLEAN`.
    pub fn read_bitmap(&mut self, flags: u32, start: u32, end: u32) -> Result<()> {
        let block_nbytes = self.sb.s_clusters_per_group as usize / 8;
        let inode_nbytes = self.sb.s_inodes_per_group as usize / 8;
        if block_nbytes > self.blksize as usize || inode_nbytes > self.blksize as usize {
            return Err(Errno::EUCLEAN);
        }
        let csum_flag = self.sb.has_group_desc_csum();

        if flags & BITMAP_BLOCK != 0 {
            self.block_bitmap = Some(self.allocate_block_bitmap()?);
        }
        if flags & BITMAP_INODE != 0 {
            self.inode_bitmap = Some(self.allocate_inode_bitmap()?);
        }

        let result = (|| -> Result<()> {
            let mut buf = vec![0u8; self.blksize as usize];
            let mut blkitr = self.b2c(self.sb.s_first_data_block as u64)
                + start as u64 * (block_nbytes as u64 * 8);
            let mut inoitr = 1 + start as u64 * (inode_nbytes as u64 * 8);

            for group in start..=end {
                if flags & BITMAP_BLOCK != 0 {
                    let mut block = self.block_bitmap_loc(group);
                    if (csum_flag
                        && self.bg_test_flags(group, BgFlags::BLOCK_UNINIT)
                        && self.group_desc_checksum_valid(group))
                        || block >= self.sb.blocks_count()
                    {
                        block = 0;
                    }
                    if block != 0 {
                        self.read_blocks(&mut buf, block, 1)?;
                        if !self.block_bitmap_checksum_valid(group, &buf[..block_nbytes]) {
                            return Err(Errno::EUCLEAN);
                        }
                    } else {
                        buf[..block_nbytes].fill(0);
                    }
                    let count = block_nbytes as u64 * 8;
                    self.block_bitmap
                        .as_mut()
                        .ok_or(Errno::EUCLEAN)?
                        .set_range(blkitr, count, &buf)?;
                    blkitr += count;
                }

                if flags & BITMAP_INODE != 0 {
                    let mut block = self.inode_bitmap_loc(group);
                    if (csum_flag
                        && self.bg_test_flags(group, BgFlags::INODE_UNINIT)
                        && self.group_desc_checksum_valid(group))
                        || block >= self.sb.blocks_count()
                    {
                        block = 0;
                    }
                    if block != 0 {
                        self.read_blocks(&mut buf, block, 1)?;
                        if !self.inode_bitmap_checksum_valid(group, &buf[..inode_nbytes]) {
                            return Err(Errno::EUCLEAN);
                        }
                    } else {
                        buf[..inode_nbytes].fill(0);
                    }
                    let count = inode_nbytes as u64 * 8;
                    self.inode_bitmap
                        .as_mut()
                        .ok_or(Errno::EUCLEAN)?
                        .set_range(inoitr, count, &buf)?;
                    inoitr += count;
                }
            }

            if flags & BITMAP_BLOCK != 0 {
                self.mark_uninit_bg_group_blocks();
            }
            Ok(())
        })();

        if result.is_err() {
            if flags & BITMAP_BLOCK != 0 {
                self.block_bitmap = None;
            }
            if flags & BITMAP_INODE != 0 {
                self.inode_bitmap = None;
            }
        }
        result
    }

    /// Loads whichever bitmaps are not yet in memory.
    pub fn read_bitmaps(&mut self) -> Result<()> {
        let mut flags = 0;
        if self.block_bitmap.is_none() {
            flags |= BITMAP_BLOCK;
        }
        if self.inode_bitmap.is_none() {
            flags |= BITMAP_INODE;
        }
        if flags == 0 {
            return Ok(());
        }
        let end = self.group_desc_count - 1;
        self.read_bitmap(flags, 0, end)
    }

    /// Writes dirty bitmaps back to disk, refreshing their checksums and
    /// the affected descriptor checksums.
    pub fn write_bitmaps(&mut self) -> Result<()> {
        let do_block = self.block_bitmap.is_some() && self.flags.contains(FsFlags::BB_DIRTY);
        let do_inode = self.inode_bitmap.is_some() && self.flags.contains(FsFlags::IB_DIRTY);
        if !do_block && !do_inode {
            return Ok(());
        }
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let csum_flag = self.sb.has_group_desc_csum();
        let block_nbytes = self.sb.s_clusters_per_group as usize / 8;
        let inode_nbytes = (self.sb.s_inodes_per_group as usize + 7) / 8;
        let mut blockbuf = vec![0xffu8; self.blksize as usize];
        let mut inodebuf = vec![0xffu8; self.blksize as usize];
        let mut blkitr = self.b2c(self.sb.s_first_data_block as u64);
        let mut inoitr = 1u64;

        for group in 0..self.group_desc_count {
            if do_block {
                if csum_flag && self.bg_test_flags(group, BgFlags::BLOCK_UNINIT) {
                    blkitr += block_nbytes as u64 * 8;
                } else {
                    self.block_bitmap
                        .as_ref()
                        .ok_or(Errno::EUCLEAN)?
                        .get_range(blkitr, block_nbytes as u64 * 8, &mut blockbuf)?;
                    if group == self.group_desc_count - 1 {
                        // Pad the tail of the last group with set bits.
                        let used = (self.sb.blocks_count()
                            - self.sb.s_first_data_block as u64)
                            % self.sb.s_blocks_per_group as u64;
                        let nbits = if used == 0 {
                            0
                        } else {
                            (used + self.cluster_mask()) >> self.cluster_ratio_bits
                        };
                        if nbits != 0 {
                            for bit in nbits..self.blksize as u64 * 8 {
                                set_bit(&mut blockbuf, bit);
                            }
                        }
                    }
                    self.block_bitmap_checksum_update(group, &blockbuf[..block_nbytes]);
                    self.group_desc_checksum_update(group);
                    self.flags |= FsFlags::DIRTY;
                    let block = self.block_bitmap_loc(group);
                    if block != 0 {
                        self.write_blocks(&blockbuf, block, 1)?;
                    }
                    blkitr += block_nbytes as u64 * 8;
                }
            }

            if do_inode {
                if csum_flag && self.bg_test_flags(group, BgFlags::INODE_UNINIT) {
                    inoitr += inode_nbytes as u64 * 8;
                } else {
                    self.inode_bitmap
                        .as_ref()
                        .ok_or(Errno::EUCLEAN)?
                        .get_range(inoitr, inode_nbytes as u64 * 8, &mut inodebuf)?;
                    self.inode_bitmap_checksum_update(group, &inodebuf[..inode_nbytes]);
                    self.group_desc_checksum_update(group);
                    self.flags |= FsFlags::DIRTY;
                    let block = self.inode_bitmap_loc(group);
                    if block != 0 {
                        self.write_blocks(&inodebuf, block, 1)?;
                    }
                    inoitr += inode_nbytes as u64 * 8;
                }
            }
        }

        if do_block {
            self.flags &= !FsFlags::BB_DIRTY;
        }
        if do_inode {
            self.flags &= !FsFlags::IB_DIRTY;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_unmark_roundtrip() {
        let mut bmap = Bitmap::new32(BitmapKind::Block, 1, 1000, 1023);
        assert!(!bmap.test(17));
        bmap.mark(17);
        assert!(bmap.test(17));
        bmap.unmark(17);
        assert!(!bmap.test(17));
    }

    #[test]
    fn out_of_range_ignored() {
        let mut bmap = Bitmap::new32(BitmapKind::Block, 1, 100, 127);
        bmap.mark(0);
        bmap.mark(101);
        for i in 1..=100 {
            assert!(!bmap.test(i));
        }
    }

    #[test]
    fn range_roundtrips_bit_for_bit() {
        let mut bmap = Bitmap::new32(BitmapKind::Inode, 1, 64, 64);
        let pattern = [0xa5u8, 0x3c, 0xff, 0x00, 0x81, 0x7e, 0x55, 0xaa];
        bmap.set_range(1, 64, &pattern).unwrap();
        let mut out = [0u8; 8];
        bmap.get_range(1, 64, &mut out).unwrap();
        assert_eq!(out, pattern);
        // Individual bits agree with the byte view.
        assert!(bmap.test(1)); // bit 0 of 0xa5
        assert!(!bmap.test(2));
        assert!(bmap.test(3));
    }

    #[test]
    fn find_first_zero_and_set() {
        let mut bmap = Bitmap::new32(BitmapKind::Block, 1, 64, 127);
        for i in 1..=10 {
            bmap.mark(i);
        }
        assert_eq!(bmap.find_first_zero(1, 64).unwrap(), 11);
        assert_eq!(bmap.find_first_set(5, 64).unwrap(), 5);
        bmap.mark(40);
        assert_eq!(bmap.find_first_set(20, 64).unwrap(), 40);
        for i in 1..=64 {
            bmap.mark(i);
        }
        assert_eq!(bmap.find_first_zero(1, 64).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn wide64_bitarray_backend() {
        let end = 1u64 << 24;
        let mut bmap =
            Bitmap::new64(BitmapKind::Block, BitmapType::Bitarray, 0, 1, end, end).unwrap();
        let big = end - 12345;
        bmap.mark(big);
        assert!(bmap.test(big));
        assert_eq!(bmap.find_first_set(end / 2, end).unwrap(), big);
        bmap.unmark(big);
        assert!(!bmap.test(big));
    }

    #[test]
    fn other_backends_are_euclean() {
        assert_eq!(
            Bitmap::new64(BitmapKind::Block, BitmapType::RbTree, 0, 0, 10, 10).unwrap_err(),
            Errno::EUCLEAN
        );
        assert_eq!(
            Bitmap::new64(BitmapKind::Inode, BitmapType::Autodir, 0, 0, 10, 10).unwrap_err(),
            Errno::EUCLEAN
        );
    }

    #[test]
    fn cluster_scaling() {
        // 4 blocks per cluster.
        let mut bmap =
            Bitmap::new64(BitmapKind::Block, BitmapType::Bitarray, 2, 0, 100, 100).unwrap();
        bmap.mark(8); // cluster 2
        assert!(bmap.test(8));
        assert!(bmap.test(9)); // same cluster
        assert!(!bmap.test(12));
    }
}
