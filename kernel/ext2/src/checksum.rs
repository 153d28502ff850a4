//! Metadata checksums.
//!
//! ext4 checksums metadata with crc32c (Castagnoli), seeded from
//! `s_checksum_seed` or a bootstrap over the UUID. Pre-metadata_csum
//! filesystems checksum group descriptors with crc16 instead. Checksums
//! never include their own storage: the field is zeroed (or the range
//! truncated) while computing.

use alloc::vec;

use pml_core::Result;

use crate::dir;
use crate::{
    struct_bytes, BG_BLOCK_BITMAP_CSUM_HI_END, BG_CHECKSUM_OFFSET, BG_INODE_BITMAP_CSUM_HI_END,
    Ext2Fs, Superblock, EXT2_OLD_INODE_SIZE,
};

/// Reversed Castagnoli polynomial.
const CRC32C_POLY: u32 = 0x82f6_3b78;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

/// Continues a crc32c computation over `data`.
///
/// No pre- or post-inversion is applied; the caller supplies the running
/// value (`!0` to start a fresh checksum the way the on-disk format does).
pub fn crc32c(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = CRC32C_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}

/// Continues a crc16 (ANSI, reversed 0x8005) computation over `data`.
pub fn crc16(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xa001 } else { crc >> 1 };
        }
    }
    crc
}

/// Extra-isize threshold above which `i_checksum_hi` exists.
pub const INODE_CSUM_HI_EXTRA_END: u16 =
    (128 + 2 + 2 - EXT2_OLD_INODE_SIZE as usize) as u16;

/// Offset of `l_i_checksum_lo` within the inode record.
const INODE_CSUM_LO_OFFSET: usize = 124;
/// Offset of `i_checksum_hi` within a large inode record.
const INODE_CSUM_HI_OFFSET: usize = 130;
/// Offset of `i_extra_isize` within a large inode record.
const INODE_EXTRA_ISIZE_OFFSET: usize = 128;
/// Offset of `i_generation` within the inode record.
const INODE_GENERATION_OFFSET: usize = 100;

impl Ext2Fs {
    /// Checksum of a superblock (crc32c over everything before the field).
    pub fn superblock_checksum(sb: &Superblock) -> u32 {
        let offset = core::mem::offset_of!(Superblock, s_checksum);
        crc32c(!0, &struct_bytes(sb)[..offset])
    }

    /// Whether the in-memory superblock checksum validates.
    pub fn superblock_checksum_valid(&self) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        self.sb.s_checksum == Self::superblock_checksum(&self.sb)
    }

    /// Recomputes a superblock checksum in place.
    pub fn superblock_checksum_update(&self, sb: &mut Superblock) {
        if !self.sb.has_metadata_csum() {
            return;
        }
        sb.s_checksum = Self::superblock_checksum(sb);
    }

    /// Stored checksum of the descriptor of `group`.
    pub fn bg_checksum(&self, group: u32) -> u16 {
        self.desc(group).bg_checksum
    }

    /// Stores a descriptor checksum.
    pub fn bg_checksum_update(&mut self, group: u32, checksum: u16) {
        let mut desc = self.desc(group);
        desc.bg_checksum = checksum;
        self.set_desc(group, &desc);
    }

    /// Computes the descriptor checksum of `group`.
    ///
    /// metadata_csum uses crc32c over `(group, descriptor)` with the
    /// checksum field zeroed; older GDT_CSUM filesystems use crc16 over
    /// `(uuid, group, descriptor-minus-checksum)`.
    pub fn group_desc_checksum(&self, group: u32) -> u16 {
        let size = self.sb.desc_size() as usize;
        let raw = self.desc_bytes(group);
        if self.sb.has_metadata_csum() {
            let mut copy = vec![0u8; size];
            copy.copy_from_slice(raw);
            copy[BG_CHECKSUM_OFFSET] = 0;
            copy[BG_CHECKSUM_OFFSET + 1] = 0;
            let mut crc = crc32c(self.checksum_seed, &group.to_le_bytes());
            crc = crc32c(crc, &copy);
            crc as u16
        } else {
            let mut crc = crc16(0xffff, &self.sb.s_uuid);
            crc = crc16(crc, &group.to_le_bytes());
            crc = crc16(crc, &raw[..BG_CHECKSUM_OFFSET]);
            let after = BG_CHECKSUM_OFFSET + 2;
            if after < size {
                crc = crc16(crc, &raw[after..]);
            }
            crc
        }
    }

    /// Whether the descriptor checksum of `group` validates.
    pub fn group_desc_checksum_valid(&self, group: u32) -> bool {
        if !self.sb.has_group_desc_csum() {
            return true;
        }
        self.bg_checksum(group) == self.group_desc_checksum(group)
    }

    /// Refreshes the descriptor checksum of `group`.
    pub fn group_desc_checksum_update(&mut self, group: u32) {
        if !self.sb.has_group_desc_csum() {
            return;
        }
        let checksum = self.group_desc_checksum(group);
        self.bg_checksum_update(group, checksum);
    }

    /// Whether the raw inode record is eligible for the checksum high half.
    pub fn inode_has_csum_hi(&self, raw: &[u8]) -> bool {
        if self.sb.inode_size() <= EXT2_OLD_INODE_SIZE {
            return false;
        }
        let extra = u16::from_le_bytes([
            raw[INODE_EXTRA_ISIZE_OFFSET],
            raw[INODE_EXTRA_ISIZE_OFFSET + 1],
        ]);
        extra >= INODE_CSUM_HI_EXTRA_END
    }

    /// Computes the checksum of a raw inode record.
    pub fn inode_checksum(&self, ino: u32, raw: &[u8], has_hi: bool) -> u32 {
        let mut copy = vec![0u8; raw.len()];
        copy.copy_from_slice(raw);
        copy[INODE_CSUM_LO_OFFSET] = 0;
        copy[INODE_CSUM_LO_OFFSET + 1] = 0;
        if has_hi {
            copy[INODE_CSUM_HI_OFFSET] = 0;
            copy[INODE_CSUM_HI_OFFSET + 1] = 0;
        }
        let r#gen = &raw[INODE_GENERATION_OFFSET..INODE_GENERATION_OFFSET + 4];
        let mut crc = crc32c(self.checksum_seed, &ino.to_le_bytes());
        crc = crc32c(crc, r#gen);
        crc32c(crc, &copy)
    }

    /// Validates a raw inode record's checksum.
    ///
    /// All-zero records pass: uninitialized inode-table slots carry no
    /// checksum at all.
    pub fn inode_checksum_valid(&self, ino: u32, raw: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        let has_hi = self.inode_has_csum_hi(raw);
        let mut provided =
            u16::from_le_bytes([raw[INODE_CSUM_LO_OFFSET], raw[INODE_CSUM_LO_OFFSET + 1]]) as u32;
        let mut crc = self.inode_checksum(ino, raw, has_hi);
        if has_hi {
            provided |= (u16::from_le_bytes([
                raw[INODE_CSUM_HI_OFFSET],
                raw[INODE_CSUM_HI_OFFSET + 1],
            ]) as u32)
                << 16;
        } else {
            crc &= 0xffff;
        }
        if provided == crc {
            return true;
        }
        raw[..EXT2_OLD_INODE_SIZE as usize].iter().all(|&b| b == 0)
    }

    /// Refreshes a raw inode record's checksum.
    pub fn inode_checksum_update(&self, ino: u32, raw: &mut [u8]) {
        if !self.sb.has_metadata_csum() {
            return;
        }
        let has_hi = self.inode_has_csum_hi(raw);
        let crc = self.inode_checksum(ino, raw, has_hi);
        raw[INODE_CSUM_LO_OFFSET..INODE_CSUM_LO_OFFSET + 2]
            .copy_from_slice(&(crc as u16).to_le_bytes());
        if has_hi {
            raw[INODE_CSUM_HI_OFFSET..INODE_CSUM_HI_OFFSET + 2]
                .copy_from_slice(&((crc >> 16) as u16).to_le_bytes());
        }
    }

    /// Computes the checksum of an extent tree block.
    ///
    /// The checksum covers `(ino, generation, header..tail)` and is stored
    /// in the `extent_tail` that follows the entry array.
    pub fn extent_block_checksum(&mut self, ino: u32, buf: &[u8]) -> Result<(u32, usize)> {
        let inode = self.read_inode(ino)?;
        let eh_max = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let tail_offset = 12 + 12 * eh_max;
        let mut crc = crc32c(self.checksum_seed, &ino.to_le_bytes());
        crc = crc32c(crc, &inode.i_generation.to_le_bytes());
        crc = crc32c(crc, &buf[..tail_offset]);
        Ok((crc, tail_offset))
    }

    /// Validates an extent tree block checksum.
    pub fn extent_block_checksum_valid(&mut self, ino: u32, buf: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        match self.extent_block_checksum(ino, buf) {
            Ok((crc, tail)) => {
                if tail + 4 > buf.len() {
                    return false;
                }
                let provided =
                    u32::from_le_bytes([buf[tail], buf[tail + 1], buf[tail + 2], buf[tail + 3]]);
                provided == crc
            }
            Err(_) => false,
        }
    }

    /// Refreshes an extent tree block checksum.
    pub fn extent_block_checksum_update(&mut self, ino: u32, buf: &mut [u8]) -> Result<()> {
        if !self.sb.has_metadata_csum() {
            return Ok(());
        }
        let (crc, tail) = self.extent_block_checksum(ino, buf)?;
        if tail + 4 <= buf.len() {
            buf[tail..tail + 4].copy_from_slice(&crc.to_le_bytes());
        }
        Ok(())
    }

    /// Block bitmap checksum of `group` as stored in the descriptor.
    pub fn block_bitmap_checksum(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut checksum = desc.bg_block_bitmap_csum_lo as u32;
        if self.sb.desc_size() >= BG_BLOCK_BITMAP_CSUM_HI_END {
            checksum |= (desc.bg_block_bitmap_csum_hi as u32) << 16;
        }
        checksum
    }

    /// Validates a block bitmap against the descriptor of `group`.
    pub fn block_bitmap_checksum_valid(&self, group: u32, bitmap: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        let desc = self.desc(group);
        let mut provided = desc.bg_block_bitmap_csum_lo as u32;
        let mut crc = crc32c(self.checksum_seed, bitmap);
        if self.sb.desc_size() >= BG_BLOCK_BITMAP_CSUM_HI_END {
            provided |= (desc.bg_block_bitmap_csum_hi as u32) << 16;
        } else {
            crc &= 0xffff;
        }
        provided == crc
    }

    /// Stores a block bitmap checksum into the descriptor of `group`.
    pub fn block_bitmap_checksum_update(&mut self, group: u32, bitmap: &[u8]) {
        if !self.sb.has_metadata_csum() {
            return;
        }
        let crc = crc32c(self.checksum_seed, bitmap);
        let mut desc = self.desc(group);
        desc.bg_block_bitmap_csum_lo = crc as u16;
        if self.sb.desc_size() >= BG_BLOCK_BITMAP_CSUM_HI_END {
            desc.bg_block_bitmap_csum_hi = (crc >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Inode bitmap checksum of `group` as stored in the descriptor.
    pub fn inode_bitmap_checksum(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut checksum = desc.bg_inode_bitmap_csum_lo as u32;
        if self.sb.desc_size() >= BG_INODE_BITMAP_CSUM_HI_END {
            checksum |= (desc.bg_inode_bitmap_csum_hi as u32) << 16;
        }
        checksum
    }

    /// Validates an inode bitmap against the descriptor of `group`.
    pub fn inode_bitmap_checksum_valid(&self, group: u32, bitmap: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        let desc = self.desc(group);
        let mut provided = desc.bg_inode_bitmap_csum_lo as u32;
        let mut crc = crc32c(self.checksum_seed, bitmap);
        if self.sb.desc_size() >= BG_INODE_BITMAP_CSUM_HI_END {
            provided |= (desc.bg_inode_bitmap_csum_hi as u32) << 16;
        } else {
            crc &= 0xffff;
        }
        provided == crc
    }

    /// Stores an inode bitmap checksum into the descriptor of `group`.
    pub fn inode_bitmap_checksum_update(&mut self, group: u32, bitmap: &[u8]) {
        if !self.sb.has_metadata_csum() {
            return;
        }
        let crc = crc32c(self.checksum_seed, bitmap);
        let mut desc = self.desc(group);
        desc.bg_inode_bitmap_csum_lo = crc as u16;
        if self.sb.desc_size() >= BG_INODE_BITMAP_CSUM_HI_END {
            desc.bg_inode_bitmap_csum_hi = (crc >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Computes a linear directory block checksum.
    ///
    /// Covers `(dir ino, generation, entries)` up to the tail.
    pub fn dirent_checksum(&self, dir_ino: u32, r#gen: u32, data: &[u8]) -> u32 {
        let mut crc = crc32c(self.checksum_seed, &dir_ino.to_le_bytes());
        crc = crc32c(crc, &r#gen.to_le_bytes());
        crc32c(crc, data)
    }

    /// Computes an htree block checksum over the dx entry array.
    pub fn dx_checksum(
        &self,
        dir_ino: u32,
        r#gen: u32,
        buf: &[u8],
    ) -> Result<(u32, usize)> {
        let (count_offset, limit, count) = dir::get_dx_countlimit(self, buf)?;
        let tail = count_offset + limit * 8;
        let size = count_offset + count * 8;
        let mut crc = crc32c(self.checksum_seed, &dir_ino.to_le_bytes());
        crc = crc32c(crc, &r#gen.to_le_bytes());
        crc = crc32c(crc, &buf[..size]);
        // The dx_tail reserved word plus a zero placeholder checksum.
        crc = crc32c(crc, &buf[tail..tail + 4]);
        crc = crc32c(crc, &0u32.to_le_bytes());
        Ok((crc, tail + 4))
    }

    /// Validates a directory block (linear or htree form).
    pub fn dir_block_checksum_valid(&self, dir_ino: u32, r#gen: u32, buf: &[u8]) -> bool {
        if !self.sb.has_metadata_csum() {
            return true;
        }
        if let Ok(tail) = dir::get_dirent_tail(self, buf) {
            let provided =
                u32::from_le_bytes([buf[tail + 8], buf[tail + 9], buf[tail + 10], buf[tail + 11]]);
            return provided == self.dirent_checksum(dir_ino, r#gen, &buf[..tail]);
        }
        if let Ok((crc, at)) = self.dx_checksum(dir_ino, r#gen, buf) {
            let provided = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            return provided == crc;
        }
        false
    }

    /// Refreshes a directory block checksum (linear or htree form).
    pub fn dir_block_checksum_update(
        &mut self,
        dir_ino: u32,
        r#gen: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if !self.sb.has_metadata_csum() {
            return Ok(());
        }
        if let Ok(tail) = dir::get_dirent_tail(self, buf) {
            let crc = self.dirent_checksum(dir_ino, r#gen, &buf[..tail]);
            buf[tail + 8..tail + 12].copy_from_slice(&crc.to_le_bytes());
            return Ok(());
        }
        if let Ok((crc, at)) = self.dx_checksum(dir_ino, r#gen, buf) {
            buf[at..at + 4].copy_from_slice(&crc.to_le_bytes());
            return Ok(());
        }
        Err(pml_core::Errno::ENOSPC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vector() {
        // Standard CRC-32C of "123456789" with the usual pre/post inversion.
        assert_eq!(crc32c(!0, b"123456789") ^ !0, 0xe306_9283);
    }

    #[test]
    fn crc16_known_vector() {
        // CRC-16/MODBUS of "123456789".
        assert_eq!(crc16(0xffff, b"123456789"), 0x4b37);
    }

    #[test]
    fn crc32c_is_incremental() {
        let whole = crc32c(!0, b"hello world");
        let split = crc32c(crc32c(!0, b"hello "), b"world");
        assert_eq!(whole, split);
    }

    #[test]
    fn superblock_checksum_roundtrip() {
        let mut sb = Superblock::default();
        sb.s_magic = crate::EXT2_MAGIC;
        sb.s_feature_ro_compat = crate::FeatureRoCompat::METADATA_CSUM.bits();
        sb.s_checksum = Ext2Fs::superblock_checksum(&sb);
        let expected = sb.s_checksum;
        // Mutating any covered field changes the checksum.
        sb.s_inodes_count = 77;
        assert_ne!(Ext2Fs::superblock_checksum(&sb), expected);
    }
}
