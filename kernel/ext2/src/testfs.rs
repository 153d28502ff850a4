//! Test fixtures: a RAM block device and a minimal mkfs.
//!
//! The images use 1 KiB blocks and a single block group: superblock in
//! block 1, descriptors in 2, bitmaps in 3 and 4, a 64-entry inode table
//! in 5..=12, and the root directory's data in block 13.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pml_core::sync::SpinLock;
use pml_core::Result;
use pml_fs::mode::S_IFDIR;
use pml_fs::BlockDevice;

use crate::bitmap::set_bit;
use crate::inode::Ext2Inode;
use crate::{write_struct, FeatureIncompat, GroupDesc, Superblock, EXT2_MAGIC, EXT2_STATE_VALID};

/// Byte-addressed RAM disk.
pub struct MemDisk {
    data: SpinLock<Vec<u8>>,
}

impl MemDisk {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new(vec![0u8; size]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        let n = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

const BLK: usize = 1024;
const INODES: u32 = 64;
const FIRST_INO: u32 = 11;
const INODE_TABLE_BLOCK: u64 = 5;
const ROOT_DATA_BLOCK: u64 = 13;

fn mkfs(size: usize, incompat: FeatureIncompat) -> Arc<MemDisk> {
    let blocks = (size / BLK) as u32;
    assert!(blocks >= 32 && blocks <= 8192 + 1);
    let disk = MemDisk::new(size);
    let mut image = vec![0u8; size];

    let mut sb = Superblock::default();
    sb.s_inodes_count = INODES;
    sb.s_blocks_count = blocks;
    sb.s_free_blocks_count = blocks - 14;
    sb.s_free_inodes_count = INODES - FIRST_INO + 1;
    sb.s_first_data_block = 1;
    sb.s_log_block_size = 0;
    sb.s_log_cluster_size = 0;
    sb.s_blocks_per_group = 8192;
    sb.s_clusters_per_group = 8192;
    sb.s_inodes_per_group = INODES;
    sb.s_magic = EXT2_MAGIC;
    sb.s_state = EXT2_STATE_VALID;
    sb.s_rev_level = 1;
    sb.s_first_ino = FIRST_INO;
    sb.s_inode_size = 128;
    sb.s_feature_incompat = incompat.bits();
    sb.s_uuid = *b"pml-test-fs-uuid";
    write_struct(&sb, &mut image[1024..2048]);

    let mut desc = GroupDesc::default();
    desc.bg_block_bitmap = 3;
    desc.bg_inode_bitmap = 4;
    desc.bg_inode_table = INODE_TABLE_BLOCK as u32;
    desc.bg_free_blocks_count = (blocks - 14) as u16;
    desc.bg_free_inodes_count = (INODES - FIRST_INO + 1) as u16;
    desc.bg_used_dirs_count = 1;
    write_struct(&desc, &mut image[2 * BLK..2 * BLK + 64]);

    // Block bitmap: blocks 1..=13 in use, tail of the group padded.
    {
        let bmap = &mut image[3 * BLK..4 * BLK];
        for block in 1..=ROOT_DATA_BLOCK {
            set_bit(bmap, block - 1);
        }
        for bit in (blocks as u64 - 1)..(8 * BLK as u64) {
            set_bit(bmap, bit);
        }
    }
    // Inode bitmap: the reserved inodes, tail padded.
    {
        let bmap = &mut image[4 * BLK..5 * BLK];
        for ino in 1..FIRST_INO as u64 {
            set_bit(bmap, ino - 1);
        }
        for bit in INODES as u64..(8 * BLK as u64) {
            set_bit(bmap, bit);
        }
    }

    // Root inode.
    let mut root = Ext2Inode::default();
    root.i_mode = (S_IFDIR | 0o755) as u16;
    root.i_size = BLK as u32;
    root.i_links_count = 2;
    root.i_blocks = 2;
    root.i_block[0] = ROOT_DATA_BLOCK as u32;
    let at = INODE_TABLE_BLOCK as usize * BLK + 128; // record of inode 2
    write_struct(&root, &mut image[at..at + 128]);

    // Root directory data: `.` and `..`.
    {
        let buf = &mut image[ROOT_DATA_BLOCK as usize * BLK..(ROOT_DATA_BLOCK as usize + 1) * BLK];
        let ft = if incompat.contains(FeatureIncompat::FILETYPE) {
            2u16 << 8
        } else {
            0
        };
        buf[0..4].copy_from_slice(&2u32.to_le_bytes());
        buf[4..6].copy_from_slice(&12u16.to_le_bytes());
        buf[6..8].copy_from_slice(&(ft | 1).to_le_bytes());
        buf[8] = b'.';
        buf[12..16].copy_from_slice(&2u32.to_le_bytes());
        buf[16..18].copy_from_slice(&((BLK - 12) as u16).to_le_bytes());
        buf[18..20].copy_from_slice(&(ft | 2).to_le_bytes());
        buf[20] = b'.';
        buf[21] = b'.';
    }

    disk.write(&image, 0).unwrap();
    disk
}

/// A fresh ext2 image with the `FILETYPE` feature.
pub fn mkfs_basic(size: usize) -> Arc<MemDisk> {
    mkfs(size, FeatureIncompat::FILETYPE)
}

/// A fresh image that also advertises extent support.
pub fn mkfs_extents(size: usize) -> Arc<MemDisk> {
    mkfs(size, FeatureIncompat::FILETYPE.union(FeatureIncompat::EXTENTS))
}
