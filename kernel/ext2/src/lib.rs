//! Read/write driver for the second extended filesystem and its ext3/ext4
//! descendants.
//!
//! The engine ([`Ext2Fs`]) operates synchronously on a byte-addressed block
//! device and keeps the superblock, group descriptors, allocation bitmaps
//! and a small inode cache in memory. Classic indirect addressing and ext4
//! extent trees are both supported, as are 64-bit layouts and metadata
//! checksums. Journals are never replayed: their presence forces a
//! read-only mount.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use pml_core::{Errno, Result};
use pml_fs::block::{read_exact, write_exact};
use pml_fs::{BlockDevice, MountFlags};

pub mod alloc_blk;
pub mod bitmap;
pub mod bmap;
pub mod checksum;
pub mod dir;
pub mod extent;
pub mod file;
pub mod inode;
pub mod vfs;

#[cfg(any(test, feature = "testfs"))]
pub mod testfs;

pub use self::bitmap::Bitmap;
pub use self::inode::{Ext2Inode, InodeCache, LargeInode};
pub use self::vfs::{ext2_check, ext2_mount};

/// Magic number of every ext2 superblock.
pub const EXT2_MAGIC: u16 = 0xef53;
/// The root directory inode.
pub const EXT2_ROOT_INO: u32 = 2;
/// Offset of the primary superblock in bytes.
pub const EXT2_SUPER_OFFSET: u64 = 1024;
/// Maximum file name length.
pub const EXT2_MAX_NAME: usize = 255;
/// Inode size on revision-0 filesystems.
pub const EXT2_OLD_INODE_SIZE: u32 = 128;
/// First non-reserved inode on revision-0 filesystems.
pub const EXT2_OLD_FIRST_INODE: u32 = 11;
/// Revision with dynamic inode sizes and feature flags.
pub const EXT2_DYNAMIC_REV: u32 = 1;
/// Group descriptor size without the 64-bit extension.
pub const EXT2_MIN_DESC_SIZE: u32 = 32;
/// Number of block pointers embedded in an inode.
pub const EXT2_N_BLOCKS: usize = 15;
/// Index of the indirect block pointer.
pub const EXT2_IND_BLOCK: usize = 12;
/// Index of the doubly indirect block pointer.
pub const EXT2_DIND_BLOCK: usize = 13;
/// Index of the triply indirect block pointer.
pub const EXT2_TIND_BLOCK: usize = 14;

/// Filesystem state: cleanly unmounted.
pub const EXT2_STATE_VALID: u16 = 1 << 0;

bitflags! {
    /// Compatible feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureCompat: u32 {
        /// Directory preallocation.
        const DIR_PREALLOC = 1 << 0;
        /// AFS-style imagic inodes.
        const IMAGIC_INODES = 1 << 1;
        /// An ext3 journal exists.
        const HAS_JOURNAL = 1 << 2;
        /// Extended attributes.
        const EXT_XATTR = 1 << 3;
        /// Reserved GDT blocks for resizing.
        const RESIZE_INODE = 1 << 4;
        /// Hashed directory indexes.
        const DIR_INDEX = 1 << 5;
        /// Sparse super block v2.
        const SPARSE_SUPER2 = 1 << 9;
        /// Fast commit journal extension.
        const FAST_COMMIT = 1 << 10;
        /// Inode numbers never change.
        const STABLE_INODES = 1 << 11;
    }
}

bitflags! {
    /// Incompatible feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureIncompat: u32 {
        /// Compression (never supported).
        const COMPRESSION = 1 << 0;
        /// Directory entries carry a file type byte.
        const FILETYPE = 1 << 1;
        /// The journal needs recovery.
        const RECOVER = 1 << 2;
        /// Separate journal device.
        const JOURNAL_DEV = 1 << 3;
        /// Meta block groups.
        const META_BG = 1 << 4;
        /// Extent-mapped inodes.
        const EXTENTS = 1 << 6;
        /// 64-bit block numbers.
        const WIDE = 1 << 7;
        /// Multiple mount protection.
        const MMP = 1 << 8;
        /// Flexible block groups.
        const FLEX_BG = 1 << 9;
        /// Extended attributes in inodes.
        const EA_INODE = 1 << 10;
        /// Data in directory entries.
        const DIRDATA = 1 << 12;
        /// Checksum seed stored in the superblock.
        const CSUM_SEED = 1 << 13;
        /// Directories over 2 GiB or 3-level htrees.
        const LARGEDIR = 1 << 14;
        /// Inline data in small files.
        const INLINE_DATA = 1 << 15;
        /// Encrypted inodes.
        const ENCRYPT = 1 << 16;
        /// Case-insensitive directories.
        const CASEFOLD = 1 << 17;
    }
}

bitflags! {
    /// Read-only compatible feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureRoCompat: u32 {
        /// Sparse superblock backups.
        const SPARSE_SUPER = 1 << 0;
        /// Files larger than 2 GiB.
        const LARGE_FILE = 1 << 1;
        /// Huge files counted in filesystem blocks.
        const HUGE_FILE = 1 << 3;
        /// Group descriptors have checksums.
        const GDT_CSUM = 1 << 4;
        /// Directories may exceed 65000 links.
        const DIR_NLINK = 1 << 5;
        /// Inodes carry extra size fields.
        const EXTRA_ISIZE = 1 << 6;
        /// A snapshot exists.
        const HAS_SNAPSHOT = 1 << 7;
        /// Quota inodes.
        const QUOTA = 1 << 8;
        /// Cluster allocation.
        const BIGALLOC = 1 << 9;
        /// Metadata carries crc32c checksums.
        const METADATA_CSUM = 1 << 10;
        /// Filesystem is permanently read-only.
        const READONLY = 1 << 12;
        /// Project quotas.
        const PROJECT = 1 << 13;
        /// Shared block ranges.
        const SHARED_BLOCKS = 1 << 14;
        /// fs-verity inodes.
        const VERITY = 1 << 15;
    }
}

/// Incompatible features this driver can mount.
pub const INCOMPAT_SUPPORTED: FeatureIncompat = FeatureIncompat::FILETYPE
    .union(FeatureIncompat::META_BG)
    .union(FeatureIncompat::RECOVER)
    .union(FeatureIncompat::EXTENTS)
    .union(FeatureIncompat::FLEX_BG)
    .union(FeatureIncompat::EA_INODE)
    .union(FeatureIncompat::MMP)
    .union(FeatureIncompat::WIDE)
    .union(FeatureIncompat::INLINE_DATA)
    .union(FeatureIncompat::ENCRYPT)
    .union(FeatureIncompat::CASEFOLD)
    .union(FeatureIncompat::CSUM_SEED)
    .union(FeatureIncompat::LARGEDIR);

/// Read-only features this driver can mount read/write.
pub const RO_COMPAT_SUPPORTED: FeatureRoCompat = FeatureRoCompat::SPARSE_SUPER
    .union(FeatureRoCompat::HUGE_FILE)
    .union(FeatureRoCompat::LARGE_FILE)
    .union(FeatureRoCompat::DIR_NLINK)
    .union(FeatureRoCompat::EXTRA_ISIZE)
    .union(FeatureRoCompat::GDT_CSUM)
    .union(FeatureRoCompat::BIGALLOC)
    .union(FeatureRoCompat::QUOTA)
    .union(FeatureRoCompat::METADATA_CSUM)
    .union(FeatureRoCompat::READONLY)
    .union(FeatureRoCompat::PROJECT)
    .union(FeatureRoCompat::SHARED_BLOCKS)
    .union(FeatureRoCompat::VERITY);

bitflags! {
    /// In-core filesystem state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsFlags: u32 {
        /// Something in memory differs from disk.
        const CHANGED = 1 << 0;
        /// The superblock or descriptors need writing.
        const DIRTY = 1 << 1;
        /// The superblock was valid at mount.
        const VALID = 1 << 2;
        /// The inode bitmap needs writing.
        const IB_DIRTY = 1 << 3;
        /// The block bitmap needs writing.
        const BB_DIRTY = 1 << 4;
        /// Use 64-bit bitmaps.
        const WIDE = 1 << 5;
    }
}

bitflags! {
    /// Block group descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BgFlags: u16 {
        /// Inode table and bitmap are uninitialized.
        const INODE_UNINIT = 1 << 0;
        /// Block bitmap is uninitialized.
        const BLOCK_UNINIT = 1 << 1;
        /// On-disk inode table is zeroed.
        const BLOCK_ZEROED = 1 << 2;
    }
}

/// On-disk superblock. Field layout matches the ext4 disk format; the
/// structure is naturally aligned so `repr(C)` has no padding.
#[repr(C)]
#[derive(Clone)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_cluster_size: u32,
    pub s_blocks_per_group: u32,
    pub s_clusters_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: i16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algorithm_usage_bitmap: u32,
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_reserved_gdt_blocks: u16,
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: u16,
    pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32,
    pub s_mkfs_time: u32,
    pub s_jnl_blocks: [u32; 17],
    pub s_blocks_count_hi: u32,
    pub s_r_blocks_count_hi: u32,
    pub s_free_blocks_hi: u32,
    pub s_min_extra_isize: u16,
    pub s_want_extra_isize: u16,
    pub s_flags: u32,
    pub s_raid_stride: u16,
    pub s_mmp_update_interval: u16,
    pub s_mmp_block: u64,
    pub s_raid_stripe_width: u32,
    pub s_log_groups_per_flex: u8,
    pub s_checksum_type: u8,
    pub s_encryption_level: u8,
    pub s_reserved_pad: u8,
    pub s_kbytes_written: u64,
    pub s_snapshot_inum: u32,
    pub s_snapshot_id: u32,
    pub s_snapshot_r_blocks_count: u64,
    pub s_snapshot_list: u32,
    pub s_error_count: u32,
    pub s_first_error_time: u32,
    pub s_first_error_ino: u32,
    pub s_first_error_block: u64,
    pub s_first_error_func: [u8; 32],
    pub s_first_error_line: u32,
    pub s_last_error_time: u32,
    pub s_last_error_ino: u32,
    pub s_last_error_line: u32,
    pub s_last_error_block: u64,
    pub s_last_error_func: [u8; 32],
    pub s_mount_opts: [u8; 64],
    pub s_usr_quota_inum: u32,
    pub s_grp_quota_inum: u32,
    pub s_overhead_clusters: u32,
    pub s_backup_bgs: [u32; 2],
    pub s_encrypt_algos: [u8; 4],
    pub s_encrypt_pw_salt: [u8; 16],
    pub s_lpf_ino: u32,
    pub s_prj_quota_inum: u32,
    pub s_checksum_seed: u32,
    pub s_wtime_hi: u8,
    pub s_mtime_hi: u8,
    pub s_mkfs_time_hi: u8,
    pub s_lastcheck_hi: u8,
    pub s_first_error_time_hi: u8,
    pub s_last_error_time_hi: u8,
    pub s_first_error_errcode: u8,
    pub s_last_error_errcode: u8,
    pub s_encoding: u16,
    pub s_encoding_flags: u16,
    pub s_reserved: [u32; 95],
    pub s_checksum: u32,
}

impl Default for Superblock {
    fn default() -> Self {
        // SAFETY: Every field is an integer or integer array; all-zero is a
        // valid representation.
        unsafe { core::mem::zeroed() }
    }
}

impl Superblock {
    /// Incompatible feature set.
    pub fn incompat(&self) -> FeatureIncompat {
        FeatureIncompat::from_bits_retain(self.s_feature_incompat)
    }

    /// Read-only compatible feature set.
    pub fn ro_compat(&self) -> FeatureRoCompat {
        FeatureRoCompat::from_bits_retain(self.s_feature_ro_compat)
    }

    /// Compatible feature set.
    pub fn compat(&self) -> FeatureCompat {
        FeatureCompat::from_bits_retain(self.s_feature_compat)
    }

    /// Whether block numbers use the 64-bit extension.
    pub fn has_wide(&self) -> bool {
        self.incompat().contains(FeatureIncompat::WIDE)
    }

    /// Whether metadata checksums are in force.
    pub fn has_metadata_csum(&self) -> bool {
        self.ro_compat().contains(FeatureRoCompat::METADATA_CSUM)
    }

    /// Whether group descriptors carry checksums (either flavour).
    pub fn has_group_desc_csum(&self) -> bool {
        self.ro_compat()
            .intersects(FeatureRoCompat::GDT_CSUM | FeatureRoCompat::METADATA_CSUM)
    }

    /// Total block count, including the 64-bit half when present.
    pub fn blocks_count(&self) -> u64 {
        let mut count = self.s_blocks_count as u64;
        if self.has_wide() {
            count |= (self.s_blocks_count_hi as u64) << 32;
        }
        count
    }

    /// Sets the total block count.
    pub fn set_blocks_count(&mut self, blocks: u64) {
        self.s_blocks_count = blocks as u32;
        if self.has_wide() {
            self.s_blocks_count_hi = (blocks >> 32) as u32;
        }
    }

    /// Free block count, including the 64-bit half when present.
    pub fn free_blocks_count(&self) -> u64 {
        let mut count = self.s_free_blocks_count as u64;
        if self.has_wide() {
            count |= (self.s_free_blocks_hi as u64) << 32;
        }
        count
    }

    /// Sets the free block count.
    pub fn set_free_blocks_count(&mut self, blocks: u64) {
        self.s_free_blocks_count = blocks as u32;
        if self.has_wide() {
            self.s_free_blocks_hi = (blocks >> 32) as u32;
        }
    }

    /// Adds a signed delta to the free block count.
    pub fn add_free_blocks_count(&mut self, delta: i64) {
        let count = self.free_blocks_count() as i64 + delta;
        self.set_free_blocks_count(count.max(0) as u64);
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size
    }

    /// log2 of the block size.
    pub fn block_size_bits(&self) -> u32 {
        self.s_log_block_size + 10
    }

    /// Inode record size in bytes.
    pub fn inode_size(&self) -> u32 {
        if self.s_rev_level == 0 {
            EXT2_OLD_INODE_SIZE
        } else {
            self.s_inode_size as u32
        }
    }

    /// First inode available for regular files.
    pub fn first_inode(&self) -> u32 {
        if self.s_rev_level == 0 {
            EXT2_OLD_FIRST_INODE
        } else {
            self.s_first_ino
        }
    }

    /// Group descriptor record size in bytes.
    pub fn desc_size(&self) -> u32 {
        if self.has_wide() {
            self.s_desc_size as u32
        } else {
            EXT2_MIN_DESC_SIZE
        }
    }

    /// Descriptors per descriptor-table block.
    pub fn desc_per_block(&self) -> u32 {
        self.block_size() / self.desc_size()
    }

    /// Inode records per inode-table block.
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size() / self.inode_size()
    }

    /// Bumps a revision-0 superblock to the dynamic revision.
    pub fn update_revision(&mut self) {
        if self.s_rev_level > 0 {
            return;
        }
        self.s_rev_level = EXT2_DYNAMIC_REV;
        self.s_first_ino = EXT2_OLD_FIRST_INODE;
        self.s_inode_size = EXT2_OLD_INODE_SIZE as u16;
    }
}

/// Group descriptor with the 64-bit extension. The first 32 bytes are the
/// classic descriptor; the rest reads as zero on 32-bit layouts.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GroupDesc {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub bg_flags: u16,
    pub bg_exclude_bitmap_lo: u32,
    pub bg_block_bitmap_csum_lo: u16,
    pub bg_inode_bitmap_csum_lo: u16,
    pub bg_itable_unused: u16,
    pub bg_checksum: u16,
    pub bg_block_bitmap_hi: u32,
    pub bg_inode_bitmap_hi: u32,
    pub bg_inode_table_hi: u32,
    pub bg_free_blocks_count_hi: u16,
    pub bg_free_inodes_count_hi: u16,
    pub bg_used_dirs_count_hi: u16,
    pub bg_itable_unused_hi: u16,
    pub bg_exclude_bitmap_hi: u32,
    pub bg_block_bitmap_csum_hi: u16,
    pub bg_inode_bitmap_csum_hi: u16,
    pub bg_reserved: u32,
}

/// Byte offset of `bg_checksum` within a descriptor.
pub const BG_CHECKSUM_OFFSET: usize = 30;
/// End offset of `bg_block_bitmap_csum_hi`, for hi-half eligibility.
pub const BG_BLOCK_BITMAP_CSUM_HI_END: u32 = 58 + 2;
/// End offset of `bg_inode_bitmap_csum_hi`, for hi-half eligibility.
pub const BG_INODE_BITMAP_CSUM_HI_END: u32 = 60 + 2;

/// Reads a `repr(C)` integer struct out of a byte buffer.
pub(crate) fn read_struct<T>(buf: &[u8]) -> T {
    debug_assert!(buf.len() >= core::mem::size_of::<T>());
    // SAFETY: T consists solely of integer fields, for which any bit
    // pattern is valid; the length was checked above.
    unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) }
}

/// Writes a `repr(C)` integer struct into a byte buffer.
pub(crate) fn write_struct<T>(val: &T, buf: &mut [u8]) {
    let size = core::mem::size_of::<T>();
    debug_assert!(buf.len() >= size);
    // SAFETY: Lengths checked; T has no padding by construction.
    unsafe {
        core::ptr::copy_nonoverlapping(val as *const T as *const u8, buf.as_mut_ptr(), size);
    }
}

/// Views a `repr(C)` integer struct as bytes (for checksumming).
pub(crate) fn struct_bytes<T>(val: &T) -> &[u8] {
    // SAFETY: T is a plain integer struct without padding.
    unsafe {
        core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
    }
}

/// An open ext2/3/4 filesystem instance.
pub struct Ext2Fs {
    dev: Arc<dyn BlockDevice>,
    /// In-memory copy of the primary superblock.
    pub sb: Superblock,
    /// Mount flags; journals force `RDONLY`.
    pub mflags: MountFlags,
    /// Driver state flags.
    pub flags: FsFlags,
    /// Block size in bytes.
    pub blksize: u32,
    /// Number of block groups.
    pub group_desc_count: u32,
    /// Number of blocks occupied by the descriptor table.
    pub desc_blocks: u64,
    /// Raw descriptor table (`desc_size` bytes per group).
    group_desc: Vec<u8>,
    /// Blocks per group used by the inode table.
    pub inode_blocks_per_group: u32,
    /// In-memory block allocation bitmap, loaded on demand.
    pub block_bitmap: Option<Bitmap>,
    /// In-memory inode allocation bitmap, loaded on demand.
    pub inode_bitmap: Option<Bitmap>,
    /// log2 of blocks per cluster (BIGALLOC).
    pub cluster_ratio_bits: u32,
    /// Small generation-checked inode cache.
    pub(crate) icache: Option<InodeCache>,
    /// Seed for crc32c metadata checksums.
    pub checksum_seed: u32,
    /// Wall-clock source for inode timestamps, installed at mount.
    pub clock: fn() -> u32,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("mflags", &self.mflags)
            .field("flags", &self.flags)
            .field("blksize", &self.blksize)
            .finish()
    }
}

impl Ext2Fs {
    /// Opens a filesystem on `dev`, validating the superblock and feature
    /// masks and loading the group descriptor table.
    pub fn open(dev: Arc<dyn BlockDevice>, mut mflags: MountFlags) -> Result<Self> {
        let mut buf = [0u8; 1024];
        read_exact(dev.as_ref(), &mut buf, EXT2_SUPER_OFFSET)?;
        let sb: Superblock = read_struct(&buf);
        if sb.s_magic != EXT2_MAGIC {
            return Err(Errno::EINVAL);
        }
        if sb.incompat().contains(FeatureIncompat::JOURNAL_DEV) {
            return Err(Errno::ENOTSUP);
        }
        if !INCOMPAT_SUPPORTED.contains(sb.incompat()) {
            return Err(Errno::ENOTSUP);
        }
        if !RO_COMPAT_SUPPORTED.contains(sb.ro_compat()) {
            return Err(Errno::ENOTSUP);
        }
        if sb.s_log_block_size > 6 || sb.s_blocks_per_group == 0 || sb.s_inodes_per_group == 0 {
            return Err(Errno::EUCLEAN);
        }

        // Journalled filesystems are mounted read-only; the journal is
        // never replayed. Fast commit only affects read paths we ignore.
        if sb.compat().contains(FeatureCompat::HAS_JOURNAL)
            || sb.incompat().contains(FeatureIncompat::RECOVER)
            || sb.ro_compat().contains(FeatureRoCompat::READONLY)
        {
            mflags |= MountFlags::RDONLY;
        }

        let checksum_seed = if sb.incompat().contains(FeatureIncompat::CSUM_SEED) {
            sb.s_checksum_seed
        } else if sb.has_metadata_csum() || sb.has_group_desc_csum() {
            checksum::crc32c(!0, &sb.s_uuid)
        } else {
            0
        };

        let blksize = sb.block_size();
        let blocks = sb.blocks_count();
        let group_desc_count = ((blocks - sb.s_first_data_block as u64
            + sb.s_blocks_per_group as u64
            - 1)
            / sb.s_blocks_per_group as u64) as u32;
        let desc_blocks =
            (group_desc_count as u64 + sb.desc_per_block() as u64 - 1) / sb.desc_per_block() as u64;
        let inode_blocks_per_group = (sb.s_inodes_per_group * sb.inode_size()).div_ceil(blksize);
        let cluster_ratio_bits = sb.s_log_cluster_size - sb.s_log_block_size;

        let mut flags = FsFlags::empty();
        if sb.s_state & EXT2_STATE_VALID != 0 {
            flags |= FsFlags::VALID;
        }
        if sb.has_wide() {
            flags |= FsFlags::WIDE;
        }

        let mut fs = Self {
            dev,
            sb,
            mflags,
            flags,
            blksize,
            group_desc_count,
            desc_blocks,
            group_desc: Vec::new(),
            inode_blocks_per_group,
            block_bitmap: None,
            inode_bitmap: None,
            cluster_ratio_bits,
            icache: None,
            checksum_seed,
            clock: || 0,
        };
        if fs.sb.has_metadata_csum() && !fs.superblock_checksum_valid() {
            return Err(Errno::EUCLEAN);
        }
        fs.load_group_desc()?;
        Ok(fs)
    }

    /// Releases the instance, flushing dirty state first on r/w mounts.
    pub fn close(&mut self) -> Result<()> {
        if !self.mflags.contains(MountFlags::RDONLY)
            && self
                .flags
                .intersects(FsFlags::DIRTY | FsFlags::BB_DIRTY | FsFlags::IB_DIRTY)
        {
            self.flush(FLUSH_VALID)?;
        }
        Ok(())
    }

    fn load_group_desc(&mut self) -> Result<()> {
        let mut table = vec![0u8; (self.desc_blocks * self.blksize as u64) as usize];
        for i in 0..self.desc_blocks {
            let block = self.descriptor_block(self.sb.s_first_data_block as u64, i as u32);
            let start = (i * self.blksize as u64) as usize;
            let end = start + self.blksize as usize;
            self.read_blocks(&mut table[start..end], block, 1)?;
        }
        table.truncate(self.group_desc_count as usize * self.sb.desc_size() as usize);
        self.group_desc = table;
        Ok(())
    }

    /// Reads `count` filesystem blocks starting at `block`.
    pub fn read_blocks(&self, buf: &mut [u8], block: u64, count: u32) -> Result<()> {
        let len = count as usize * self.blksize as usize;
        if buf.len() < len {
            return Err(Errno::EINVAL);
        }
        read_exact(
            self.dev.as_ref(),
            &mut buf[..len],
            block * self.blksize as u64,
        )
    }

    /// Writes `count` filesystem blocks starting at `block`.
    pub fn write_blocks(&mut self, buf: &[u8], block: u64, count: u32) -> Result<()> {
        if self.mflags.contains(MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let len = count as usize * self.blksize as usize;
        if buf.len() < len {
            return Err(Errno::EINVAL);
        }
        write_exact(self.dev.as_ref(), &buf[..len], block * self.blksize as u64)
    }

    // ── Group geometry ──────────────────────────────────────────────

    /// First block of `group`.
    pub fn group_first_block(&self, group: u32) -> u64 {
        self.sb.s_first_data_block as u64 + self.sb.s_blocks_per_group as u64 * group as u64
    }

    /// Last block of `group`.
    pub fn group_last_block(&self, group: u32) -> u64 {
        if group == self.group_desc_count - 1 {
            self.sb.blocks_count() - 1
        } else {
            self.group_first_block(group) + self.sb.s_blocks_per_group as u64 - 1
        }
    }

    /// Number of blocks in `group` (the last group may be short).
    pub fn group_blocks_count(&self, group: u32) -> u64 {
        if group == self.group_desc_count - 1 {
            let rem = (self.sb.blocks_count() - self.sb.s_first_data_block as u64)
                % self.sb.s_blocks_per_group as u64;
            if rem == 0 {
                self.sb.s_blocks_per_group as u64
            } else {
                rem
            }
        } else {
            self.sb.s_blocks_per_group as u64
        }
    }

    /// Group containing `block`.
    pub fn group_of_block(&self, block: u64) -> u32 {
        ((block - self.sb.s_first_data_block as u64) / self.sb.s_blocks_per_group as u64) as u32
    }

    /// Group containing `ino`.
    pub fn group_of_inode(&self, ino: u32) -> u32 {
        (ino - 1) / self.sb.s_inodes_per_group
    }

    /// Blocks per allocation cluster.
    pub fn cluster_ratio(&self) -> u64 {
        1 << self.cluster_ratio_bits
    }

    /// Mask of the in-cluster block bits.
    pub fn cluster_mask(&self) -> u64 {
        self.cluster_ratio() - 1
    }

    /// Converts a block number to a cluster number.
    pub fn b2c(&self, block: u64) -> u64 {
        block >> self.cluster_ratio_bits
    }

    // ── Group descriptors ───────────────────────────────────────────

    /// Copy of the descriptor for `group`; missing 64-bit halves read zero.
    pub fn desc(&self, group: u32) -> GroupDesc {
        let size = self.sb.desc_size() as usize;
        let off = group as usize * size;
        let mut raw = [0u8; core::mem::size_of::<GroupDesc>()];
        let take = size.min(raw.len());
        raw[..take].copy_from_slice(&self.group_desc[off..off + take]);
        read_struct(&raw)
    }

    /// Writes back the descriptor for `group` (truncated to the on-disk
    /// descriptor size).
    pub fn set_desc(&mut self, group: u32, desc: &GroupDesc) {
        let size = self.sb.desc_size() as usize;
        let off = group as usize * size;
        let bytes = struct_bytes(desc);
        let take = size.min(bytes.len());
        self.group_desc[off..off + take].copy_from_slice(&bytes[..take]);
    }

    /// Raw descriptor bytes for `group` (exactly `desc_size` long).
    pub fn desc_bytes(&self, group: u32) -> &[u8] {
        let size = self.sb.desc_size() as usize;
        &self.group_desc[group as usize * size..(group as usize + 1) * size]
    }

    /// Tests descriptor flags.
    pub fn bg_test_flags(&self, group: u32, flags: BgFlags) -> bool {
        self.desc(group).bg_flags & flags.bits() != 0
    }

    /// Clears descriptor flags.
    pub fn bg_clear_flags(&mut self, group: u32, flags: BgFlags) {
        let mut desc = self.desc(group);
        desc.bg_flags &= !flags.bits();
        self.set_desc(group, &desc);
    }

    /// Location of the block bitmap of `group`.
    pub fn block_bitmap_loc(&self, group: u32) -> u64 {
        let desc = self.desc(group);
        let mut loc = desc.bg_block_bitmap as u64;
        if self.sb.has_wide() {
            loc |= (desc.bg_block_bitmap_hi as u64) << 32;
        }
        loc
    }

    /// Location of the inode bitmap of `group`.
    pub fn inode_bitmap_loc(&self, group: u32) -> u64 {
        let desc = self.desc(group);
        let mut loc = desc.bg_inode_bitmap as u64;
        if self.sb.has_wide() {
            loc |= (desc.bg_inode_bitmap_hi as u64) << 32;
        }
        loc
    }

    /// Location of the inode table of `group`.
    pub fn inode_table_loc(&self, group: u32) -> u64 {
        let desc = self.desc(group);
        let mut loc = desc.bg_inode_table as u64;
        if self.sb.has_wide() {
            loc |= (desc.bg_inode_table_hi as u64) << 32;
        }
        loc
    }

    /// Free blocks recorded in the descriptor of `group`.
    pub fn bg_free_blocks_count(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut count = desc.bg_free_blocks_count as u32;
        if self.sb.has_wide() {
            count |= (desc.bg_free_blocks_count_hi as u32) << 16;
        }
        count
    }

    /// Sets the descriptor free-block count of `group`.
    pub fn bg_free_blocks_count_set(&mut self, group: u32, blocks: u32) {
        let mut desc = self.desc(group);
        desc.bg_free_blocks_count = blocks as u16;
        if self.sb.has_wide() {
            desc.bg_free_blocks_count_hi = (blocks >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Free inodes recorded in the descriptor of `group`.
    pub fn bg_free_inodes_count(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut count = desc.bg_free_inodes_count as u32;
        if self.sb.has_wide() {
            count |= (desc.bg_free_inodes_count_hi as u32) << 16;
        }
        count
    }

    /// Sets the descriptor free-inode count of `group`.
    pub fn bg_free_inodes_count_set(&mut self, group: u32, inodes: u32) {
        let mut desc = self.desc(group);
        desc.bg_free_inodes_count = inodes as u16;
        if self.sb.has_wide() {
            desc.bg_free_inodes_count_hi = (inodes >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Used-directory count of `group`.
    pub fn bg_used_dirs_count(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut count = desc.bg_used_dirs_count as u32;
        if self.sb.has_wide() {
            count |= (desc.bg_used_dirs_count_hi as u32) << 16;
        }
        count
    }

    /// Sets the used-directory count of `group`.
    pub fn bg_used_dirs_count_set(&mut self, group: u32, dirs: u32) {
        let mut desc = self.desc(group);
        desc.bg_used_dirs_count = dirs as u16;
        if self.sb.has_wide() {
            desc.bg_used_dirs_count_hi = (dirs >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Unused inode-table entries at the tail of `group`.
    pub fn bg_itable_unused(&self, group: u32) -> u32 {
        let desc = self.desc(group);
        let mut count = desc.bg_itable_unused as u32;
        if self.sb.has_wide() {
            count |= (desc.bg_itable_unused_hi as u32) << 16;
        }
        count
    }

    /// Sets the unused inode-table tail of `group`.
    pub fn bg_itable_unused_set(&mut self, group: u32, unused: u32) {
        let mut desc = self.desc(group);
        desc.bg_itable_unused = unused as u16;
        if self.sb.has_wide() {
            desc.bg_itable_unused_hi = (unused >> 16) as u16;
        }
        self.set_desc(group, &desc);
    }

    /// Whether `group` carries a (backup) superblock.
    pub fn bg_has_super(&self, group: u32) -> bool {
        fn test_root(mut group: u32, x: u32) -> bool {
            loop {
                if group < x {
                    return false;
                }
                if group == x {
                    return true;
                }
                if group % x != 0 {
                    return false;
                }
                group /= x;
            }
        }
        if group == 0 {
            return true;
        }
        if self
            .sb
            .ro_compat()
            .contains(FeatureRoCompat::SPARSE_SUPER)
        {
            return group == self.sb.s_backup_bgs[0] || group == self.sb.s_backup_bgs[1];
        }
        if group <= 1 {
            return true;
        }
        if group & 1 == 0 {
            return false;
        }
        test_root(group, 3) || test_root(group, 5) || test_root(group, 7)
    }

    /// Computes the superblock/descriptor layout of `group`.
    ///
    /// Returns `(super_block, old_desc_block, new_desc_block, used_blocks)`.
    pub fn super_bgd_loc(&self, group: u32) -> (u64, u64, u64, u64) {
        let mut group_block = self.group_first_block(group);
        if group_block == 0 && self.blksize == 1024 {
            group_block = 1;
        }
        let old_desc_blocks = if self.sb.incompat().contains(FeatureIncompat::META_BG) {
            self.sb.s_first_meta_bg as u64
        } else {
            self.desc_blocks + self.sb.s_reserved_gdt_blocks as u64
        };

        let mut super_block = 0;
        let mut old_desc_block = 0;
        let mut new_desc_block = 0;
        let mut used = 0u64;

        let has_super = self.bg_has_super(group);
        if has_super {
            super_block = group_block;
            used += 1;
        }
        let meta_bg_size = self.sb.desc_per_block() as u64;
        let meta_bg = group as u64 / meta_bg_size;
        if !self.sb.incompat().contains(FeatureIncompat::META_BG)
            || meta_bg < self.sb.s_first_meta_bg as u64
        {
            if has_super {
                old_desc_block = group_block + 1;
                used += old_desc_blocks;
            }
        } else if group as u64 % meta_bg_size == 0
            || group as u64 % meta_bg_size == 1
            || group as u64 % meta_bg_size == meta_bg_size - 1
        {
            new_desc_block = group_block + u64::from(has_super);
            used += 1;
        }
        (super_block, old_desc_block, new_desc_block, used)
    }

    /// Block holding descriptor-table block `i`, honouring META_BG and the
    /// 1 KiB-block group-zero quirk.
    pub fn descriptor_block(&self, group_block: u64, i: u32) -> u64 {
        let group_zero_adjust =
            u64::from(i == 0 && self.blksize == 1024 && self.cluster_ratio() > 1);

        if !self.sb.incompat().contains(FeatureIncompat::META_BG)
            || (i as u64) < self.sb.s_first_meta_bg as u64
        {
            return group_block + group_zero_adjust + i as u64 + 1;
        }

        let bg = self.sb.desc_per_block() * i;
        let mut has_super = u64::from(self.bg_has_super(bg));
        let mut block = self.group_first_block(bg);
        if group_block != self.sb.s_first_data_block as u64
            && block + has_super + (self.sb.s_blocks_per_group as u64) < self.sb.blocks_count()
        {
            block += self.sb.s_blocks_per_group as u64;
            has_super = u64::from(self.bg_has_super(bg + 1));
        }
        block + has_super + group_zero_adjust
    }

    // ── Flushing ────────────────────────────────────────────────────

    /// Writes a backup superblock into `group` at `group_block`.
    pub fn write_backup_superblock(&mut self, group: u32, group_block: u64) -> Result<()> {
        let mut shadow = self.sb.clone();
        shadow.s_block_group_nr = group.min(65535) as u16;
        self.superblock_checksum_update(&mut shadow);
        let bytes = struct_bytes(&shadow);
        if self.mflags.contains(MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        write_exact(self.dev.as_ref(), bytes, group_block * self.blksize as u64)
    }

    /// Writes the primary superblock at its fixed offset.
    pub fn write_primary_superblock(&mut self) -> Result<()> {
        if self.mflags.contains(MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let bytes = struct_bytes(&self.sb).to_vec();
        write_exact(self.dev.as_ref(), &bytes, EXT2_SUPER_OFFSET)
    }

    /// Flushes bitmaps, group descriptors, backup superblocks and the
    /// primary superblock.
    pub fn flush(&mut self, flags: u32) -> Result<()> {
        if self.sb.s_magic != EXT2_MAGIC {
            return Err(Errno::EUCLEAN);
        }
        let state = self.sb.s_state;
        self.sb.s_block_group_nr = 0;
        self.sb.s_state &= !EXT2_STATE_VALID;
        self.sb.s_feature_incompat &= !FeatureIncompat::RECOVER.bits();

        self.write_bitmaps()?;

        let old_desc_blocks = if self.sb.incompat().contains(FeatureIncompat::META_BG) {
            (self.sb.s_first_meta_bg as u64).min(self.desc_blocks)
        } else {
            self.desc_blocks
        };

        // Descriptor bytes are padded out to whole blocks for the write.
        let mut desc_table = self.group_desc.clone();
        desc_table.resize((self.desc_blocks * self.blksize as u64) as usize, 0);

        for group in 0..self.group_desc_count {
            let (super_block, old_desc_block, new_desc_block, _) = self.super_bgd_loc(group);
            if group > 0 && super_block != 0 {
                self.write_backup_superblock(group, super_block)?;
            }
            if old_desc_block != 0 {
                self.write_blocks(&desc_table, old_desc_block, old_desc_blocks as u32)?;
            }
            if new_desc_block != 0 {
                let meta_bg = (group / self.sb.desc_per_block()) as usize;
                let start = meta_bg * self.blksize as usize;
                self.write_blocks(
                    &desc_table[start..start + self.blksize as usize],
                    new_desc_block,
                    1,
                )?;
            }
        }

        self.sb.s_block_group_nr = 0;
        self.sb.s_state = state;
        if flags & FLUSH_VALID != 0 {
            self.sb.s_state |= EXT2_STATE_VALID;
        }
        let mut shadow = self.sb.clone();
        self.superblock_checksum_update(&mut shadow);
        self.sb = shadow;
        self.write_primary_superblock()?;
        self.flags &= !FsFlags::DIRTY;
        Ok(())
    }
}

/// `flush` flag: mark the filesystem state valid afterwards.
pub const FLUSH_VALID: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_disk_format() {
        assert_eq!(core::mem::size_of::<Superblock>(), 1024);
        assert_eq!(core::mem::size_of::<GroupDesc>(), 64);
        assert_eq!(core::mem::size_of::<Ext2Inode>(), 128);
        assert_eq!(core::mem::offset_of!(Superblock, s_magic), 56);
        assert_eq!(core::mem::offset_of!(Superblock, s_checksum), 1020);
        assert_eq!(core::mem::offset_of!(GroupDesc, bg_checksum), BG_CHECKSUM_OFFSET);
    }

    #[test]
    fn open_validates_magic_and_features() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let fs = Ext2Fs::open(img.clone(), MountFlags::empty()).unwrap();
        assert_eq!(fs.blksize, 1024);
        assert_eq!(fs.group_desc_count, 1);

        // Corrupt the magic; open must fail.
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&0x1234u16.to_le_bytes());
        img.write(&buf, EXT2_SUPER_OFFSET + 56).unwrap();
        assert_eq!(
            Ext2Fs::open(img.clone(), MountFlags::empty()).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn unsupported_incompat_bit_refuses_mount() {
        let img = testfs::mkfs_basic(1024 * 1024);
        // Turn on COMPRESSION (bit 0), which is outside the allow list.
        let mut fs = Ext2Fs::open(img.clone(), MountFlags::empty()).unwrap();
        fs.sb.s_feature_incompat |= FeatureIncompat::COMPRESSION.bits();
        fs.write_primary_superblock().unwrap();
        assert_eq!(
            Ext2Fs::open(img, MountFlags::empty()).unwrap_err(),
            Errno::ENOTSUP
        );
    }

    #[test]
    fn journal_forces_read_only() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = Ext2Fs::open(img.clone(), MountFlags::empty()).unwrap();
        fs.sb.s_feature_compat |= FeatureCompat::HAS_JOURNAL.bits();
        fs.write_primary_superblock().unwrap();
        let fs = Ext2Fs::open(img, MountFlags::empty()).unwrap();
        assert!(fs.mflags.contains(MountFlags::RDONLY));
    }

    #[test]
    fn group_zero_always_has_super() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let fs = Ext2Fs::open(img, MountFlags::empty()).unwrap();
        assert!(fs.bg_has_super(0));
    }

    #[test]
    fn power_of_357_backup_groups() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let fs = Ext2Fs::open(img, MountFlags::empty()).unwrap();
        // Without SPARSE_SUPER: group 1 and powers of 3, 5, 7 qualify.
        for g in [1u32, 3, 5, 7, 9, 25, 27, 49] {
            assert!(fs.bg_has_super(g), "group {g}");
        }
        for g in [2u32, 4, 6, 8, 10, 12, 15, 21] {
            assert!(!fs.bg_has_super(g), "group {g}");
        }
    }
}
