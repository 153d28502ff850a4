//! Inode table I/O and in-core inode bookkeeping.
//!
//! Inode records are read through a small cache: one buffered inode-table
//! block plus a handful of decoded records. A slot is only published once
//! the record's checksum validates, so a corrupt table never serves hits.

use alloc::vec;
use alloc::vec::Vec;

use pml_core::{Errno, Result};

use crate::{read_struct, struct_bytes, Ext2Fs, FeatureRoCompat, FsFlags, EXT2_N_BLOCKS};

/// Inode flag: file data is extent-mapped.
pub const EXT4_EXTENTS_FL: u32 = 1 << 19;
/// Inode flag: blocks counted in filesystem blocks, not sectors.
pub const EXT4_HUGE_FILE_FL: u32 = 1 << 18;
/// Inode flag: data stored inline in the inode.
pub const EXT4_INLINE_DATA_FL: u32 = 1 << 28;
/// Inode flag: hashed directory index.
pub const EXT2_INDEX_FL: u32 = 1 << 12;

/// On-disk inode (classic 128-byte record, Linux osd fields).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Ext2Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_version: u32,
    pub i_block: [u32; EXT2_N_BLOCKS],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_size_high: u32,
    pub i_faddr: u32,
    pub i_blocks_hi: u16,
    pub i_file_acl_hi: u16,
    pub i_uid_high: u16,
    pub i_gid_high: u16,
    pub i_checksum_lo: u16,
    pub i_reserved: u16,
}

impl Default for Ext2Inode {
    fn default() -> Self {
        // SAFETY: All fields are integers; zero is a valid representation.
        unsafe { core::mem::zeroed() }
    }
}

impl Ext2Inode {
    /// Full file size including the high half.
    pub fn size(&self) -> u64 {
        self.i_size as u64 | ((self.i_size_high as u64) << 32)
    }

    /// Whether the inode is extent-mapped.
    pub fn uses_extents(&self) -> bool {
        self.i_flags & EXT4_EXTENTS_FL != 0
    }

    /// Whether this is a fast symlink with the target inside `i_block`.
    pub fn is_inline_symlink(&self) -> bool {
        pml_fs::mode::is_lnk(self.i_mode as u32) && self.size() < 60
    }
}

/// The extended inode record used when `s_inode_size` exceeds 128 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LargeInode {
    pub base: Ext2Inode,
    pub i_extra_isize: u16,
    pub i_checksum_hi: u16,
    pub i_ctime_extra: u32,
    pub i_mtime_extra: u32,
    pub i_atime_extra: u32,
    pub i_crtime: u32,
    pub i_crtime_extra: u32,
    pub i_version_hi: u32,
    pub i_projid: u32,
}

/// Number of decoded records the cache keeps.
const INODE_CACHE_SIZE: usize = 4;

struct CacheEntry {
    ino: u32,
    raw: Vec<u8>,
}

/// Small LRU-ish inode cache: one buffered table block plus decoded slots.
pub struct InodeCache {
    buffer: Vec<u8>,
    block: u64,
    cache_last: usize,
    entries: Vec<CacheEntry>,
}

impl InodeCache {
    fn new(blksize: usize, inode_size: usize) -> Self {
        let mut entries = Vec::with_capacity(INODE_CACHE_SIZE);
        for _ in 0..INODE_CACHE_SIZE {
            entries.push(CacheEntry {
                ino: 0,
                raw: vec![0u8; inode_size],
            });
        }
        Self {
            buffer: vec![0u8; blksize],
            block: 0,
            cache_last: INODE_CACHE_SIZE - 1,
            entries,
        }
    }

    /// Invalidates every slot and the buffered block.
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            entry.ino = 0;
        }
        self.block = 0;
    }
}

impl Ext2Fs {
    fn ensure_icache(&mut self) {
        if self.icache.is_none() {
            self.icache = Some(InodeCache::new(
                self.blksize as usize,
                self.sb.inode_size() as usize,
            ));
        }
    }

    /// Drops all cached inode records.
    pub fn flush_inode_cache(&mut self) {
        if let Some(cache) = self.icache.as_mut() {
            cache.flush();
        }
    }

    /// Locates the inode record: `(first block, offset in block)`.
    fn inode_location(&self, ino: u32) -> Result<(u64, usize)> {
        let group = (ino - 1) / self.sb.s_inodes_per_group;
        if group >= self.group_desc_count {
            return Err(Errno::EINVAL);
        }
        let offset = ((ino - 1) % self.sb.s_inodes_per_group) as u64
            * self.sb.inode_size() as u64;
        let block = offset >> self.sb.block_size_bits();
        let table = self.inode_table_loc(group);
        if table == 0
            || table < self.sb.s_first_data_block as u64
            || table + self.inode_blocks_per_group as u64 - 1 >= self.sb.blocks_count()
        {
            return Err(Errno::EUCLEAN);
        }
        Ok((table + block, (offset & (self.blksize as u64 - 1)) as usize))
    }

    /// Reads the raw inode record, spanning table blocks as needed.
    fn read_inode_raw(&mut self, ino: u32) -> Result<Vec<u8>> {
        let isize = self.sb.inode_size() as usize;
        let (mut blockno, mut offset) = self.inode_location(ino)?;
        let mut raw = vec![0u8; isize];
        let mut done = 0;
        while done < isize {
            let take = isize.min(done + self.blksize as usize - offset) - done;
            let cached_block = self.icache.as_ref().map(|c| c.block);
            if cached_block != Some(blockno) {
                let mut buf = vec![0u8; self.blksize as usize];
                self.read_blocks(&mut buf, blockno, 1)?;
                let cache = self.icache.as_mut().ok_or(Errno::EUCLEAN)?;
                cache.buffer = buf;
                cache.block = blockno;
            }
            let cache = self.icache.as_ref().ok_or(Errno::EUCLEAN)?;
            raw[done..done + take].copy_from_slice(&cache.buffer[offset..offset + take]);
            done += take;
            offset = 0;
            blockno += 1;
        }
        Ok(raw)
    }

    /// Writes a raw inode record back to the table.
    fn write_inode_raw(&mut self, ino: u32, raw: &[u8]) -> Result<()> {
        let isize = self.sb.inode_size() as usize;
        let (mut blockno, mut offset) = self.inode_location(ino)?;
        let mut done = 0;
        while done < isize {
            let take = isize.min(done + self.blksize as usize - offset) - done;
            let cached_block = self.icache.as_ref().map(|c| c.block);
            if cached_block != Some(blockno) {
                let mut buf = vec![0u8; self.blksize as usize];
                self.read_blocks(&mut buf, blockno, 1)?;
                let cache = self.icache.as_mut().ok_or(Errno::EUCLEAN)?;
                cache.buffer = buf;
                cache.block = blockno;
            }
            let cache = self.icache.as_mut().ok_or(Errno::EUCLEAN)?;
            cache.buffer[offset..offset + take].copy_from_slice(&raw[done..done + take]);
            let buf = cache.buffer.clone();
            self.write_blocks(&buf, blockno, 1)?;
            done += take;
            offset = 0;
            blockno += 1;
        }
        Ok(())
    }

    /// Reads an inode, consulting the cache first.
    ///
    /// A record whose checksum fails is `EUCLEAN` unless it is all zero.
    pub fn read_inode(&mut self, ino: u32) -> Result<Ext2Inode> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(Errno::EINVAL);
        }
        self.ensure_icache();
        if let Some(cache) = self.icache.as_ref() {
            for entry in &cache.entries {
                if entry.ino == ino {
                    return Ok(read_struct(&entry.raw));
                }
            }
        }

        let raw = self.read_inode_raw(ino)?;
        let csum_valid = self.inode_checksum_valid(ino, &raw);
        if csum_valid {
            let cache = self.icache.as_mut().ok_or(Errno::EUCLEAN)?;
            let slot = (cache.cache_last + 1) % INODE_CACHE_SIZE;
            cache.cache_last = slot;
            cache.entries[slot].ino = ino;
            cache.entries[slot].raw.copy_from_slice(&raw);
            Ok(read_struct(&raw))
        } else {
            Err(Errno::EUCLEAN)
        }
    }

    /// Writes an inode back with a fresh checksum.
    ///
    /// The extra-isize area beyond the classic record is preserved.
    pub fn update_inode(&mut self, ino: u32, inode: &Ext2Inode) -> Result<()> {
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(Errno::EINVAL);
        }
        self.ensure_icache();
        let isize = self.sb.inode_size() as usize;
        let mut raw = if isize > core::mem::size_of::<Ext2Inode>() {
            self.read_inode_raw(ino)?
        } else {
            vec![0u8; isize]
        };
        raw[..core::mem::size_of::<Ext2Inode>()].copy_from_slice(struct_bytes(inode));
        self.inode_checksum_update(ino, &mut raw);

        if let Some(cache) = self.icache.as_mut() {
            for entry in &mut cache.entries {
                if entry.ino == ino {
                    entry.raw.copy_from_slice(&raw);
                    break;
                }
            }
        }
        self.write_inode_raw(ino, &raw)?;
        self.flags |= FsFlags::CHANGED;
        Ok(())
    }

    /// Writes a freshly created inode, stamping creation times and the
    /// extra-isize header when the record is large.
    pub fn write_new_inode(&mut self, ino: u32, inode: &mut Ext2Inode) -> Result<()> {
        let now = (self.clock)();
        if inode.i_ctime == 0 {
            inode.i_ctime = now;
        }
        if inode.i_mtime == 0 {
            inode.i_mtime = now;
        }
        if inode.i_atime == 0 {
            inode.i_atime = now;
        }

        let isize = self.sb.inode_size() as usize;
        if isize == core::mem::size_of::<Ext2Inode>() {
            return self.update_inode(ino, inode);
        }
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        self.ensure_icache();
        let mut raw = vec![0u8; isize];
        raw[..core::mem::size_of::<Ext2Inode>()].copy_from_slice(struct_bytes(inode));
        let extra = (core::mem::size_of::<LargeInode>() - core::mem::size_of::<Ext2Inode>()) as u16;
        raw[128..130].copy_from_slice(&extra.to_le_bytes());
        // crtime defaults to ctime for fresh inodes.
        raw[144..148].copy_from_slice(&inode.i_ctime.to_le_bytes());
        self.inode_checksum_update(ino, &mut raw);
        if let Some(cache) = self.icache.as_mut() {
            for entry in &mut cache.entries {
                if entry.ino == ino {
                    entry.raw.copy_from_slice(&raw);
                    break;
                }
            }
        }
        self.write_inode_raw(ino, &raw)?;
        self.flags |= FsFlags::CHANGED;
        Ok(())
    }

    /// Adds `nblocks` filesystem blocks to `i_blocks` (512-byte units
    /// unless `HUGE_FILE_FL` changes the scale).
    pub fn iblk_add_blocks(&self, inode: &mut Ext2Inode, nblocks: u64) -> Result<()> {
        let huge = self.sb.ro_compat().contains(FeatureRoCompat::HUGE_FILE);
        let mut b = inode.i_blocks as u64;
        if huge {
            b |= (inode.i_blocks_hi as u64) << 32;
        }
        let mut nblocks = nblocks;
        if !huge || inode.i_flags & EXT4_HUGE_FILE_FL == 0 {
            nblocks *= self.blksize as u64 / 512;
        }
        nblocks *= self.cluster_ratio();
        b += nblocks;
        if huge {
            inode.i_blocks_hi = (b >> 32) as u16;
        } else if b > u32::MAX as u64 {
            return Err(Errno::EOVERFLOW);
        }
        inode.i_blocks = b as u32;
        Ok(())
    }

    /// Subtracts `nblocks` filesystem blocks from `i_blocks`.
    pub fn iblk_sub_blocks(&self, inode: &mut Ext2Inode, nblocks: u64) -> Result<()> {
        let huge = self.sb.ro_compat().contains(FeatureRoCompat::HUGE_FILE);
        let mut b = inode.i_blocks as u64;
        if huge {
            b |= (inode.i_blocks_hi as u64) << 32;
        }
        let mut nblocks = nblocks;
        if !huge || inode.i_flags & EXT4_HUGE_FILE_FL == 0 {
            nblocks *= self.blksize as u64 / 512;
        }
        nblocks *= self.cluster_ratio();
        if nblocks > b {
            return Err(Errno::EOVERFLOW);
        }
        b -= nblocks;
        if huge {
            inode.i_blocks_hi = (b >> 32) as u16;
        }
        inode.i_blocks = b as u32;
        Ok(())
    }

    /// Sets `i_blocks` outright.
    pub fn iblk_set(&self, inode: &mut Ext2Inode, nblocks: u64) -> Result<()> {
        let huge = self.sb.ro_compat().contains(FeatureRoCompat::HUGE_FILE);
        let mut nblocks = nblocks;
        if !huge || inode.i_flags & EXT4_HUGE_FILE_FL == 0 {
            nblocks *= self.blksize as u64 / 512;
        }
        nblocks *= self.cluster_ratio();
        inode.i_blocks = nblocks as u32;
        if huge {
            inode.i_blocks_hi = (nblocks >> 32) as u16;
        } else if nblocks >> 32 != 0 {
            return Err(Errno::EOVERFLOW);
        }
        Ok(())
    }

    /// Stores a file size into the inode, turning on `LARGE_FILE` /
    /// `LARGEDIR` when the size crosses 2 GiB.
    pub fn inode_set_size(&mut self, inode: &mut Ext2Inode, size: u64) -> Result<()> {
        if size >= 0x8000_0000 {
            let mut dirty_sb = false;
            if pml_fs::mode::is_reg(inode.i_mode as u32) {
                if !self.sb.ro_compat().contains(FeatureRoCompat::LARGE_FILE) {
                    self.sb.s_feature_ro_compat |= FeatureRoCompat::LARGE_FILE.bits();
                    dirty_sb = true;
                }
            } else if pml_fs::mode::is_dir(inode.i_mode as u32) {
                if !self
                    .sb
                    .incompat()
                    .contains(crate::FeatureIncompat::LARGEDIR)
                {
                    self.sb.s_feature_incompat |= crate::FeatureIncompat::LARGEDIR.bits();
                    dirty_sb = true;
                }
            } else {
                return Err(Errno::EFBIG);
            }
            if dirty_sb {
                self.sb.update_revision();
                self.flags |= FsFlags::DIRTY | FsFlags::CHANGED;
            }
        }
        inode.i_size = size as u32;
        inode.i_size_high = (size >> 32) as u32;
        Ok(())
    }

    /// Picks an allocation goal block for `ino` near `block`.
    pub fn find_inode_goal(&mut self, ino: u32, inode: Option<&Ext2Inode>, block: u64) -> u64 {
        if let Some(inode) = inode {
            if !inode.is_inline_symlink() && inode.i_flags & EXT4_INLINE_DATA_FL == 0 {
                if inode.uses_extents() {
                    let mut inode_copy = *inode;
                    if let Ok(mut handle) =
                        crate::extent::ExtentHandle::open(self, ino, &mut inode_copy)
                    {
                        if handle.goto_block(self, 0, block).is_ok() {
                            if let Ok(extent) =
                                handle.get(self, crate::extent::ExtentOp::Current)
                            {
                                return extent.e_pblk + block - extent.e_lblk;
                            }
                        }
                    }
                } else if inode.i_block[0] != 0 {
                    return inode.i_block[0] as u64;
                }
            }
        }
        let log_flex = self.sb.s_log_groups_per_flex;
        let mut group = self.group_of_inode(ino);
        if log_flex != 0 {
            group &= !((1 << log_flex) - 1);
        }
        self.group_first_block(group)
    }

    /// Whether a logical block offset exceeds what the mapping scheme can
    /// address.
    pub fn file_block_offset_too_big(&self, inode: &Ext2Inode, offset: u64) -> bool {
        if offset >= (1u64 << 32) - 1 {
            return true;
        }
        if inode.uses_extents() {
            return false;
        }
        let addr_per_block = self.blksize as u64 / 4;
        let max = 12 + addr_per_block + addr_per_block * addr_per_block
            + addr_per_block * addr_per_block * addr_per_block;
        offset >= max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use pml_fs::MountFlags;

    #[test]
    fn inode_struct_layout() {
        assert_eq!(core::mem::size_of::<Ext2Inode>(), 128);
        assert_eq!(core::mem::size_of::<LargeInode>(), 160);
        assert_eq!(core::mem::offset_of!(Ext2Inode, i_generation), 100);
        assert_eq!(core::mem::offset_of!(Ext2Inode, i_checksum_lo), 124);
    }

    #[test]
    fn read_root_inode() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let root = fs.read_inode(crate::EXT2_ROOT_INO).unwrap();
        assert!(pml_fs::mode::is_dir(root.i_mode as u32));
        assert_eq!(root.i_links_count, 2);
        // Second read hits the cache and agrees.
        let again = fs.read_inode(crate::EXT2_ROOT_INO).unwrap();
        assert_eq!(again.i_block[0], root.i_block[0]);
    }

    #[test]
    fn update_inode_roundtrip() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img.clone(), MountFlags::empty()).unwrap();
        let mut root = fs.read_inode(crate::EXT2_ROOT_INO).unwrap();
        root.i_mtime = 0x1234_5678;
        fs.update_inode(crate::EXT2_ROOT_INO, &root).unwrap();
        // Reopen from scratch; the change persisted.
        let mut fs2 = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let root2 = fs2.read_inode(crate::EXT2_ROOT_INO).unwrap();
        assert_eq!(root2.i_mtime, 0x1234_5678);
    }

    #[test]
    fn invalid_ino_rejected() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        assert_eq!(fs.read_inode(0).unwrap_err(), pml_core::Errno::EINVAL);
        assert_eq!(
            fs.read_inode(fs.sb.s_inodes_count + 1).unwrap_err(),
            pml_core::Errno::EINVAL
        );
    }

    #[test]
    fn iblk_accounting() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let mut inode = Ext2Inode::default();
        fs.iblk_add_blocks(&mut inode, 3).unwrap();
        // 1024-byte blocks count as two 512-byte sectors each.
        assert_eq!(inode.i_blocks, 6);
        fs.iblk_sub_blocks(&mut inode, 1).unwrap();
        assert_eq!(inode.i_blocks, 4);
        assert_eq!(
            fs.iblk_sub_blocks(&mut inode, 10).unwrap_err(),
            pml_core::Errno::EOVERFLOW
        );
        fs.iblk_set(&mut inode, 5).unwrap();
        assert_eq!(inode.i_blocks, 10);
    }

    #[test]
    fn set_size_promotes_large_file() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let mut inode = Ext2Inode::default();
        inode.i_mode = (pml_fs::mode::S_IFREG | 0o644) as u16;
        fs.inode_set_size(&mut inode, 0x9000_0000).unwrap();
        assert!(fs.sb.ro_compat().contains(FeatureRoCompat::LARGE_FILE));
        assert_eq!(inode.size(), 0x9000_0000);
    }
}
