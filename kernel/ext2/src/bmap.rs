//! Logical-to-physical block mapping for classic indirect inodes.
//!
//! `i_block[0..12]` map directly; slots 12, 13 and 14 add one, two and
//! three levels of indirection. Extent-mapped inodes route through the
//! extent tree instead.

use alloc::vec;

use pml_core::{Errno, Result};

use crate::inode::{Ext2Inode, EXT4_INLINE_DATA_FL};
use crate::{Ext2Fs, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_TIND_BLOCK};

/// Allocate missing blocks along the path.
pub const BMAP_ALLOC: u32 = 1 << 0;
/// Store a mapping instead of reading one.
pub const BMAP_SET: u32 = 1 << 1;
/// With `SET` on extents, record the extent as uninitialized.
pub const BMAP_UNINIT: u32 = 1 << 2;
/// Zero-fill the resolved block.
pub const BMAP_ZERO: u32 = 1 << 3;
/// Returned flag: the mapping is part of an uninitialized extent.
pub const BMAP_RET_UNINIT: u32 = 1;

fn slot(buf: &[u8], index: u64) -> u32 {
    let at = index as usize * 4;
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn set_slot(buf: &mut [u8], index: u64, value: u32) {
    let at = index as usize * 4;
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

impl Ext2Fs {
    fn block_ind_bmap(
        &mut self,
        flags: u32,
        ind: u32,
        blocks_alloc: &mut u32,
        nr: u64,
        result_in: u32,
    ) -> Result<u32> {
        if ind == 0 {
            if flags & BMAP_SET != 0 {
                return Err(Errno::EINVAL);
            }
            return Ok(0);
        }
        let mut buf = vec![0u8; self.blksize as usize];
        self.read_blocks(&mut buf, ind as u64, 1)?;

        if flags & BMAP_SET != 0 {
            set_slot(&mut buf, nr, result_in);
            self.write_blocks(&buf, ind as u64, 1)?;
            return Ok(result_in);
        }

        let mut b = slot(&buf, nr);
        if b == 0 && flags & BMAP_ALLOC != 0 {
            let goal = if nr > 0 { slot(&buf, nr - 1) } else { ind };
            let new = self.alloc_block(goal as u64)?;
            b = new as u32;
            set_slot(&mut buf, nr, b);
            self.write_blocks(&buf, ind as u64, 1)?;
            *blocks_alloc += 1;
        }
        Ok(b)
    }

    fn block_dind_bmap(
        &mut self,
        flags: u32,
        dind: u32,
        blocks_alloc: &mut u32,
        nr: u64,
        result_in: u32,
    ) -> Result<u32> {
        let addr_per_block = self.blksize as u64 / 4;
        let b = self.block_ind_bmap(
            flags & !BMAP_SET,
            dind,
            blocks_alloc,
            nr / addr_per_block,
            0,
        )?;
        self.block_ind_bmap(flags, b, blocks_alloc, nr % addr_per_block, result_in)
    }

    fn block_tind_bmap(
        &mut self,
        flags: u32,
        tind: u32,
        blocks_alloc: &mut u32,
        nr: u64,
        result_in: u32,
    ) -> Result<u32> {
        let addr_per_block = self.blksize as u64 / 4;
        let b = self.block_dind_bmap(
            flags & !BMAP_SET,
            tind,
            blocks_alloc,
            nr / addr_per_block,
            0,
        )?;
        self.block_ind_bmap(flags, b, blocks_alloc, nr % addr_per_block, result_in)
    }

    /// Maps logical `block` of `ino` to a physical block.
    ///
    /// Returns `(physical, ret_flags)`; a zero physical block is a hole.
    /// `BMAP_ALLOC` allocates missing data and indirect blocks, `BMAP_SET`
    /// stores `phys_in` as the mapping, and `BMAP_ZERO` zero-fills the
    /// resolved block. Offsets beyond the addressing scheme are `EFBIG`.
    pub fn bmap(
        &mut self,
        ino: u32,
        inode: Option<&mut Ext2Inode>,
        flags: u32,
        block: u64,
        phys_in: u64,
    ) -> Result<(u64, u32)> {
        let mut inode_buf;
        let inode = match inode {
            Some(i) => i,
            None => {
                inode_buf = self.read_inode(ino)?;
                &mut inode_buf
            }
        };
        let addr_per_block = self.blksize as u64 / 4;

        if self.file_block_offset_too_big(inode, block) {
            return Err(Errno::EFBIG);
        }
        if inode.i_flags & EXT4_INLINE_DATA_FL != 0 {
            return Err(Errno::EUCLEAN);
        }

        if inode.uses_extents() {
            let mut handle = crate::extent::ExtentHandle::open(self, ino, inode)?;
            let mut blocks_alloc = 0u32;
            let mut retflags = 0u32;
            let phys = handle.bmap(self, flags, block, phys_in, &mut retflags, &mut blocks_alloc)?;
            *inode = handle.into_inode();
            if phys != 0 && flags & BMAP_ZERO != 0 {
                self.zero_blocks(phys, 1)?;
            }
            if blocks_alloc > 0 {
                self.update_inode(ino, inode)?;
            }
            return Ok((phys, retflags));
        }

        let mut blocks_alloc = 0u32;
        let mut inode_dirty = false;
        let mut phys: u64;

        if block < EXT2_IND_BLOCK as u64 {
            // Direct block.
            if flags & BMAP_SET != 0 {
                inode.i_block[block as usize] = phys_in as u32;
                inode_dirty = true;
                phys = phys_in;
            } else {
                phys = inode.i_block[block as usize] as u64;
                if phys == 0 && flags & BMAP_ALLOC != 0 {
                    let goal = if block > 0 {
                        inode.i_block[block as usize - 1] as u64
                    } else {
                        self.find_inode_goal(ino, Some(inode), block)
                    };
                    let b = self.alloc_block(goal)?;
                    inode.i_block[block as usize] = b as u32;
                    blocks_alloc += 1;
                    phys = b;
                }
            }
        } else {
            let mut nr = block - EXT2_IND_BLOCK as u64;
            if nr < addr_per_block {
                // Singly indirect.
                let ind = self.indirect_root(
                    inode,
                    EXT2_IND_BLOCK,
                    flags,
                    &mut blocks_alloc,
                )?;
                match ind {
                    Some(ind) => {
                        phys = self
                            .block_ind_bmap(flags, ind, &mut blocks_alloc, nr, phys_in as u32)?
                            as u64;
                    }
                    None => phys = 0,
                }
            } else {
                nr -= addr_per_block;
                if nr < addr_per_block * addr_per_block {
                    // Doubly indirect.
                    let dind = self.indirect_root(
                        inode,
                        EXT2_DIND_BLOCK,
                        flags,
                        &mut blocks_alloc,
                    )?;
                    match dind {
                        Some(dind) => {
                            phys = self.block_dind_bmap(
                                flags,
                                dind,
                                &mut blocks_alloc,
                                nr,
                                phys_in as u32,
                            )? as u64;
                        }
                        None => phys = 0,
                    }
                } else {
                    // Triply indirect.
                    nr -= addr_per_block * addr_per_block;
                    let tind = self.indirect_root(
                        inode,
                        EXT2_TIND_BLOCK,
                        flags,
                        &mut blocks_alloc,
                    )?;
                    match tind {
                        Some(tind) => {
                            phys = self.block_tind_bmap(
                                flags,
                                tind,
                                &mut blocks_alloc,
                                nr,
                                phys_in as u32,
                            )? as u64;
                        }
                        None => phys = 0,
                    }
                }
            }
        }

        if phys != 0 && flags & BMAP_ZERO != 0 {
            self.zero_blocks(phys, 1)?;
        }
        if blocks_alloc > 0 || inode_dirty {
            self.iblk_add_blocks(inode, blocks_alloc as u64)?;
            self.update_inode(ino, inode)?;
        }
        Ok((phys, 0))
    }

    /// Resolves (allocating on demand) the top-level indirect pointer at
    /// `index`, one of the three indirection roots.
    fn indirect_root(
        &mut self,
        inode: &mut Ext2Inode,
        index: usize,
        flags: u32,
        blocks_alloc: &mut u32,
    ) -> Result<Option<u32>> {
        let b = inode.i_block[index];
        if b != 0 {
            return Ok(Some(b));
        }
        if flags & BMAP_ALLOC == 0 {
            if flags & BMAP_SET != 0 {
                return Err(Errno::EINVAL);
            }
            return Ok(None);
        }
        let goal = inode.i_block[index - 1] as u64;
        let new = self.alloc_block(goal)?;
        inode.i_block[index] = new as u32;
        *blocks_alloc += 1;
        Ok(Some(new as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use pml_fs::mode::S_IFREG;
    use pml_fs::MountFlags;

    fn fresh_file(fs: &mut Ext2Fs) -> (u32, Ext2Inode) {
        fs.read_bitmaps().unwrap();
        let ino = fs.new_inode(crate::EXT2_ROOT_INO).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Ext2Inode::default();
        inode.i_mode = (S_IFREG | 0o644) as u16;
        inode.i_links_count = 1;
        fs.write_new_inode(ino, &mut inode).unwrap();
        (ino, inode)
    }

    #[test]
    fn direct_alloc_and_lookup() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, mut inode) = fresh_file(&mut fs);

        // A hole reads back as zero.
        let (phys, _) = fs.bmap(ino, Some(&mut inode), 0, 3, 0).unwrap();
        assert_eq!(phys, 0);

        let (phys, _) = fs.bmap(ino, Some(&mut inode), BMAP_ALLOC, 3, 0).unwrap();
        assert_ne!(phys, 0);
        assert_eq!(inode.i_block[3] as u64, phys);
        // i_blocks counts two sectors per 1 KiB block.
        assert_eq!(inode.i_blocks, 2);

        let (again, _) = fs.bmap(ino, Some(&mut inode), 0, 3, 0).unwrap();
        assert_eq!(again, phys);
    }

    #[test]
    fn indirect_levels_allocate_intermediates() {
        let img = testfs::mkfs_basic(4 * 1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, mut inode) = fresh_file(&mut fs);
        let addr_per_block = fs.blksize as u64 / 4;

        // First singly-indirect slot.
        let (phys, _) = fs.bmap(ino, Some(&mut inode), BMAP_ALLOC, 12, 0).unwrap();
        assert_ne!(phys, 0);
        assert_ne!(inode.i_block[EXT2_IND_BLOCK], 0);

        // First doubly-indirect slot.
        let dind_lblk = 12 + addr_per_block;
        let (phys2, _) = fs
            .bmap(ino, Some(&mut inode), BMAP_ALLOC, dind_lblk, 0)
            .unwrap();
        assert_ne!(phys2, 0);
        assert_ne!(inode.i_block[EXT2_DIND_BLOCK], 0);

        // Both remain resolvable without ALLOC.
        assert_eq!(fs.bmap(ino, Some(&mut inode), 0, 12, 0).unwrap().0, phys);
        assert_eq!(
            fs.bmap(ino, Some(&mut inode), 0, dind_lblk, 0).unwrap().0,
            phys2
        );
    }

    #[test]
    fn bmap_set_overwrites_mapping() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, mut inode) = fresh_file(&mut fs);
        let target = fs.alloc_block(0).unwrap();
        fs.bmap(ino, Some(&mut inode), BMAP_SET, 5, target).unwrap();
        assert_eq!(fs.bmap(ino, Some(&mut inode), 0, 5, 0).unwrap().0, target);
    }

    #[test]
    fn offset_too_big_is_efbig() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, mut inode) = fresh_file(&mut fs);
        let addr = fs.blksize as u64 / 4;
        let over = 12 + addr + addr * addr + addr * addr * addr;
        assert_eq!(
            fs.bmap(ino, Some(&mut inode), 0, over, 0).unwrap_err(),
            Errno::EFBIG
        );
    }

    #[test]
    fn dealloc_returns_blocks() {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, mut inode) = fresh_file(&mut fs);
        for lblk in 0..4 {
            fs.bmap(ino, Some(&mut inode), BMAP_ALLOC, lblk, 0).unwrap();
        }
        let free_before = fs.sb.free_blocks_count();
        fs.dealloc_blocks(ino, Some(&inode), 0, u64::MAX >> 1).unwrap();
        assert_eq!(fs.sb.free_blocks_count(), free_before + 4);
        let inode = fs.read_inode(ino).unwrap();
        assert_eq!(inode.i_block[0], 0);
        assert_eq!(inode.i_blocks, 0);
    }
}
