//! File I/O plumbing.
//!
//! An open file carries a copy of its inode and a one-block buffer. Moving
//! to a new logical block flushes the buffer; a flush allocates the backing
//! block on demand, which is also where holes materialize on write.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use pml_core::{Errno, Result};

use crate::bmap::{BMAP_ALLOC, BMAP_RET_UNINIT, BMAP_SET};
use crate::dir::dir_type;
use crate::inode::Ext2Inode;
use crate::Ext2Fs;

bitflags! {
    /// State of the per-file block buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        /// The buffer holds the current block's contents.
        const BUFFER_VALID = 1 << 13;
        /// The buffer has unwritten modifications.
        const BUFFER_DIRTY = 1 << 14;
    }
}

/// Filesystem-private state of an open file.
pub struct Ext2File {
    /// Copy of the on-disk inode.
    pub inode: Ext2Inode,
    /// Inode number.
    pub ino: u32,
    /// Current byte position the buffer tracks.
    pub pos: u64,
    /// Logical block the buffer holds.
    pub block: u64,
    /// Physical block behind `block`, zero for holes.
    pub physblock: u64,
    /// Buffer state flags.
    pub flags: FileFlags,
    /// One block of file data.
    pub buffer: Vec<u8>,
}

impl Ext2Fs {
    /// Opens `ino` for file I/O.
    pub fn open_file(&mut self, ino: u32) -> Result<Ext2File> {
        let inode = self.read_inode(ino)?;
        Ok(Ext2File {
            inode,
            ino,
            pos: 0,
            block: 0,
            physblock: 0,
            flags: FileFlags::empty(),
            buffer: vec![0u8; self.blksize as usize],
        })
    }

    /// Writes the buffer back if dirty, allocating the block if needed.
    pub fn file_flush(&mut self, file: &mut Ext2File) -> Result<()> {
        if !file.flags.contains(FileFlags::BUFFER_DIRTY) {
            return Ok(());
        }

        // An uninitialized extent must be flipped to initialized before the
        // data becomes visible.
        if file.physblock != 0 && file.inode.uses_extents() {
            let (_, retflags) = self.bmap(file.ino, Some(&mut file.inode), 0, file.block, 0)?;
            if retflags & BMAP_RET_UNINIT != 0 {
                let (phys, _) = self.bmap(
                    file.ino,
                    Some(&mut file.inode),
                    BMAP_SET,
                    file.block,
                    file.physblock,
                )?;
                file.physblock = phys;
            }
        }

        if file.physblock == 0 {
            let flags = if file.ino != 0 { BMAP_ALLOC } else { 0 };
            let (phys, _) = self.bmap(file.ino, Some(&mut file.inode), flags, file.block, 0)?;
            file.physblock = phys;
        }
        if file.physblock == 0 {
            return Err(Errno::ENOSPC);
        }

        self.write_blocks(&file.buffer, file.physblock, 1)?;
        file.flags &= !FileFlags::BUFFER_DIRTY;
        Ok(())
    }

    /// Retargets the buffer at the block containing `file.pos`, flushing
    /// the old block when the position moved.
    pub fn sync_file_buffer_pos(&mut self, file: &mut Ext2File) -> Result<()> {
        let block = file.pos / self.blksize as u64;
        if block != file.block {
            self.file_flush(file)?;
            file.flags &= !FileFlags::BUFFER_VALID;
        }
        file.block = block;
        Ok(())
    }

    /// Fills the buffer from the current block.
    ///
    /// Holes and uninitialized extents read as zeroes; `nofill` skips the
    /// read for full-block overwrites.
    pub fn load_file_buffer(&mut self, file: &mut Ext2File, nofill: bool) -> Result<()> {
        if file.flags.contains(FileFlags::BUFFER_VALID) {
            return Ok(());
        }
        let (phys, retflags) = self.bmap(file.ino, Some(&mut file.inode), 0, file.block, 0)?;
        file.physblock = phys;
        if !nofill {
            if phys != 0 && retflags & BMAP_RET_UNINIT == 0 {
                let mut buf = core::mem::take(&mut file.buffer);
                self.read_blocks(&mut buf, phys, 1)?;
                file.buffer = buf;
            } else {
                file.buffer.fill(0);
            }
        }
        file.flags |= FileFlags::BUFFER_VALID;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`.
    pub fn file_read(&mut self, file: &mut Ext2File, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = file.inode.size();
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let blksize = self.blksize as u64;
        let mut copied = 0usize;
        while copied < len {
            file.pos = offset + copied as u64;
            self.sync_file_buffer_pos(file)?;
            self.load_file_buffer(file, false)?;
            let off_in = (file.pos % blksize) as usize;
            let take = (len - copied).min(blksize as usize - off_in);
            buf[copied..copied + take].copy_from_slice(&file.buffer[off_in..off_in + take]);
            copied += take;
        }
        Ok(copied)
    }

    /// Writes `buf` at `offset`, extending the file as needed.
    ///
    /// The final buffer is flushed and the inode written back, so the data
    /// is durable when the call returns.
    pub fn file_write(&mut self, file: &mut Ext2File, buf: &[u8], offset: u64) -> Result<usize> {
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let blksize = self.blksize as u64;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.file_block_offset_too_big(&file.inode, (offset + buf.len() as u64 - 1) / blksize) {
            return Err(Errno::EFBIG);
        }
        let mut written = 0usize;
        while written < buf.len() {
            file.pos = offset + written as u64;
            self.sync_file_buffer_pos(file)?;
            let off_in = (file.pos % blksize) as usize;
            let take = (buf.len() - written).min(blksize as usize - off_in);
            let whole_block = off_in == 0 && take == blksize as usize;
            self.load_file_buffer(file, whole_block)?;
            file.buffer[off_in..off_in + take].copy_from_slice(&buf[written..written + take]);
            file.flags |= FileFlags::BUFFER_DIRTY;
            written += take;
        }

        let end = offset + written as u64;
        if end > file.inode.size() {
            self.inode_set_size(&mut file.inode, end)?;
        }
        self.file_flush(file)?;
        self.update_inode(file.ino, &file.inode)?;
        Ok(written)
    }

    /// Zeroes the tail of the block containing `offset` (after a size
    /// change that leaves a partial final block).
    fn file_zero_remainder(&mut self, file: &mut Ext2File, offset: u64) -> Result<()> {
        let blksize = self.blksize as u64;
        let off = offset % blksize;
        if off == 0 {
            return Ok(());
        }
        self.sync_file_buffer_pos(file)?;
        let (block, retflags) =
            self.bmap(file.ino, Some(&mut file.inode), 0, offset / blksize, 0)?;
        if block == 0 || retflags & BMAP_RET_UNINIT != 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; blksize as usize];
        self.read_blocks(&mut buf, block, 1)?;
        buf[off as usize..].fill(0);
        self.write_blocks(&buf, block, 1)
    }

    /// Sets the file size, zero-filling the tail of a shrunken final block
    /// and deallocating everything past the new end.
    pub fn file_set_size(&mut self, file: &mut Ext2File, size: u64) -> Result<()> {
        let blksize = self.blksize as u64;
        if size > 0 && self.file_block_offset_too_big(&file.inode, (size - 1) / blksize) {
            return Err(Errno::EFBIG);
        }
        let truncate_block = (size + blksize - 1) >> self.sb.block_size_bits();
        let old_size = file.inode.size();
        let old_truncate = (old_size + blksize - 1) >> self.sb.block_size_bits();

        // The buffered block may sit past the new end; drop it rather than
        // flushing stale data later.
        if file.block >= truncate_block {
            file.flags &= !(FileFlags::BUFFER_VALID | FileFlags::BUFFER_DIRTY);
        }

        self.inode_set_size(&mut file.inode, size)?;
        self.update_inode(file.ino, &file.inode)?;
        self.file_zero_remainder(file, size)?;

        if truncate_block >= old_truncate {
            return Ok(());
        }
        self.dealloc_blocks(file.ino, Some(&file.inode), truncate_block, u64::MAX >> 1)?;
        file.inode = self.read_inode(file.ino)?;
        Ok(())
    }

    /// Creates a file inode and links it into `dir`.
    ///
    /// Returns the new inode number and record.
    pub fn new_file(
        &mut self,
        dir_ino: u32,
        dir_inode: &mut Ext2Inode,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u64,
    ) -> Result<(u32, Ext2Inode)> {
        self.read_bitmaps()?;
        let ino = self.new_inode(dir_ino)?;
        let mut inode = Ext2Inode::default();
        inode.i_mode = mode as u16;
        inode.i_uid = uid as u16;
        inode.i_gid = gid as u16;
        inode.i_links_count = 1;
        if pml_fs::mode::is_chr(mode) || pml_fs::mode::is_blk(mode) {
            inode.i_block[0] = rdev as u32;
        }
        self.write_new_inode(ino, &mut inode)?;
        self.inode_alloc_stats(ino, 1, pml_fs::mode::is_dir(mode));
        self.add_link(dir_ino, dir_inode, name, ino, dir_type(mode))?;
        let inode = self.read_inode(ino)?;
        Ok((ino, inode))
    }

    /// Creates a directory inode with `.` and `..` and links it into `dir`.
    pub fn new_dir(
        &mut self,
        dir_ino: u32,
        dir_inode: &mut Ext2Inode,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(u32, Ext2Inode)> {
        self.read_bitmaps()?;
        let ino = self.new_inode(dir_ino)?;
        let goal = self.find_inode_goal(ino, None, 0);
        let block = self.alloc_block(goal)?;

        let mut inode = Ext2Inode::default();
        inode.i_mode = mode as u16;
        inode.i_uid = uid as u16;
        inode.i_gid = gid as u16;
        inode.i_links_count = 2;
        inode.i_block[0] = block as u32;
        self.inode_set_size(&mut inode, self.blksize as u64)?;
        self.iblk_set(&mut inode, 1)?;
        self.write_new_inode(ino, &mut inode)?;
        self.inode_alloc_stats(ino, 1, true);

        let mut dirblock = self.new_dir_block(ino, dir_ino)?;
        self.write_dir_block(ino, inode.i_generation, block, &mut dirblock)?;

        self.add_link(dir_ino, dir_inode, name, ino, crate::dir::FT_DIR)?;
        // The child's `..` adds a link to the parent.
        dir_inode.i_links_count += 1;
        self.update_inode(dir_ino, dir_inode)?;
        let inode = self.read_inode(ino)?;
        Ok((ino, inode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use pml_fs::mode::S_IFREG;
    use pml_fs::MountFlags;

    fn open_with_file() -> (crate::Ext2Fs, u32) {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let mut root = fs.read_inode(crate::EXT2_ROOT_INO).unwrap();
        let (ino, _) = fs
            .new_file(crate::EXT2_ROOT_INO, &mut root, "foo", S_IFREG | 0o644, 0, 0, 0)
            .unwrap();
        fs.update_inode(crate::EXT2_ROOT_INO, &root).unwrap();
        (fs, ino)
    }

    #[test]
    fn write_then_read_back() {
        let (mut fs, ino) = open_with_file();
        let mut file = fs.open_file(ino).unwrap();
        assert_eq!(fs.file_write(&mut file, b"hello", 0).unwrap(), 5);
        assert_eq!(file.inode.size(), 5);

        let mut file = fs.open_file(ino).unwrap();
        let mut buf = [0u8; 16];
        let n = fs.file_read(&mut file, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn cross_block_write() {
        let (mut fs, ino) = open_with_file();
        let mut file = fs.open_file(ino).unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.file_write(&mut file, &data, 100).unwrap(), data.len());
        assert_eq!(file.inode.size(), 3100);

        let mut file = fs.open_file(ino).unwrap();
        let mut out = vec![0u8; 3000];
        assert_eq!(fs.file_read(&mut file, &mut out, 100).unwrap(), 3000);
        assert_eq!(out, data);
        // The leading hole reads as zeroes.
        let mut head = [0xffu8; 100];
        fs.file_read(&mut file, &mut head, 0).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_eof_is_short() {
        let (mut fs, ino) = open_with_file();
        let mut file = fs.open_file(ino).unwrap();
        fs.file_write(&mut file, b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.file_read(&mut file, &mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(fs.file_read(&mut file, &mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn truncate_frees_and_zero_fills() {
        let (mut fs, ino) = open_with_file();
        let mut file = fs.open_file(ino).unwrap();
        let data = vec![0x5au8; 4096];
        fs.file_write(&mut file, &data, 0).unwrap();
        let free_before = fs.sb.free_blocks_count();

        fs.file_set_size(&mut file, 100).unwrap();
        assert_eq!(file.inode.size(), 100);
        // Three of the four data blocks came back.
        assert_eq!(fs.sb.free_blocks_count(), free_before + 3);

        // Growing the file again exposes zeroes, not stale bytes.
        fs.file_set_size(&mut file, 2048).unwrap();
        let mut file = fs.open_file(ino).unwrap();
        let mut out = vec![0u8; 2048];
        fs.file_read(&mut file, &mut out, 0).unwrap();
        assert!(out[..100].iter().all(|&b| b == 0x5a));
        assert!(out[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_write_leaves_hole() {
        let (mut fs, ino) = open_with_file();
        let mut file = fs.open_file(ino).unwrap();
        fs.file_write(&mut file, b"tail", 5000).unwrap();
        let mut inode = fs.read_inode(ino).unwrap();
        // Blocks 0..4 are holes; block 4 holds the data.
        let (phys, _) = fs.bmap(ino, Some(&mut inode), 0, 0, 0).unwrap();
        assert_eq!(phys, 0);
        let (phys, _) = fs.bmap(ino, Some(&mut inode), 0, 4, 0).unwrap();
        assert_ne!(phys, 0);

        let mut out = vec![0xffu8; 16];
        let mut file = fs.open_file(ino).unwrap();
        let n = fs.file_read(&mut file, &mut out, 4998).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&out[..6], b"\0\0tail");
    }
}
