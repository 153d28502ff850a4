//! Directory blocks: iteration, linking and unlinking.
//!
//! Entries are variable length and 4-byte aligned; with the `FILETYPE`
//! feature the high byte of the name-length field carries the entry type.
//! Checksummed filesystems end every directory block with a
//! `dirent_tail` holding a crc32c; hashed-tree (`dx`) blocks carry a
//! `dx_tail` instead and are validated but never created here.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use pml_core::{Errno, Result};

use crate::bmap::BMAP_ALLOC;
use crate::inode::{Ext2Inode, EXT2_INDEX_FL};
use crate::{Ext2Fs, FeatureIncompat, EXT2_MAX_NAME};

/// Directory entry file types (`FILETYPE` feature).
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

/// Marker in the name-length field of a checksum tail entry.
pub const DIR_NAME_CHECKSUM: u16 = 0xde00;

/// Size of the directory-block checksum tail.
pub const DIRENT_TAIL_SIZE: usize = 12;

/// Header bytes of a directory entry before the name.
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Callback verdict: the entry was modified in place.
pub const DIRENT_CHANGED: u32 = 1 << 0;
/// Callback verdict: stop iterating.
pub const DIRENT_ABORT: u32 = 1 << 1;

/// Iteration flag: also visit empty entries.
pub const DIRENT_FLAG_EMPTY: u32 = 1 << 0;
/// Iteration flag: deliver the checksum tail as an entry.
pub const DIRENT_FLAG_CHECKSUM: u32 = 1 << 2;

/// What kind of entry the callback is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentKind {
    /// The `.` entry.
    Dot,
    /// The `..` entry.
    DotDot,
    /// Any later entry.
    Other,
    /// A remnant inside a removed entry's record.
    Deleted,
    /// The checksum tail.
    Checksum,
}

/// Computes the record length a name of `name_len` bytes needs.
pub fn dir_rec_len(name_len: usize) -> usize {
    (name_len + DIR_ENTRY_HEADER_LEN + 3) & !3
}

/// Maps a file mode to the `FILETYPE` code.
pub fn dir_type(mode: u32) -> u8 {
    use pml_fs::mode::*;
    match mode & S_IFMT {
        S_IFREG => FT_REG_FILE,
        S_IFDIR => FT_DIR,
        S_IFCHR => FT_CHRDEV,
        S_IFBLK => FT_BLKDEV,
        S_IFIFO => FT_FIFO,
        S_IFSOCK => FT_SOCK,
        S_IFLNK => FT_SYMLINK,
        _ => FT_UNKNOWN,
    }
}

// ── Raw entry accessors ─────────────────────────────────────────────

pub(crate) fn de_inode(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn set_de_inode(buf: &mut [u8], at: usize, ino: u32) {
    buf[at..at + 4].copy_from_slice(&ino.to_le_bytes());
}

pub(crate) fn de_rec_len_raw(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at + 4], buf[at + 5]])
}

pub(crate) fn set_de_rec_len_raw(buf: &mut [u8], at: usize, v: u16) {
    buf[at + 4..at + 6].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn de_name_len_field(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at + 6], buf[at + 7]])
}

pub(crate) fn set_de_name_len_field(buf: &mut [u8], at: usize, v: u16) {
    buf[at + 6..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn de_name_len(buf: &[u8], at: usize) -> usize {
    (de_name_len_field(buf, at) & 0xff) as usize
}

pub(crate) fn de_file_type(buf: &[u8], at: usize) -> u8 {
    (de_name_len_field(buf, at) >> 8) as u8
}

pub(crate) fn de_name<'a>(buf: &'a [u8], at: usize) -> &'a [u8] {
    &buf[at + 8..at + 8 + de_name_len(buf, at)]
}

impl Ext2Fs {
    /// Decodes an entry's record length, coping with the >= 64 KiB block
    /// edge case where a raw length of zero means "whole block".
    pub fn get_rec_len(&self, buf: &[u8], at: usize) -> u32 {
        let raw = de_rec_len_raw(buf, at) as u32;
        if self.blksize < 65536 {
            raw
        } else if raw == 65535 || raw == 0 {
            self.blksize
        } else {
            (raw & 65532) | ((raw & 3) << 16)
        }
    }

    /// Encodes and stores an entry's record length.
    pub fn set_rec_len(&self, buf: &mut [u8], at: usize, len: u32) -> Result<()> {
        if len > self.blksize || self.blksize > 262144 || len & 3 != 0 {
            return Err(Errno::EINVAL);
        }
        let raw = if len < 65536 {
            len as u16
        } else if len == self.blksize {
            if self.blksize == 65536 { 65535 } else { 0 }
        } else {
            ((len & 65532) | ((len >> 16) & 3)) as u16
        };
        set_de_rec_len_raw(buf, at, raw);
        Ok(())
    }
}

/// Finds the checksum tail of a directory block by walking its entries.
pub(crate) fn get_dirent_tail(fs: &Ext2Fs, buf: &[u8]) -> Result<usize> {
    let top = fs.blksize as usize - DIRENT_TAIL_SIZE;
    let mut at = 0usize;
    while at < top {
        let rec_len = de_rec_len_raw(buf, at) as usize;
        if rec_len < 8 || rec_len & 3 != 0 {
            return Err(Errno::EUCLEAN);
        }
        at += rec_len;
    }
    if at > fs.blksize as usize {
        return Err(Errno::EUCLEAN);
    }
    if at != top {
        return Err(Errno::ENOSPC);
    }
    if de_inode(buf, at) != 0
        || de_rec_len_raw(buf, at) as usize != DIRENT_TAIL_SIZE
        || de_name_len_field(buf, at) != DIR_NAME_CHECKSUM
    {
        return Err(Errno::ENOSPC);
    }
    Ok(at)
}

/// Locates the count/limit array of an htree block.
///
/// Returns `(count_offset, limit, count)`.
pub(crate) fn get_dx_countlimit(fs: &Ext2Fs, buf: &[u8]) -> Result<(usize, usize, usize)> {
    let rec_len = de_rec_len_raw(buf, 0) as u32;
    let count_offset;
    if rec_len == fs.blksize && de_name_len_field(buf, 0) == 0 {
        count_offset = 8;
    } else if rec_len == 12 {
        let rec2 = de_rec_len_raw(buf, 12) as u32;
        if rec2 != fs.blksize - 12 {
            return Err(Errno::EUCLEAN);
        }
        // dx_root_info: reserved_zero(4) hash_version(1) info_length(1).
        let reserved = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        if reserved != 0 || buf[29] != 8 {
            return Err(Errno::EUCLEAN);
        }
        count_offset = 32;
    } else {
        return Err(Errno::EUCLEAN);
    }
    let limit = u16::from_le_bytes([buf[count_offset], buf[count_offset + 1]]) as usize;
    let count = u16::from_le_bytes([buf[count_offset + 2], buf[count_offset + 3]]) as usize;
    let max_entries = (fs.blksize as usize - count_offset) / 8;
    if limit > max_entries || count > max_entries {
        return Err(Errno::ENOSPC);
    }
    Ok((count_offset, limit, count))
}

impl Ext2Fs {
    /// Builds an empty directory block; with a nonzero `ino` it seeds the
    /// `.` and `..` entries for a new directory.
    pub fn new_dir_block(&self, ino: u32, parent: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.blksize as usize];
        let csum_size = if self.sb.has_metadata_csum() {
            DIRENT_TAIL_SIZE
        } else {
            0
        };
        self.set_rec_len(&mut buf, 0, self.blksize - csum_size as u32)?;

        if ino != 0 {
            let filetype = if self.sb.incompat().contains(FeatureIncompat::FILETYPE) {
                FT_DIR as u16
            } else {
                0
            };
            // `.`
            set_de_inode(&mut buf, 0, ino);
            set_de_name_len_field(&mut buf, 0, (filetype << 8) | 1);
            buf[8] = b'.';
            let dot_len = dir_rec_len(1) as u32;
            self.set_rec_len(&mut buf, 0, dot_len)?;
            // `..`
            let at = dot_len as usize;
            set_de_inode(&mut buf, at, parent);
            set_de_name_len_field(&mut buf, at, (filetype << 8) | 2);
            buf[at + 8] = b'.';
            buf[at + 9] = b'.';
            self.set_rec_len(&mut buf, at, self.blksize - csum_size as u32 - dot_len)?;
        }

        if csum_size > 0 {
            let at = self.blksize as usize - DIRENT_TAIL_SIZE;
            set_de_inode(&mut buf, at, 0);
            set_de_rec_len_raw(&mut buf, at, DIRENT_TAIL_SIZE as u16);
            set_de_name_len_field(&mut buf, at, DIR_NAME_CHECKSUM);
        }
        Ok(buf)
    }

    /// Writes a directory block, refreshing its checksum tail first.
    pub fn write_dir_block(
        &mut self,
        dir_ino: u32,
        r#gen: u32,
        block: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.dir_block_checksum_update(dir_ino, r#gen, buf)?;
        self.write_blocks(buf, block, 1)
    }

    /// Reads a directory block and validates its checksum.
    fn read_dir_block(&mut self, dir_ino: u32, r#gen: u32, block: u64, buf: &mut [u8]) -> Result<()> {
        self.read_blocks(buf, block, 1)?;
        if !self.dir_block_checksum_valid(dir_ino, r#gen, buf) {
            return Err(Errno::EUCLEAN);
        }
        Ok(())
    }

    /// Walks every entry of every data block of a directory.
    ///
    /// The callback receives the block buffer and the entry's offset and
    /// may mutate the entry in place, reporting `DIRENT_CHANGED` (the block
    /// is then written back, checksummed) and/or `DIRENT_ABORT`.
    pub fn dir_iterate(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        flags: u32,
        cb: &mut dyn FnMut(&mut Ext2Fs, DirentKind, &mut [u8], usize, usize) -> Result<u32>,
    ) -> Result<()> {
        if !pml_fs::mode::is_dir(dir_inode.i_mode as u32) {
            return Err(Errno::ENOTDIR);
        }
        let bufsize = self.blksize as usize;
        let csum_size = if self.sb.has_metadata_csum() {
            DIRENT_TAIL_SIZE
        } else {
            0
        };
        let nblocks = (dir_inode.size() + self.blksize as u64 - 1) >> self.sb.block_size_bits();
        let r#gen = dir_inode.i_generation;
        let mut inode_copy = *dir_inode;
        let mut buf = vec![0u8; bufsize];
        let mut kind_state = DirentKind::Dot;

        for blkcnt in 0..nblocks {
            let (phys, _) = self.bmap(dir_ino, Some(&mut inode_copy), 0, blkcnt, 0)?;
            if phys == 0 {
                continue;
            }
            self.read_dir_block(dir_ino, r#gen, phys, &mut buf)?;
            if blkcnt > 0 {
                kind_state = DirentKind::Other;
            }

            let mut offset = 0usize;
            let mut changed = false;
            let mut do_abort = false;
            while offset < bufsize - DIR_ENTRY_HEADER_LEN {
                let rec_len = self.get_rec_len(&buf, offset) as usize;
                if offset + rec_len > bufsize
                    || rec_len < 8
                    || rec_len & 3 != 0
                    || de_name_len(&buf, offset) + 8 > rec_len
                {
                    return Err(Errno::EUCLEAN);
                }

                let mut kind = kind_state;
                let mut deliver = true;
                if de_inode(&buf, offset) == 0 {
                    let is_tail = csum_size > 0
                        && offset == bufsize - csum_size
                        && rec_len == csum_size
                        && de_name_len_field(&buf, offset) == DIR_NAME_CHECKSUM;
                    if is_tail {
                        if flags & DIRENT_FLAG_CHECKSUM != 0 {
                            kind = DirentKind::Checksum;
                        } else {
                            deliver = false;
                        }
                    } else if flags & DIRENT_FLAG_EMPTY == 0 {
                        deliver = false;
                    }
                }

                let mut rec_len = rec_len;
                if deliver {
                    let verdict = cb(self, kind, &mut buf, offset, bufsize)?;
                    if kind_state != DirentKind::Other {
                        kind_state = match kind_state {
                            DirentKind::Dot => DirentKind::DotDot,
                            _ => DirentKind::Other,
                        };
                    }
                    if verdict & DIRENT_CHANGED != 0 {
                        changed = true;
                        rec_len = self.get_rec_len(&buf, offset) as usize;
                    }
                    if verdict & DIRENT_ABORT != 0 {
                        do_abort = true;
                    }
                }

                if do_abort {
                    break;
                }
                offset += rec_len;
                if offset >= bufsize {
                    break;
                }
            }

            if changed {
                self.write_dir_block(dir_ino, r#gen, phys, &mut buf)?;
            }
            if do_abort {
                break;
            }
        }
        Ok(())
    }

    /// Looks up `name` in a directory, returning its inode number.
    pub fn lookup_entry(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        name: &str,
    ) -> Result<u32> {
        if name.len() > EXT2_MAX_NAME {
            return Err(Errno::ENAMETOOLONG);
        }
        let mut found: Option<u32> = None;
        let target = name.as_bytes();
        self.dir_iterate(dir_ino, dir_inode, 0, &mut |_fs, _kind, buf, at, _size| {
            if de_name_len(buf, at) == target.len() && de_name(buf, at) == target {
                found = Some(de_inode(buf, at));
                return Ok(DIRENT_ABORT);
            }
            Ok(0)
        })?;
        found.ok_or(Errno::ENOENT)
    }

    /// Reads the first live entry at or after byte `offset`.
    ///
    /// Returns `Ok(None)` at end of directory, else the entry and the
    /// offset to pass back for the next one.
    pub fn read_dirent(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        offset: u64,
    ) -> Result<Option<(u32, u8, String, u64)>> {
        let bufsize = self.blksize as usize;
        let nblocks = (dir_inode.size() + self.blksize as u64 - 1) >> self.sb.block_size_bits();
        let mut inode_copy = *dir_inode;
        let mut buf = vec![0u8; bufsize];
        let mut blkcnt = offset / self.blksize as u64;
        let mut at = (offset % self.blksize as u64) as usize;

        while blkcnt < nblocks {
            let (phys, _) = self.bmap(dir_ino, Some(&mut inode_copy), 0, blkcnt, 0)?;
            if phys != 0 {
                self.read_dir_block(dir_ino, dir_inode.i_generation, phys, &mut buf)?;
                while at < bufsize - DIR_ENTRY_HEADER_LEN {
                    let rec_len = self.get_rec_len(&buf, at) as usize;
                    if rec_len < 8 || at + rec_len > bufsize {
                        return Err(Errno::EUCLEAN);
                    }
                    if de_inode(&buf, at) != 0 {
                        let name = String::from_utf8_lossy(de_name(&buf, at)).into_owned();
                        let next = blkcnt * self.blksize as u64 + (at + rec_len) as u64;
                        return Ok(Some((
                            de_inode(&buf, at),
                            de_file_type(&buf, at),
                            name,
                            next,
                        )));
                    }
                    at += rec_len;
                }
            }
            blkcnt += 1;
            at = 0;
        }
        Ok(None)
    }

    /// Whether a directory holds only `.` and `..`.
    pub fn dir_is_empty(&mut self, dir_ino: u32, dir_inode: &Ext2Inode) -> Result<bool> {
        let mut empty = true;
        self.dir_iterate(dir_ino, dir_inode, 0, &mut |_fs, _kind, buf, at, _size| {
            let name = de_name(buf, at);
            if name != b"." && name != b".." {
                empty = false;
                return Ok(DIRENT_ABORT);
            }
            Ok(0)
        })?;
        Ok(empty)
    }

    /// Appends a fresh empty block to a directory.
    pub fn expand_dir(&mut self, dir_ino: u32, dir_inode: &mut Ext2Inode) -> Result<()> {
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        if !pml_fs::mode::is_dir(dir_inode.i_mode as u32) {
            return Err(Errno::ENOTDIR);
        }
        let size = dir_inode.size();
        let new_lblk = size >> self.sb.block_size_bits();
        let (phys, _) = self.bmap(dir_ino, Some(dir_inode), BMAP_ALLOC, new_lblk, 0)?;
        if phys == 0 {
            return Err(Errno::ENOSPC);
        }
        let mut buf = self.new_dir_block(0, 0)?;
        self.write_dir_block(dir_ino, dir_inode.i_generation, phys, &mut buf)?;
        self.inode_set_size(dir_inode, size + self.blksize as u64)?;
        self.update_inode(dir_ino, dir_inode)
    }

    /// Adds a directory entry for `ino` named `name`.
    ///
    /// Walks the directory looking for an empty record (or an occupied one
    /// with enough slack to split); expands the directory by one block and
    /// retries when nothing fits. Hashed-tree directories are not extended.
    pub fn add_link(
        &mut self,
        dir_ino: u32,
        dir_inode: &mut Ext2Inode,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> Result<()> {
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        if dir_inode.i_flags & EXT2_INDEX_FL != 0 {
            return Err(Errno::ENOTSUP);
        }
        if name.is_empty() || name.len() > EXT2_MAX_NAME {
            return Err(Errno::EINVAL);
        }

        if self.try_add_link(dir_ino, dir_inode, name, ino, file_type)? {
            return Ok(());
        }
        self.expand_dir(dir_ino, dir_inode)?;
        if self.try_add_link(dir_ino, dir_inode, name, ino, file_type)? {
            return Ok(());
        }
        Err(Errno::ENOSPC)
    }

    fn try_add_link(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> Result<bool> {
        let needed = dir_rec_len(name.len()) as u32;
        let csum_size = if self.sb.has_metadata_csum() {
            DIRENT_TAIL_SIZE
        } else {
            0
        };
        let with_filetype = self.sb.incompat().contains(FeatureIncompat::FILETYPE);
        let target = name.as_bytes();
        let mut done = false;

        self.dir_iterate(
            dir_ino,
            dir_inode,
            DIRENT_FLAG_EMPTY,
            &mut |fs, _kind, buf, at, bufsize| {
                if done {
                    return Ok(DIRENT_ABORT);
                }
                let mut verdict = 0;
                let mut curr_rec_len = fs.get_rec_len(buf, at) as usize;

                // Fold a following empty entry into this one.
                let next = at + curr_rec_len;
                if next < bufsize - csum_size - 8
                    && de_inode(buf, next) == 0
                    && next + de_rec_len_raw(buf, next) as usize <= bufsize
                {
                    curr_rec_len += de_rec_len_raw(buf, next) as usize;
                    fs.set_rec_len(buf, at, curr_rec_len as u32)?;
                    verdict = DIRENT_CHANGED;
                }

                if de_inode(buf, at) != 0 {
                    // Occupied: split off its slack if both halves fit.
                    let min_rec_len = dir_rec_len(de_name_len(buf, at));
                    if curr_rec_len < min_rec_len + needed as usize {
                        return Ok(verdict);
                    }
                    let rest = curr_rec_len - min_rec_len;
                    fs.set_rec_len(buf, at, min_rec_len as u32)?;
                    let hole = at + min_rec_len;
                    set_de_inode(buf, hole, 0);
                    set_de_name_len_field(buf, hole, 0);
                    fs.set_rec_len(buf, hole, rest as u32)?;
                    return Ok(DIRENT_CHANGED);
                }

                if curr_rec_len < needed as usize {
                    return Ok(verdict);
                }
                // Empty and big enough: claim it.
                set_de_inode(buf, at, ino);
                let mut name_field = target.len() as u16;
                if with_filetype {
                    name_field |= ((file_type & 7) as u16) << 8;
                }
                set_de_name_len_field(buf, at, name_field);
                buf[at + 8..at + 8 + target.len()].copy_from_slice(target);
                done = true;
                Ok(DIRENT_ABORT | DIRENT_CHANGED)
            },
        )?;
        Ok(done)
    }

    /// Removes the entry `name`, dropping the target's link count and
    /// deallocating it when the count reaches zero.
    ///
    /// Non-empty directories refuse to unlink with `ENOTEMPTY`.
    pub fn unlink_dirent(
        &mut self,
        dir_ino: u32,
        dir_inode: &Ext2Inode,
        name: &str,
    ) -> Result<u32> {
        if self.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let target = name.as_bytes();
        let mut prev_at: Option<usize> = None;
        let mut done: Option<u32> = None;
        let mut failure: Option<Errno> = None;

        self.dir_iterate(
            dir_ino,
            dir_inode,
            DIRENT_FLAG_EMPTY,
            &mut |fs, _kind, buf, at, _size| {
                // A block boundary resets the previous-entry tracking.
                let prev = if at == 0 { None } else { prev_at };
                prev_at = Some(at);
                if de_name_len(buf, at) != target.len() || de_name(buf, at) != target {
                    return Ok(0);
                }
                let victim = de_inode(buf, at);
                if victim == 0 {
                    return Ok(0);
                }

                let mut inode = fs.read_inode(victim)?;
                let is_dir = pml_fs::mode::is_dir(inode.i_mode as u32);
                if is_dir && !fs.dir_is_empty(victim, &inode)? {
                    failure = Some(Errno::ENOTEMPTY);
                    return Ok(DIRENT_ABORT);
                }

                inode.i_links_count = inode.i_links_count.saturating_sub(1);
                if inode.i_links_count == 0 {
                    inode.i_dtime = (fs.clock)();
                    fs.read_bitmaps()?;
                    fs.inode_alloc_stats(victim, -1, is_dir);
                    fs.dealloc_blocks(victim, Some(&inode), 0, u64::MAX >> 1)?;
                    inode = fs.read_inode(victim)?;
                    inode.i_links_count = 0;
                    inode.i_dtime = (fs.clock)();
                }
                fs.update_inode(victim, &inode)?;

                // Remove the record: fold into the previous entry, or zero
                // the inode for the first slot of the block.
                match prev {
                    Some(prev) => {
                        let merged = fs.get_rec_len(buf, prev) + fs.get_rec_len(buf, at);
                        fs.set_rec_len(buf, prev, merged)?;
                    }
                    None => set_de_inode(buf, at, 0),
                }
                done = Some(victim);
                Ok(DIRENT_ABORT | DIRENT_CHANGED)
            },
        )?;

        if let Some(errno) = failure {
            return Err(errno);
        }
        done.ok_or(Errno::ENOENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use pml_fs::mode::{S_IFDIR, S_IFREG};
    use pml_fs::MountFlags;

    fn open_root() -> (crate::Ext2Fs, Ext2Inode) {
        let img = testfs::mkfs_basic(1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        fs.read_bitmaps().unwrap();
        let root = fs.read_inode(crate::EXT2_ROOT_INO).unwrap();
        (fs, root)
    }

    fn make_inode(fs: &mut crate::Ext2Fs, mode: u32) -> u32 {
        let ino = fs.new_inode(crate::EXT2_ROOT_INO).unwrap();
        fs.inode_alloc_stats(ino, 1, pml_fs::mode::is_dir(mode));
        let mut inode = Ext2Inode::default();
        inode.i_mode = mode as u16;
        inode.i_links_count = 1;
        fs.write_new_inode(ino, &mut inode).unwrap();
        ino
    }

    #[test]
    fn rec_len_roundtrip() {
        let (fs, _) = open_root();
        let mut buf = vec![0u8; fs.blksize as usize];
        fs.set_rec_len(&mut buf, 0, 264).unwrap();
        assert_eq!(fs.get_rec_len(&buf, 0), 264);
        assert!(fs.set_rec_len(&mut buf, 0, 263).is_err());
    }

    #[test]
    fn iterate_fresh_root() {
        let (mut fs, root) = open_root();
        let mut names = Vec::new();
        fs.dir_iterate(crate::EXT2_ROOT_INO, &root, 0, &mut |_fs, kind, buf, at, _| {
            names.push((kind, String::from_utf8_lossy(de_name(buf, at)).into_owned()));
            Ok(0)
        })
        .unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], (DirentKind::Dot, String::from(".")));
        assert_eq!(names[1], (DirentKind::DotDot, String::from("..")));
    }

    #[test]
    fn add_link_then_lookup() {
        let (mut fs, mut root) = open_root();
        let ino = make_inode(&mut fs, S_IFREG | 0o644);
        fs.add_link(crate::EXT2_ROOT_INO, &mut root, "hello.txt", ino, FT_REG_FILE)
            .unwrap();
        assert_eq!(
            fs.lookup_entry(crate::EXT2_ROOT_INO, &root, "hello.txt").unwrap(),
            ino
        );
        assert_eq!(
            fs.lookup_entry(crate::EXT2_ROOT_INO, &root, "absent").unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn rec_len_sums_to_block_size() {
        // Testable property: the record lengths of a directory block sum
        // exactly to the block size.
        let (mut fs, mut root) = open_root();
        for i in 0..5 {
            let ino = make_inode(&mut fs, S_IFREG | 0o644);
            let name = alloc::format!("file{i}");
            fs.add_link(crate::EXT2_ROOT_INO, &mut root, &name, ino, FT_REG_FILE)
                .unwrap();
        }
        let mut total = 0u32;
        let (phys, _) = fs
            .bmap(crate::EXT2_ROOT_INO, Some(&mut root.clone()), 0, 0, 0)
            .unwrap();
        let mut buf = vec![0u8; fs.blksize as usize];
        fs.read_blocks(&mut buf, phys, 1).unwrap();
        let mut at = 0usize;
        while at < fs.blksize as usize {
            let rec = fs.get_rec_len(&buf, at);
            assert!(rec >= 8);
            total += rec;
            at += rec as usize;
        }
        assert_eq!(total, fs.blksize);
    }

    #[test]
    fn unlink_folds_or_zeroes_entry() {
        let (mut fs, mut root) = open_root();
        let a = make_inode(&mut fs, S_IFREG | 0o644);
        let b = make_inode(&mut fs, S_IFREG | 0o644);
        fs.add_link(crate::EXT2_ROOT_INO, &mut root, "a", a, FT_REG_FILE).unwrap();
        fs.add_link(crate::EXT2_ROOT_INO, &mut root, "b", b, FT_REG_FILE).unwrap();

        let free_inodes = fs.sb.s_free_inodes_count;
        fs.unlink_dirent(crate::EXT2_ROOT_INO, &root, "a").unwrap();
        assert_eq!(
            fs.lookup_entry(crate::EXT2_ROOT_INO, &root, "a").unwrap_err(),
            Errno::ENOENT
        );
        // The other entry survives and the inode went back to the pool.
        assert_eq!(fs.lookup_entry(crate::EXT2_ROOT_INO, &root, "b").unwrap(), b);
        assert_eq!(fs.sb.s_free_inodes_count, free_inodes + 1);

        assert_eq!(
            fs.unlink_dirent(crate::EXT2_ROOT_INO, &root, "a").unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn unlink_nonempty_dir_is_enotempty() {
        let (mut fs, mut root) = open_root();
        // Build a subdirectory with one entry inside.
        let sub = make_inode(&mut fs, S_IFDIR | 0o755);
        let mut sub_inode = fs.read_inode(sub).unwrap();
        let block = fs.alloc_block(0).unwrap();
        sub_inode.i_block[0] = block as u32;
        sub_inode.i_links_count = 2;
        fs.inode_set_size(&mut sub_inode, fs.blksize as u64).unwrap();
        fs.iblk_set(&mut sub_inode, 1).unwrap();
        let mut dirblock = fs.new_dir_block(sub, crate::EXT2_ROOT_INO).unwrap();
        fs.write_dir_block(sub, 0, block, &mut dirblock).unwrap();
        fs.update_inode(sub, &sub_inode).unwrap();
        fs.add_link(crate::EXT2_ROOT_INO, &mut root, "subdir", sub, FT_DIR).unwrap();

        let inner = make_inode(&mut fs, S_IFREG | 0o600);
        let mut sub_inode = fs.read_inode(sub).unwrap();
        fs.add_link(sub, &mut sub_inode, "inner", inner, FT_REG_FILE).unwrap();

        assert_eq!(
            fs.unlink_dirent(crate::EXT2_ROOT_INO, &root, "subdir").unwrap_err(),
            Errno::ENOTEMPTY
        );
        // Empty it out and the unlink goes through.
        fs.unlink_dirent(sub, &sub_inode, "inner").unwrap();
        fs.unlink_dirent(crate::EXT2_ROOT_INO, &root, "subdir").unwrap();
    }

    #[test]
    fn expand_dir_adds_a_block() {
        let (mut fs, mut root) = open_root();
        let size_before = root.size();
        fs.expand_dir(crate::EXT2_ROOT_INO, &mut root).unwrap();
        assert_eq!(root.size(), size_before + fs.blksize as u64);
        // The new block iterates as one big empty entry.
        let mut count = 0;
        fs.dir_iterate(
            crate::EXT2_ROOT_INO,
            &root,
            DIRENT_FLAG_EMPTY,
            &mut |_fs, _kind, _buf, _at, _size| {
                count += 1;
                Ok(0)
            },
        )
        .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn readdir_walks_offsets() {
        let (mut fs, mut root) = open_root();
        let a = make_inode(&mut fs, S_IFREG | 0o644);
        fs.add_link(crate::EXT2_ROOT_INO, &mut root, "walk", a, FT_REG_FILE).unwrap();
        let mut offset = 0u64;
        let mut seen = Vec::new();
        while let Some((ino, ftype, name, next)) = fs
            .read_dirent(crate::EXT2_ROOT_INO, &root, offset)
            .unwrap()
        {
            seen.push((ino, ftype, name));
            offset = next;
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].2, "walk");
        assert_eq!(seen[2].0, a);
        assert_eq!(seen[2].1, FT_REG_FILE);
    }
}
