//! Extent-tree block mapping.
//!
//! An extent-mapped inode stores a tree rooted in `i_block`: interior nodes
//! hold index entries pointing at child blocks, leaves hold extents mapping
//! a run of logical blocks to a run of physical blocks. A handle keeps the
//! path from the root to the current entry and exposes a small navigation
//! language over it; insertion may split nodes and grow the tree by
//! promoting a new root.

use alloc::vec;
use alloc::vec::Vec;

use pml_core::{Errno, Result};

use crate::bmap::{BMAP_ALLOC, BMAP_RET_UNINIT, BMAP_SET, BMAP_UNINIT};
use crate::inode::{Ext2Inode, EXT4_EXTENTS_FL};
use crate::Ext2Fs;

/// Magic number of every extent-tree node header.
pub const EXT3_EXTENT_MAGIC: u16 = 0xf30a;
/// Longest initialized extent.
pub const INIT_MAX_LEN: u32 = 1 << 15;
/// Longest uninitialized extent.
pub const UNINIT_MAX_LEN: u32 = INIT_MAX_LEN - 1;
/// Highest addressable logical block.
pub const MAX_EXTENT_LBLK: u64 = (1 << 32) - 1;
/// Highest addressable physical block.
pub const MAX_EXTENT_PBLK: u64 = (1 << 48) - 1;

/// Extent flag: the entry is a leaf extent.
pub const EXTENT_FLAGS_LEAF: u32 = 1 << 0;
/// Extent flag: the extent is uninitialized.
pub const EXTENT_FLAGS_UNINIT: u32 = 1 << 1;
/// Extent flag: an interior node seen on the way back up.
pub const EXTENT_FLAGS_SECOND_VISIT: u32 = 1 << 2;

/// Insert after the current entry rather than before.
pub const EXTENT_INSERT_AFTER: u32 = 1 << 0;
/// Fail instead of splitting a full node.
pub const EXTENT_INSERT_NOSPLIT: u32 = 1 << 1;
/// Keep empty interior nodes when deleting.
pub const EXTENT_DELETE_KEEP_EMPTY: u32 = 1 << 0;
/// `set_bmap` records an uninitialized mapping.
pub const EXTENT_SET_BMAP_UNINIT: u32 = 1 << 0;

/// Size of a node header and of each entry.
const EH_SIZE: usize = 12;
const ENTRY_SIZE: usize = 12;

/// Navigation operations over an extent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentOp {
    /// The current entry, unmoved.
    Current,
    /// The first entry of the root node.
    Root,
    /// The last extent of the last leaf.
    LastLeaf,
    /// First sibling in the current node.
    FirstSib,
    /// Last sibling in the current node.
    LastSib,
    /// Next sibling in the current node.
    NextSib,
    /// Previous sibling in the current node.
    PrevSib,
    /// Next entry at leaf level, descending as needed.
    NextLeaf,
    /// Previous entry at leaf level.
    PrevLeaf,
    /// Depth-first successor.
    Next,
    /// Depth-first predecessor.
    Prev,
    /// Parent entry.
    Up,
    /// First entry of the child node.
    Down,
    /// Last entry of the child node.
    DownLast,
}

/// A decoded extent (leaf) or index span (interior).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenExtent {
    /// First physical block.
    pub e_pblk: u64,
    /// First logical block.
    pub e_lblk: u64,
    /// Length in blocks.
    pub e_len: u32,
    /// `EXTENT_FLAGS_*`.
    pub e_flags: u32,
}

/// Summary of the handle position, mirrored to callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentInfo {
    pub curr_entry: i32,
    pub curr_level: i32,
    pub num_entries: i32,
    pub max_entries: i32,
    pub max_depth: i32,
    pub bytes_avail: i32,
    pub max_lblk: u64,
    pub max_pblk: u64,
    pub max_len: u32,
    pub max_uninit_len: u32,
}

// ── Raw node accessors ──────────────────────────────────────────────

fn eh_magic(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn eh_entries(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[2], buf[3]])
}

fn set_eh_entries(buf: &mut [u8], v: u16) {
    buf[2..4].copy_from_slice(&v.to_le_bytes());
}

fn eh_max(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[4], buf[5]])
}

fn set_eh_max(buf: &mut [u8], v: u16) {
    buf[4..6].copy_from_slice(&v.to_le_bytes());
}

fn eh_depth(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[6], buf[7]])
}

fn set_eh_depth(buf: &mut [u8], v: u16) {
    buf[6..8].copy_from_slice(&v.to_le_bytes());
}

fn write_header(buf: &mut [u8], entries: u16, max: u16, depth: u16) {
    buf[0..2].copy_from_slice(&EXT3_EXTENT_MAGIC.to_le_bytes());
    set_eh_entries(buf, entries);
    set_eh_max(buf, max);
    set_eh_depth(buf, depth);
    buf[8..12].fill(0); // generation
}

fn entry_off(i: i32) -> usize {
    EH_SIZE + i as usize * ENTRY_SIZE
}

/// Reads the leaf extent at entry `i`.
fn read_extent(buf: &[u8], i: i32) -> GenExtent {
    let at = entry_off(i);
    let ee_block = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let ee_len = u16::from_le_bytes([buf[at + 4], buf[at + 5]]);
    let ee_start_hi = u16::from_le_bytes([buf[at + 6], buf[at + 7]]);
    let ee_start =
        u32::from_le_bytes([buf[at + 8], buf[at + 9], buf[at + 10], buf[at + 11]]);
    GenExtent {
        e_pblk: ee_start as u64 | ((ee_start_hi as u64) << 32),
        e_lblk: ee_block as u64,
        e_len: ee_len as u32,
        e_flags: 0,
    }
}

/// Writes a leaf extent at entry `i` (`len` already encoded).
fn write_extent(buf: &mut [u8], i: i32, lblk: u64, pblk: u64, len: u16) {
    let at = entry_off(i);
    buf[at..at + 4].copy_from_slice(&(lblk as u32).to_le_bytes());
    buf[at + 4..at + 6].copy_from_slice(&len.to_le_bytes());
    buf[at + 6..at + 8].copy_from_slice(&((pblk >> 32) as u16).to_le_bytes());
    buf[at + 8..at + 12].copy_from_slice(&(pblk as u32).to_le_bytes());
}

/// Reads the index entry at `i` as `(logical, child block)`.
fn read_index(buf: &[u8], i: i32) -> (u64, u64) {
    let at = entry_off(i);
    let ei_block = u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let ei_leaf = u32::from_le_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
    let ei_leaf_hi = u16::from_le_bytes([buf[at + 8], buf[at + 9]]);
    (ei_block as u64, ei_leaf as u64 | ((ei_leaf_hi as u64) << 32))
}

/// Writes the index entry at `i`.
fn write_index(buf: &mut [u8], i: i32, lblk: u64, child: u64) {
    let at = entry_off(i);
    buf[at..at + 4].copy_from_slice(&(lblk as u32).to_le_bytes());
    buf[at + 4..at + 8].copy_from_slice(&(child as u32).to_le_bytes());
    buf[at + 8..at + 10].copy_from_slice(&((child >> 32) as u16).to_le_bytes());
    buf[at + 10..at + 12].copy_from_slice(&0u16.to_le_bytes());
}

/// Validates a node header against the node size.
pub fn extent_header_valid(buf: &[u8], size: usize) -> Result<()> {
    if eh_magic(buf) != EXT3_EXTENT_MAGIC {
        return Err(Errno::EUCLEAN);
    }
    if eh_entries(buf) > eh_max(buf) {
        return Err(Errno::EUCLEAN);
    }
    let hmax = ((size - EH_SIZE) / ENTRY_SIZE) as u16;
    if eh_max(buf) > hmax || eh_max(buf) + 2 < hmax {
        return Err(Errno::EUCLEAN);
    }
    Ok(())
}

/// One level of the root-to-current path.
struct ExtentPath {
    buffer: Vec<u8>,
    entries: i32,
    max_entries: i32,
    left: i32,
    visit_num: i32,
    curr: Option<i32>,
    end_block: u64,
}

impl ExtentPath {
    fn empty() -> Self {
        Self {
            buffer: Vec::new(),
            entries: 0,
            max_entries: 0,
            left: 0,
            visit_num: 0,
            curr: None,
            end_block: 0,
        }
    }
}

/// A traversal handle over one inode's extent tree.
pub struct ExtentHandle {
    ino: u32,
    inode: Ext2Inode,
    level: usize,
    max_depth: usize,
    path: Vec<ExtentPath>,
}

impl ExtentHandle {
    /// Opens a handle, initializing an empty root for inodes without one.
    pub fn open(fs: &mut Ext2Fs, ino: u32, inode: &mut Ext2Inode) -> Result<Self> {
        if ino == 0 || ino > fs.sb.s_inodes_count {
            return Err(Errno::EINVAL);
        }
        let mut root = [0u8; 60];
        for (i, slot) in inode.i_block.iter().enumerate() {
            root[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
        }
        if inode.i_block.iter().all(|&b| b == 0) {
            let max = ((60 - EH_SIZE) / ENTRY_SIZE) as u16;
            write_header(&mut root, 0, max, 0);
            inode.i_flags |= EXT4_EXTENTS_FL;
            for (i, slot) in inode.i_block.iter_mut().enumerate() {
                *slot = u32::from_le_bytes([
                    root[i * 4],
                    root[i * 4 + 1],
                    root[i * 4 + 2],
                    root[i * 4 + 3],
                ]);
            }
        }
        if !inode.uses_extents() {
            return Err(Errno::EINVAL);
        }
        extent_header_valid(&root, 60)?;

        let max_depth = eh_depth(&root) as usize;
        let mut path = Vec::with_capacity(max_depth + 1);
        let entries = eh_entries(&root) as i32;
        let end_block = (inode.size() + fs.blksize as u64 - 1) >> fs.sb.block_size_bits();
        path.push(ExtentPath {
            buffer: root.to_vec(),
            entries,
            max_entries: eh_max(&root) as i32,
            left: entries,
            visit_num: 1,
            curr: None,
            end_block,
        });
        for _ in 0..max_depth {
            path.push(ExtentPath::empty());
        }
        Ok(Self {
            ino,
            inode: *inode,
            level: 0,
            max_depth,
            path,
        })
    }

    /// Consumes the handle, returning the (possibly updated) inode copy.
    pub fn into_inode(self) -> Ext2Inode {
        self.inode
    }

    /// Whether the handle is at a leaf node.
    fn at_leaf(&self) -> bool {
        self.level == self.max_depth
    }

    /// Syncs the root node buffer back into the inode's block array.
    fn sync_root(&mut self) {
        let buf = &self.path[0].buffer;
        for (i, slot) in self.inode.i_block.iter_mut().enumerate() {
            *slot = u32::from_le_bytes([
                buf[i * 4],
                buf[i * 4 + 1],
                buf[i * 4 + 2],
                buf[i * 4 + 3],
            ]);
        }
    }

    /// Physical block of the node at `level` (from the parent's entry).
    fn node_block(&self, level: usize) -> Result<u64> {
        let parent = &self.path[level - 1];
        let curr = parent.curr.ok_or(Errno::ENOENT)?;
        Ok(read_index(&parent.buffer, curr).1)
    }

    /// Writes the current node back (inode for the root, block otherwise).
    fn update_path(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        if self.level == 0 {
            self.sync_root();
            fs.update_inode(self.ino, &self.inode)
        } else {
            let block = self.node_block(self.level)?;
            let mut buf = core::mem::take(&mut self.path[self.level].buffer);
            fs.extent_block_checksum_update(self.ino, &mut buf)?;
            let ret = fs.write_blocks(&buf, block, 1);
            self.path[self.level].buffer = buf;
            ret
        }
    }

    /// Fetches the entry selected by `op` into a generic extent.
    pub fn get(&mut self, fs: &mut Ext2Fs, orig_op: ExtentOp) -> Result<GenExtent> {
        let mut op = orig_op;
        let mut fail_csum = false;

        'retry: loop {
            let (p_visit, p_left, p_entries) = {
                let path = &self.path[self.level];
                (path.visit_num, path.left, path.entries)
            };
            if matches!(orig_op, ExtentOp::Next | ExtentOp::NextLeaf) {
                op = if self.level < self.max_depth {
                    if p_visit == 0 {
                        self.path[self.level].visit_num += 1;
                        ExtentOp::Down
                    } else if p_left > 0 {
                        ExtentOp::NextSib
                    } else if self.level > 0 {
                        ExtentOp::Up
                    } else {
                        return Err(Errno::ESRCH);
                    }
                } else if p_left > 0 {
                    ExtentOp::NextSib
                } else if self.level > 0 {
                    ExtentOp::Up
                } else {
                    return Err(Errno::ESRCH);
                };
            }

            if matches!(orig_op, ExtentOp::Prev | ExtentOp::PrevLeaf) {
                op = if self.level < self.max_depth {
                    if p_visit > 0 {
                        ExtentOp::DownLast
                    } else if p_left < p_entries - 1 {
                        ExtentOp::PrevSib
                    } else if self.level > 0 {
                        ExtentOp::Up
                    } else {
                        return Err(Errno::ESRCH);
                    }
                } else if p_left < p_entries - 1 {
                    ExtentOp::PrevSib
                } else if self.level > 0 {
                    ExtentOp::Up
                } else {
                    return Err(Errno::ESRCH);
                };
            }

            if orig_op == ExtentOp::LastLeaf {
                op = if self.level < self.max_depth && p_left == 0 {
                    ExtentOp::Down
                } else {
                    ExtentOp::LastSib
                };
            }

            match op {
                ExtentOp::Current => {
                    if self.path[self.level].curr.is_none() {
                        return Err(Errno::ENOENT);
                    }
                }
                ExtentOp::Root | ExtentOp::FirstSib | ExtentOp::NextSib => {
                    if op == ExtentOp::Root {
                        self.level = 0;
                    }
                    if matches!(op, ExtentOp::Root | ExtentOp::FirstSib) {
                        let path = &mut self.path[self.level];
                        path.left = path.entries;
                        path.curr = None;
                    }
                    let path = &mut self.path[self.level];
                    if path.left <= 0 {
                        return Err(Errno::ESRCH);
                    }
                    let index = match path.curr {
                        Some(i) => i + 1,
                        None => 0,
                    };
                    path.left -= 1;
                    path.curr = Some(index);
                    path.visit_num = 0;
                }
                ExtentOp::PrevSib => {
                    let path = &mut self.path[self.level];
                    let Some(curr) = path.curr else {
                        return Err(Errno::ESRCH);
                    };
                    if path.left + 1 >= path.entries {
                        return Err(Errno::ESRCH);
                    }
                    path.curr = Some(curr - 1);
                    path.left += 1;
                    if self.level < self.max_depth {
                        path.visit_num = 1;
                    }
                }
                ExtentOp::LastSib => {
                    let path = &mut self.path[self.level];
                    path.curr = Some(path.entries - 1);
                    path.left = 0;
                    path.visit_num = 0;
                }
                ExtentOp::Up => {
                    if self.level == 0 {
                        return Err(Errno::EINVAL);
                    }
                    self.level -= 1;
                    let path = &mut self.path[self.level];
                    if path.curr.is_none() {
                        return Err(Errno::ENOENT);
                    }
                    if matches!(orig_op, ExtentOp::Prev | ExtentOp::PrevLeaf) {
                        path.visit_num = 0;
                    }
                }
                ExtentOp::Down | ExtentOp::DownLast => {
                    if self.path[self.level].curr.is_none() || self.level >= self.max_depth {
                        return Err(Errno::EINVAL);
                    }
                    let parent = &self.path[self.level];
                    let curr = parent.curr.ok_or(Errno::ENOENT)?;
                    let (_, block) = read_index(&parent.buffer, curr);
                    let parent_left = parent.left;
                    let parent_end = parent.end_block;
                    let next_sib_lblk = if parent_left > 0 {
                        Some(read_index(&parent.buffer, curr + 1).0)
                    } else {
                        None
                    };

                    let mut buf = vec![0u8; fs.blksize as usize];
                    fs.read_blocks(&mut buf, block, 1)?;
                    extent_header_valid(&buf, fs.blksize as usize)?;
                    if !fs.extent_block_checksum_valid(self.ino, &buf) {
                        fail_csum = true;
                    }

                    self.level += 1;
                    let entries = eh_entries(&buf) as i32;
                    let child = &mut self.path[self.level];
                    child.max_entries = eh_max(&buf) as i32;
                    child.entries = entries;
                    child.buffer = buf;
                    child.end_block = next_sib_lblk.unwrap_or(parent_end);
                    if op == ExtentOp::Down {
                        child.curr = Some(0);
                        child.left = entries - 1;
                        child.visit_num = 0;
                    } else {
                        child.curr = Some(entries - 1);
                        child.left = 0;
                        child.visit_num = if self.level < self.max_depth { 1 } else { 0 };
                    }
                }
                _ => return Err(Errno::EINVAL),
            }

            let path = &self.path[self.level];
            let Some(curr) = path.curr else {
                return Err(Errno::ENOENT);
            };

            let mut extent;
            if self.at_leaf() {
                extent = read_extent(&path.buffer, curr);
                extent.e_flags |= EXTENT_FLAGS_LEAF;
                if extent.e_len > INIT_MAX_LEN {
                    extent.e_len -= INIT_MAX_LEN;
                    extent.e_flags |= EXTENT_FLAGS_UNINIT;
                }
            } else {
                let (lblk, child) = read_index(&path.buffer, curr);
                let endblock = if path.left > 0 {
                    read_index(&path.buffer, curr + 1).0
                } else {
                    path.end_block
                };
                extent = GenExtent {
                    e_pblk: child,
                    e_lblk: lblk,
                    e_len: endblock.saturating_sub(lblk) as u32,
                    e_flags: 0,
                };
            }
            if path.visit_num > 0 {
                extent.e_flags |= EXTENT_FLAGS_SECOND_VISIT;
            }

            if matches!(orig_op, ExtentOp::NextLeaf | ExtentOp::PrevLeaf) && !self.at_leaf() {
                continue 'retry;
            }
            if orig_op == ExtentOp::LastLeaf && (!self.at_leaf() || path.left != 0) {
                continue 'retry;
            }
            if fail_csum {
                return Err(Errno::EUCLEAN);
            }
            return Ok(extent);
        }
    }

    /// Positions the handle on the entry covering `block`, `leaf_level`
    /// levels above the leaves. `ENOENT` if no entry covers it.
    pub fn goto_block(&mut self, fs: &mut Ext2Fs, leaf_level: usize, block: u64) -> Result<()> {
        let mut extent = match self.get(fs, ExtentOp::Root) {
            Ok(e) => e,
            Err(Errno::ESRCH) => return Err(Errno::ENOENT),
            Err(e) => return Err(e),
        };
        if leaf_level > self.max_depth {
            return Err(Errno::ENOTSUP);
        }

        loop {
            if self.max_depth - self.level == leaf_level {
                if block >= extent.e_lblk && block < extent.e_lblk + extent.e_len as u64 {
                    return Ok(());
                }
                if block < extent.e_lblk {
                    let _ = self.get(fs, ExtentOp::PrevSib);
                    return Err(Errno::ENOENT);
                }
                extent = match self.get(fs, ExtentOp::NextSib) {
                    Ok(e) => e,
                    Err(Errno::ESRCH) => return Err(Errno::ENOENT),
                    Err(e) => return Err(e),
                };
                continue;
            }

            match self.get(fs, ExtentOp::NextSib) {
                Ok(e) => {
                    if block == e.e_lblk {
                        // Descend through this entry.
                    } else if block > e.e_lblk {
                        extent = e;
                        continue;
                    } else {
                        self.get(fs, ExtentOp::PrevSib)?;
                    }
                }
                Err(Errno::ESRCH) => {}
                Err(e) => return Err(e),
            }
            extent = self.get(fs, ExtentOp::Down)?;
        }
    }

    /// Reports the handle position and format limits.
    pub fn get_info(&self) -> ExtentInfo {
        let path = &self.path[self.level];
        ExtentInfo {
            curr_entry: path.curr.map_or(0, |c| c + 1),
            curr_level: self.level as i32,
            num_entries: path.entries,
            max_entries: path.max_entries,
            max_depth: self.max_depth as i32,
            bytes_avail: (path.max_entries - path.entries) * ENTRY_SIZE as i32,
            max_lblk: MAX_EXTENT_LBLK,
            max_pblk: MAX_EXTENT_PBLK,
            max_len: INIT_MAX_LEN,
            max_uninit_len: UNINIT_MAX_LEN,
        }
    }

    /// Whether every level to the root sits on its last entry (inserting
    /// at end of file).
    fn splitting_at_eof(&self) -> bool {
        if self.level == 0 {
            return false;
        }
        for path in self.path[..=self.level].iter().rev() {
            if path.left > 0 {
                return false;
            }
        }
        true
    }

    /// Splits the current node, promoting a new root when the root itself
    /// is full. `can_expand` enables the end-of-file fast path that moves a
    /// single entry instead of half the node.
    pub fn node_split(&mut self, fs: &mut Ext2Fs, can_expand: bool) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let extent = self.get(fs, ExtentOp::Current)?;
        let info = self.get_info();
        let orig_height = (info.max_depth - info.curr_level) as usize;
        let orig_block = extent.e_lblk;

        // Pick an allocation goal near the node's first mapping.
        let path = &self.path[self.level];
        let mut goal_block = if self.at_leaf() {
            if path.entries > 0 {
                read_extent(&path.buffer, 0).e_pblk
            } else {
                0
            }
        } else if path.entries > 0 {
            read_index(&path.buffer, 0).1
        } else {
            0
        };
        if goal_block >= fs.cluster_ratio() {
            goal_block -= fs.cluster_ratio();
        }
        goal_block &= !fs.cluster_mask();

        // A full parent must split first so the new index entry fits.
        if self.level > 0
            && self.path[self.level - 1].entries >= self.path[self.level - 1].max_entries
        {
            self.get(fs, ExtentOp::Up)?;
            self.node_split(fs, can_expand)?;
            self.goto_block(fs, orig_height, orig_block)?;
        }

        let path = &self.path[self.level];
        if path.curr.is_none() {
            return Err(Errno::ENOENT);
        }
        let no_balance = if can_expand { self.splitting_at_eof() } else { false };

        let new_root = self.level == 0;
        let to_copy = if new_root {
            path.entries
        } else if no_balance {
            1
        } else {
            path.entries / 2
        };
        if to_copy == 0 && !no_balance {
            return Err(Errno::ENOSPC);
        }

        if goal_block == 0 {
            let inode_copy = self.inode;
            goal_block = fs.find_inode_goal(self.ino, Some(&inode_copy), 0);
        }
        let new_node_block = fs.alloc_block(goal_block)?;

        // Build the new node from the right half of the current one.
        let path = &self.path[self.level];
        let mut new_buf = vec![0u8; fs.blksize as usize];
        let node_max = ((fs.blksize as usize - EH_SIZE) / ENTRY_SIZE) as u16;
        new_buf[..EH_SIZE].copy_from_slice(&path.buffer[..EH_SIZE]);
        set_eh_entries(&mut new_buf, to_copy as u16);
        set_eh_max(&mut new_buf, node_max);
        let from = entry_off(path.entries - to_copy);
        let count = to_copy as usize * ENTRY_SIZE;
        new_buf[EH_SIZE..EH_SIZE + count].copy_from_slice(&path.buffer[from..from + count]);
        let new_node_start = if eh_depth(&new_buf) == 0 {
            read_extent(&new_buf, 0).e_lblk
        } else {
            read_index(&new_buf, 0).0
        };
        fs.extent_block_checksum_update(self.ino, &mut new_buf)?;
        fs.write_blocks(&new_buf, new_node_block, 1)?;

        if new_root {
            // The root keeps a single index entry pointing at the new node.
            self.path.push(ExtentPath::empty());
            self.max_depth += 1;
            let depth = self.max_depth as u16;
            let path = &mut self.path[0];
            path.entries = 1;
            path.left = path.max_entries - 1;
            set_eh_depth(&mut path.buffer, depth);
            set_eh_entries(&mut path.buffer, 1);
        } else {
            let path = &mut self.path[self.level];
            path.entries -= to_copy;
            path.left -= to_copy;
            let entries = path.entries as u16;
            set_eh_entries(&mut path.buffer, entries);
        }
        self.update_path(fs)?;

        if new_root {
            let end_block = self.path[0].end_block;
            self.get(fs, ExtentOp::FirstSib)?;
            let extent = GenExtent {
                e_lblk: new_node_start,
                e_pblk: new_node_block,
                e_len: (end_block - new_node_start) as u32,
                e_flags: 0,
            };
            self.replace(fs, 0, &extent)?;
        } else {
            let mut parent = self.get(fs, ExtentOp::Up)?;
            let new_node_len = new_node_start - parent.e_lblk;
            parent.e_len -= new_node_len as u32;
            self.replace(fs, 0, &parent)?;
            let extent = GenExtent {
                e_lblk: new_node_start,
                e_pblk: new_node_block,
                e_len: new_node_len as u32,
                e_flags: 0,
            };
            self.insert(fs, EXTENT_INSERT_AFTER, &extent)?;
        }

        self.goto_block(fs, orig_height, orig_block)?;
        fs.iblk_add_blocks(&mut self.inode, 1)?;
        let inode = self.inode;
        fs.update_inode(self.ino, &inode)
    }

    /// Propagates a lowered starting block of the current entry into the
    /// parent index entries.
    pub fn fix_parents(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        if self.path[self.level].curr.is_none() {
            return Err(Errno::ENOENT);
        }
        let extent = self.get(fs, ExtentOp::Current)?;
        let start = extent.e_lblk;
        let info = self.get_info();
        let orig_height = (info.max_depth - info.curr_level) as usize;

        while self.level > 0
            && self.path[self.level].left == self.path[self.level].entries - 1
        {
            let mut up = self.get(fs, ExtentOp::Up)?;
            if up.e_lblk == start {
                break;
            }
            up.e_len += (up.e_lblk - start) as u32;
            up.e_lblk = start;
            self.replace(fs, 0, &up)?;
            self.update_path(fs)?;
        }
        self.goto_block(fs, orig_height, start)
    }

    /// Inserts `extent` at (or after) the current position, splitting the
    /// node if it is full.
    pub fn insert(&mut self, fs: &mut Ext2Fs, flags: u32, extent: &GenExtent) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        if self.path[self.level].entries >= self.path[self.level].max_entries {
            if flags & EXTENT_INSERT_NOSPLIT != 0 {
                return Err(Errno::ENOSPC);
            }
            self.node_split(fs, true)?;
        }

        let path = &mut self.path[self.level];
        let index = match path.curr {
            Some(curr) => {
                if flags & EXTENT_INSERT_AFTER != 0 {
                    path.left -= 1;
                    curr + 1
                } else {
                    curr
                }
            }
            None => {
                path.left = -1;
                0
            }
        };
        path.curr = Some(index);

        if path.left >= 0 {
            // Shift the tail of the node one entry to the right.
            let from = entry_off(index);
            let to = entry_off(index + 1);
            let bytes = (path.left + 1) as usize * ENTRY_SIZE;
            path.buffer.copy_within(from..from + bytes, to);
        }
        path.left += 1;
        path.entries += 1;
        let entries = path.entries as u16;
        set_eh_entries(&mut path.buffer, entries);

        if let Err(e) = self.replace(fs, 0, extent) {
            let _ = self.delete(fs, 0);
            return Err(e);
        }
        if let Err(e) = self.update_path(fs) {
            let _ = self.delete(fs, 0);
            return Err(e);
        }
        Ok(())
    }

    /// Rewrites the current entry.
    pub fn replace(&mut self, fs: &mut Ext2Fs, _flags: u32, extent: &GenExtent) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let at_leaf = self.at_leaf();
        let path = &mut self.path[self.level];
        let Some(curr) = path.curr else {
            return Err(Errno::ENOENT);
        };
        if at_leaf {
            let len = if extent.e_flags & EXTENT_FLAGS_UNINIT != 0 {
                if extent.e_len > UNINIT_MAX_LEN {
                    return Err(Errno::EUCLEAN);
                }
                (extent.e_len + INIT_MAX_LEN) as u16
            } else {
                if extent.e_len > INIT_MAX_LEN {
                    return Err(Errno::EUCLEAN);
                }
                extent.e_len as u16
            };
            write_extent(&mut path.buffer, curr, extent.e_lblk, extent.e_pblk, len);
        } else {
            write_index(&mut path.buffer, curr, extent.e_lblk, extent.e_pblk);
        }
        self.update_path(fs)
    }

    /// Removes the current entry, collapsing interior nodes that empty out
    /// and freeing their blocks.
    pub fn delete(&mut self, fs: &mut Ext2Fs, flags: u32) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let path = &mut self.path[self.level];
        let Some(curr) = path.curr else {
            return Err(Errno::ENOENT);
        };

        if path.left > 0 {
            let from = entry_off(curr + 1);
            let to = entry_off(curr);
            let bytes = path.left as usize * ENTRY_SIZE;
            path.buffer.copy_within(from..from + bytes, to);
            path.left -= 1;
        } else if curr == 0 {
            path.curr = None;
        } else {
            path.curr = Some(curr - 1);
        }
        path.entries -= 1;
        if path.entries == 0 {
            path.curr = None;
        }

        if path.entries == 0 && self.level > 0 {
            if flags & EXTENT_DELETE_KEEP_EMPTY == 0 {
                let up = self.get(fs, ExtentOp::Up)?;
                self.delete(fs, flags)?;
                self.inode.i_blocks -=
                    (fs.blksize as u64 * fs.cluster_ratio() / 512) as u32;
                let inode = self.inode;
                fs.update_inode(self.ino, &inode)?;
                fs.block_alloc_stats(up.e_pblk, -1);
            }
            Ok(())
        } else {
            let path = &mut self.path[self.level];
            let entries = path.entries as u16;
            set_eh_entries(&mut path.buffer, entries);
            if path.entries == 0 && self.level == 0 {
                set_eh_depth(&mut path.buffer, 0);
                self.max_depth = 0;
            }
            self.update_path(fs)
        }
    }

    /// Extent-tree flavour of `bmap`.
    pub fn bmap(
        &mut self,
        fs: &mut Ext2Fs,
        flags: u32,
        block: u64,
        phys_in: u64,
        retflags: &mut u32,
        blocks_alloc: &mut u32,
    ) -> Result<u64> {
        let set_flags = if flags & BMAP_UNINIT != 0 {
            EXTENT_SET_BMAP_UNINIT
        } else {
            0
        };
        if flags & BMAP_SET != 0 {
            self.set_bmap(fs, block, phys_in, set_flags)?;
            return Ok(phys_in);
        }

        let mut physblock = 0u64;
        let mut extent = GenExtent::default();
        let mut found = true;
        match self.goto_block(fs, 0, block) {
            Ok(()) => {
                extent = self.get(fs, ExtentOp::Current)?;
                let offset = block - extent.e_lblk;
                if block >= extent.e_lblk && offset <= extent.e_len as u64 {
                    physblock = extent.e_pblk + offset;
                    if extent.e_flags & EXTENT_FLAGS_UNINIT != 0 {
                        *retflags |= BMAP_RET_UNINIT;
                    }
                }
            }
            Err(Errno::ENOENT) => {
                found = false;
                extent.e_lblk = block;
            }
            Err(e) => return Err(e),
        }
        let _ = found;

        if physblock == 0 && flags & BMAP_ALLOC != 0 {
            // Prefer the block after the previous mapping as the goal.
            let mut goal = 0u64;
            if block > 0 {
                let mut ignored = 0u32;
                if let Ok(prev) = self.bmap(fs, 0, block - 1, 0, &mut ignored, blocks_alloc) {
                    goal = prev;
                }
            }
            if goal == 0 {
                let inode_copy = self.inode;
                goal = fs.find_inode_goal(self.ino, Some(&inode_copy), block);
            }
            let mut b = fs.alloc_block(goal)?;
            b &= !fs.cluster_mask();
            b += fs.cluster_mask() & block;
            if let Err(e) = self.set_bmap(fs, block, b, set_flags) {
                fs.block_alloc_stats(b, -1);
                return Err(e);
            }
            self.inode = fs.read_inode(self.ino)?;
            *blocks_alloc += 1;
            physblock = b;
        }
        Ok(physblock)
    }

    /// Records `logical -> physical`, extending an adjacent extent when the
    /// run lines up or inserting (and possibly splitting) otherwise.
    /// A zero `physical` unmaps the block.
    pub fn set_bmap(
        &mut self,
        fs: &mut Ext2Fs,
        logical: u64,
        physical: u64,
        flags: u32,
    ) -> Result<()> {
        if fs.mflags.contains(pml_fs::MountFlags::RDONLY) {
            return Err(Errno::EROFS);
        }
        let new_uninit = flags & EXTENT_SET_BMAP_UNINIT != 0;
        let max_len = if new_uninit { UNINIT_MAX_LEN } else { INIT_MAX_LEN };

        let mut new_extent = GenExtent {
            e_len: 1,
            e_pblk: physical,
            e_lblk: logical,
            e_flags: EXTENT_FLAGS_LEAF,
        };
        if new_uninit {
            new_extent.e_flags |= EXTENT_FLAGS_UNINIT;
        }

        if self.max_depth == 0 && self.path[0].entries == 0 {
            if physical != 0 {
                return self.insert(fs, 0, &new_extent);
            }
            return Ok(());
        }

        let mut extent = match self.get(fs, ExtentOp::Current) {
            Ok(e) => e,
            Err(Errno::ENOENT) => GenExtent::default(),
            Err(e) => return Err(e),
        };
        let info = self.get_info();
        let mut orig_height = (info.max_depth - info.curr_level) as usize;
        let orig_block = extent.e_lblk;

        let mut mapped = true;
        match self.goto_block(fs, 0, logical) {
            Ok(()) => {}
            Err(Errno::ENOENT) => {
                mapped = false;
                if physical == 0 {
                    return self.restore_position(fs, &mut orig_height, orig_block);
                }
            }
            Err(e) => return Err(e),
        }
        if mapped {
            extent = self.get(fs, ExtentOp::Current)?;
        } else if self.path[self.level].curr.is_some() {
            extent = self.get(fs, ExtentOp::Current)?;
        }
        let extent_uninit = extent.e_flags & EXTENT_FLAGS_UNINIT != 0;

        // Probe the neighbours for merge opportunities.
        let (has_next, next_extent, next_uninit) = match self.get(fs, ExtentOp::NextLeaf) {
            Ok(e) => (true, e, e.e_flags & EXTENT_FLAGS_UNINIT != 0),
            Err(Errno::ESRCH) => (false, GenExtent::default(), false),
            Err(e) => return Err(e),
        };
        match self.goto_block(fs, 0, logical) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(e),
        }
        let (has_prev, prev_extent, prev_uninit) = match self.get(fs, ExtentOp::PrevLeaf) {
            Ok(e) => (true, e, e.e_flags & EXTENT_FLAGS_UNINIT != 0),
            Err(Errno::ESRCH) => (false, GenExtent::default(), false),
            Err(e) => return Err(e),
        };
        match self.goto_block(fs, 0, logical) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(e),
        }

        let result = (|| -> Result<()> {
            if mapped
                && new_uninit == extent_uninit
                && extent.e_pblk + logical - extent.e_lblk == physical
            {
                return Ok(());
            }

            if !mapped {
                // The block falls outside every extent; extend a neighbour
                // or insert a fresh single-block extent.
                if logical == extent.e_lblk + extent.e_len as u64
                    && physical == extent.e_pblk + extent.e_len as u64
                    && new_uninit == extent_uninit
                    && extent.e_len < max_len - 1
                {
                    let mut grown = extent;
                    grown.e_len += 1;
                    self.replace(fs, 0, &grown)?;
                } else if logical == extent.e_lblk.wrapping_sub(1)
                    && physical == extent.e_pblk.wrapping_sub(1)
                    && new_uninit == extent_uninit
                    && extent.e_len < max_len - 1
                {
                    let mut grown = extent;
                    grown.e_len += 1;
                    grown.e_lblk -= 1;
                    grown.e_pblk -= 1;
                    self.replace(fs, 0, &grown)?;
                } else if has_next
                    && logical == next_extent.e_lblk.wrapping_sub(1)
                    && physical == next_extent.e_pblk.wrapping_sub(1)
                    && new_uninit == next_uninit
                    && next_extent.e_len < max_len - 1
                {
                    let mut grown = self.get(fs, ExtentOp::NextLeaf)?;
                    grown.e_len += 1;
                    grown.e_lblk -= 1;
                    grown.e_pblk -= 1;
                    self.replace(fs, 0, &grown)?;
                } else if logical < extent.e_lblk {
                    self.insert(fs, 0, &new_extent)?;
                } else {
                    self.insert(fs, EXTENT_INSERT_AFTER, &new_extent)?;
                }
                self.fix_parents(fs)?;
            } else if logical == extent.e_lblk && extent.e_len == 1 {
                // Exactly one block: replace or delete.
                if physical != 0 {
                    self.replace(fs, 0, &new_extent)?;
                } else {
                    self.delete(fs, 0)?;
                    match self.fix_parents(fs) {
                        Ok(()) | Err(Errno::ENOENT) => {}
                        Err(e) => return Err(e),
                    }
                }
            } else if logical == extent.e_lblk + extent.e_len as u64 - 1 {
                // Trailing block of the extent.
                if physical != 0 {
                    if has_next
                        && logical == next_extent.e_lblk.wrapping_sub(1)
                        && physical == next_extent.e_pblk.wrapping_sub(1)
                        && new_uninit == next_uninit
                        && next_extent.e_len < max_len - 1
                    {
                        let mut grown = self.get(fs, ExtentOp::NextLeaf)?;
                        grown.e_len += 1;
                        grown.e_lblk -= 1;
                        grown.e_pblk -= 1;
                        self.replace(fs, 0, &grown)?;
                    } else {
                        self.insert(fs, EXTENT_INSERT_AFTER, &new_extent)?;
                    }
                    self.fix_parents(fs)?;
                    self.goto_block(fs, 0, logical)?;
                    extent = self.get(fs, ExtentOp::Current)?;
                }
                extent.e_len -= 1;
                self.replace(fs, 0, &extent)?;
            } else if logical == extent.e_lblk {
                // Leading block of the extent.
                if physical != 0 {
                    if has_prev
                        && logical == prev_extent.e_lblk + prev_extent.e_len as u64
                        && physical == prev_extent.e_pblk + prev_extent.e_len as u64
                        && new_uninit == prev_uninit
                        && prev_extent.e_len < max_len - 1
                    {
                        let mut grown = self.get(fs, ExtentOp::PrevLeaf)?;
                        grown.e_len += 1;
                        self.replace(fs, 0, &grown)?;
                    } else {
                        self.insert(fs, 0, &new_extent)?;
                    }
                    self.fix_parents(fs)?;
                    extent = self.get(fs, ExtentOp::NextLeaf)?;
                }
                extent.e_pblk += 1;
                extent.e_lblk += 1;
                extent.e_len -= 1;
                self.replace(fs, 0, &extent)?;
                self.fix_parents(fs)?;
            } else {
                // Interior block: split the extent around it.
                let save_extent = extent;
                let save_len = extent.e_len;
                let save_block = extent.e_lblk;
                let mut head = extent;
                head.e_len = (logical - extent.e_lblk) as u32;
                self.replace(fs, 0, &head)?;
                if physical != 0 {
                    if let Err(e) = self.insert(fs, EXTENT_INSERT_AFTER, &new_extent) {
                        if self.goto_block(fs, 0, save_block).is_ok() {
                            let _ = self.replace(fs, 0, &save_extent);
                        }
                        return Err(e);
                    }
                }
                let mut tail = head;
                tail.e_pblk += head.e_len as u64 + 1;
                tail.e_lblk += head.e_len as u64 + 1;
                tail.e_len = save_len - head.e_len - 1;
                if let Err(e) = self.insert(fs, EXTENT_INSERT_AFTER, &tail) {
                    if physical != 0 && self.goto_block(fs, 0, new_extent.e_lblk).is_ok() {
                        let _ = self.delete(fs, 0);
                    }
                    if self.goto_block(fs, 0, save_block).is_ok() {
                        let _ = self.replace(fs, 0, &save_extent);
                    }
                    return Err(e);
                }
            }
            Ok(())
        })();

        self.restore_position(fs, &mut orig_height, orig_block)?;
        result
    }

    fn restore_position(
        &mut self,
        fs: &mut Ext2Fs,
        orig_height: &mut usize,
        orig_block: u64,
    ) -> Result<()> {
        if *orig_height > self.max_depth {
            *orig_height = self.max_depth;
        }
        match self.goto_block(fs, *orig_height, orig_block) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Ext2Fs {
    /// Frees the cluster range behind a truncated extent, accounting each
    /// freed block.
    fn extent_dealloc_range(
        &mut self,
        ino: u32,
        inode: &mut Ext2Inode,
        mut lfree_start: u64,
        mut free_start: u64,
        mut free_count: u64,
        freed: &mut u64,
    ) -> Result<()> {
        if self.cluster_ratio() == 1 {
            *freed += free_count;
            while free_count > 0 {
                self.block_alloc_stats(free_start, -1);
                free_start += 1;
                free_count -= 1;
            }
            return Ok(());
        }

        // BIGALLOC: only free a cluster when no other block of it maps.
        if free_start & self.cluster_mask() != 0 {
            let block = self.map_cluster_block(ino, inode, lfree_start)?;
            if block == 0 {
                self.block_alloc_stats(free_start, -1);
                *freed += 1;
            }
        }
        while free_count > 0 && free_count >= self.cluster_ratio() {
            self.block_alloc_stats(free_start, -1);
            *freed += 1;
            let step = self.cluster_ratio();
            free_count -= step;
            free_start += step;
            lfree_start += step;
        }
        if free_count > 0 {
            let block = self.map_cluster_block(ino, inode, lfree_start)?;
            if block == 0 {
                self.block_alloc_stats(free_start, -1);
                *freed += 1;
            }
        }
        Ok(())
    }

    /// Checks whether any other block of `block`'s cluster is mapped.
    fn map_cluster_block(&mut self, ino: u32, inode: &mut Ext2Inode, block: u64) -> Result<u64> {
        if self.cluster_ratio() == 1 || !inode.uses_extents() {
            return Ok(0);
        }
        let mut handle = ExtentHandle::open(self, ino, inode)?;
        let base = block & !self.cluster_mask();
        for i in 0..self.cluster_ratio() {
            if base + i == block {
                continue;
            }
            let mut retflags = 0;
            let mut alloc = 0;
            if let Ok(pblk) = handle.bmap(self, 0, base + i, 0, &mut retflags, &mut alloc) {
                if pblk != 0 {
                    return Ok(pblk - i + block - base);
                }
            }
        }
        Ok(0)
    }

    /// Truncates the logical range `[start, end]` out of an extent tree,
    /// splitting a straddling extent and freeing the covered blocks.
    pub fn extent_dealloc_blocks(
        &mut self,
        ino: u32,
        inode: &mut Ext2Inode,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let mut handle = ExtentHandle::open(self, ino, inode)?;
        let mut freed = 0u64;

        let _ = handle.goto_block(self, 0, start);
        let mut extent = match handle.get(self, ExtentOp::Current) {
            Ok(e) => e,
            Err(Errno::ENOENT) => {
                *inode = handle.into_inode();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        loop {
            let mut op = ExtentOp::NextLeaf;
            let next = extent.e_lblk + extent.e_len as u64;
            let free_start;
            let lfree_start;
            let free_count;

            if start <= extent.e_lblk {
                if end < extent.e_lblk {
                    break;
                }
                // Range swallows the head (or all) of this extent.
                free_start = extent.e_pblk;
                lfree_start = extent.e_lblk;
                free_count = if next > end {
                    end - extent.e_lblk + 1
                } else {
                    extent.e_len as u64
                };
                extent.e_len -= free_count as u32;
                extent.e_lblk += free_count;
                extent.e_pblk += free_count;
            } else if end >= next - 1 {
                if start >= next {
                    // Disjoint; move on.
                    extent = match handle.get(self, op) {
                        Ok(e) => e,
                        Err(Errno::ESRCH) | Err(Errno::ENOENT) => break,
                        Err(e) => return Err(e),
                    };
                    continue;
                }
                // Range swallows the tail.
                let newlen = start - extent.e_lblk;
                free_start = extent.e_pblk + newlen;
                lfree_start = extent.e_lblk + newlen;
                free_count = extent.e_len as u64 - newlen;
                extent.e_len = newlen as u32;
            } else {
                // Range is strictly inside: split off the surviving tail.
                let tail = GenExtent {
                    e_pblk: extent.e_pblk + end + 1 - extent.e_lblk,
                    e_lblk: end + 1,
                    e_len: (next - end - 1) as u32,
                    e_flags: extent.e_flags,
                };
                extent.e_len = (start - extent.e_lblk) as u32;
                free_start = extent.e_pblk + extent.e_len as u64;
                lfree_start = extent.e_lblk + extent.e_len as u64;
                free_count = end - start + 1;

                handle.insert(self, EXTENT_INSERT_AFTER, &tail)?;
                handle.fix_parents(self)?;
                handle.goto_block(self, 0, extent.e_lblk)?;
            }

            if extent.e_len > 0 {
                handle.replace(self, 0, &extent)?;
                handle.fix_parents(self)?;
            } else {
                // The whole extent went away; delete and stand on whatever
                // follows it.
                let here = handle.get(self, ExtentOp::Current)?;
                let old_block = here.e_lblk;
                let next_block = match handle.get(self, ExtentOp::NextLeaf) {
                    Ok(e) => e.e_lblk,
                    Err(Errno::ESRCH) => old_block,
                    Err(e) => return Err(e),
                };
                handle.goto_block(self, 0, old_block)?;
                handle.delete(self, 0)?;
                match handle.fix_parents(self) {
                    Ok(()) | Err(Errno::ENOENT) => {}
                    Err(e) => return Err(e),
                }
                let _ = handle.goto_block(self, 0, next_block);
                op = ExtentOp::Current;
            }

            {
                let mut inode_copy = handle.inode;
                self.extent_dealloc_range(
                    ino,
                    &mut inode_copy,
                    lfree_start,
                    free_start,
                    free_count,
                    &mut freed,
                )?;
                handle.inode = inode_copy;
            }

            extent = match handle.get(self, op) {
                Ok(e) => e,
                Err(Errno::ESRCH) | Err(Errno::ENOENT) => break,
                Err(e) => return Err(e),
            };
        }

        let mut result = handle.into_inode();
        self.iblk_sub_blocks(&mut result, freed)?;
        *inode = result;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs;
    use pml_fs::mode::S_IFREG;
    use pml_fs::MountFlags;

    fn extent_file(fs: &mut Ext2Fs) -> (u32, Ext2Inode) {
        fs.read_bitmaps().unwrap();
        let ino = fs.new_inode(crate::EXT2_ROOT_INO).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Ext2Inode::default();
        inode.i_mode = (S_IFREG | 0o644) as u16;
        inode.i_links_count = 1;
        inode.i_flags = EXT4_EXTENTS_FL;
        inode.i_size = 1 << 20;
        fs.write_new_inode(ino, &mut inode).unwrap();
        (ino, inode)
    }

    fn open_extents() -> (crate::Ext2Fs, u32, Ext2Inode) {
        let img = testfs::mkfs_extents(4 * 1024 * 1024);
        let mut fs = crate::Ext2Fs::open(img, MountFlags::empty()).unwrap();
        let (ino, inode) = extent_file(&mut fs);
        (fs, ino, inode)
    }

    #[test]
    fn open_initializes_empty_root() {
        let (mut fs, ino, mut inode) = open_extents();
        inode.i_flags = 0;
        inode.i_block = [0; 15];
        let handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        assert!(inode.uses_extents());
        assert_eq!(handle.max_depth, 0);
        let inode2 = handle.into_inode();
        assert_eq!(
            u16::from_le_bytes([
                inode2.i_block[0].to_le_bytes()[0],
                inode2.i_block[0].to_le_bytes()[1]
            ]),
            EXT3_EXTENT_MAGIC
        );
    }

    #[test]
    fn header_validation() {
        let mut buf = [0u8; 60];
        write_header(&mut buf, 0, 4, 0);
        assert!(extent_header_valid(&buf, 60).is_ok());
        set_eh_entries(&mut buf, 5);
        assert!(extent_header_valid(&buf, 60).is_err());
        set_eh_entries(&mut buf, 0);
        set_eh_max(&mut buf, 1);
        assert!(extent_header_valid(&buf, 60).is_err());
    }

    #[test]
    fn set_bmap_then_lookup() {
        let (mut fs, ino, mut inode) = open_extents();
        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        let blocks: Vec<u64> = (0..3).map(|_| fs.alloc_block(0).unwrap()).collect();
        for (i, &b) in blocks.iter().enumerate() {
            handle.set_bmap(&mut fs, i as u64 * 10, b, 0).unwrap();
        }
        for (i, &b) in blocks.iter().enumerate() {
            let mut retflags = 0;
            let mut alloc = 0;
            let got = handle
                .bmap(&mut fs, 0, i as u64 * 10, 0, &mut retflags, &mut alloc)
                .unwrap();
            assert_eq!(got, b, "mapping {i}");
        }
        // An unmapped hole reads as zero.
        let mut retflags = 0;
        let mut alloc = 0;
        assert_eq!(
            handle.bmap(&mut fs, 0, 5, 0, &mut retflags, &mut alloc).unwrap(),
            0
        );
    }

    #[test]
    fn adjacent_mappings_extend_one_extent() {
        let (mut fs, ino, mut inode) = open_extents();
        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        // Allocate a contiguous run by hand.
        let base = fs.alloc_block(100).unwrap();
        for i in 1..4 {
            let b = fs.alloc_block(base + i - 1).unwrap();
            assert_eq!(b, base + i);
        }
        for i in 0..4u64 {
            handle.set_bmap(&mut fs, i, base + i, 0).unwrap();
        }
        handle.goto_block(&mut fs, 0, 0).unwrap();
        let extent = handle.get(&mut fs, ExtentOp::Current).unwrap();
        assert_eq!(extent.e_lblk, 0);
        assert_eq!(extent.e_len, 4);
        assert_eq!(extent.e_pblk, base);
    }

    #[test]
    fn root_split_promotes_depth() {
        let (mut fs, ino, mut inode) = open_extents();
        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        // The root holds 4 entries; 6 disjoint single-block extents force a
        // split and a depth promotion.
        for i in 0..6u64 {
            let b = fs.alloc_block(200 + i * 7).unwrap();
            handle.set_bmap(&mut fs, i * 100, b, 0).unwrap();
        }
        assert_eq!(handle.max_depth, 1);
        // Every mapping is still resolvable.
        for i in 0..6u64 {
            let mut retflags = 0;
            let mut alloc = 0;
            let got = handle
                .bmap(&mut fs, 0, i * 100, 0, &mut retflags, &mut alloc)
                .unwrap();
            assert_ne!(got, 0, "mapping {i}");
        }
        // And the on-disk inode agrees after reopening.
        let inode2 = handle.into_inode();
        fs.update_inode(ino, &inode2).unwrap();
        let mut inode3 = fs.read_inode(ino).unwrap();
        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode3).unwrap();
        let mut retflags = 0;
        let mut alloc = 0;
        assert_ne!(
            handle.bmap(&mut fs, 0, 500, 0, &mut retflags, &mut alloc).unwrap(),
            0
        );
    }

    #[test]
    fn uninit_extents_round_trip() {
        let (mut fs, ino, mut inode) = open_extents();
        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        let b = fs.alloc_block(0).unwrap();
        handle
            .set_bmap(&mut fs, 40, b, EXTENT_SET_BMAP_UNINIT)
            .unwrap();
        let mut retflags = 0;
        let mut alloc = 0;
        let got = handle.bmap(&mut fs, 0, 40, 0, &mut retflags, &mut alloc).unwrap();
        assert_eq!(got, b);
        assert_eq!(retflags & BMAP_RET_UNINIT, BMAP_RET_UNINIT);
    }

    #[test]
    fn dealloc_range_splits_straddling_extent() {
        let (mut fs, ino, mut inode) = open_extents();
        {
            let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
            let base = fs.alloc_block(300).unwrap();
            for i in 1..8 {
                let b = fs.alloc_block(base + i - 1).unwrap();
                assert_eq!(b, base + i);
            }
            for i in 0..8u64 {
                handle.set_bmap(&mut fs, i, base + i, 0).unwrap();
            }
            inode = handle.into_inode();
            fs.update_inode(ino, &inode).unwrap();
        }

        let free_before = fs.sb.free_blocks_count();
        // Punch blocks 2..=4 out of the middle.
        fs.extent_dealloc_blocks(ino, &mut inode, 2, 4).unwrap();
        assert_eq!(fs.sb.free_blocks_count(), free_before + 3);

        let mut handle = ExtentHandle::open(&mut fs, ino, &mut inode).unwrap();
        for (lblk, expect_hole) in
            [(0u64, false), (1, false), (2, true), (3, true), (4, true), (5, false), (7, false)]
        {
            let mut retflags = 0;
            let mut alloc = 0;
            let got = handle
                .bmap(&mut fs, 0, lblk, 0, &mut retflags, &mut alloc)
                .unwrap();
            assert_eq!(got == 0, expect_hole, "block {lblk}");
        }
    }
}
