//! Block device contract.
//!
//! Storage drivers expose byte-addressed reads and writes; filesystems sit
//! directly on top. Partitions are linear slices of a parent device.

extern crate alloc;

use alloc::sync::Arc;

use pml_core::{Errno, Result};

/// Byte-addressed block device interface.
///
/// `read`/`write` return the number of bytes transferred; short transfers
/// only happen at the end of the device.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len()` bytes starting at byte `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf.len()` bytes starting at byte `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Size of the device's native block (512 for ATA).
    fn block_size(&self) -> usize {
        512
    }

    /// Total capacity in bytes.
    fn capacity(&self) -> u64;
}

/// Reads exactly `buf.len()` bytes or fails with `EIO`.
pub fn read_exact(dev: &dyn BlockDevice, buf: &mut [u8], offset: u64) -> Result<()> {
    if dev.read(buf, offset)? != buf.len() {
        return Err(Errno::EIO);
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes or fails with `EIO`.
pub fn write_exact(dev: &dyn BlockDevice, buf: &[u8], offset: u64) -> Result<()> {
    if dev.write(buf, offset)? != buf.len() {
        return Err(Errno::EIO);
    }
    Ok(())
}

/// A partition: a linear byte slice of a parent device.
pub struct Partition {
    parent: Arc<dyn BlockDevice>,
    /// Byte offset of the partition start.
    start: u64,
    /// Length of the partition in bytes.
    len: u64,
}

impl Partition {
    /// Creates a slice `[start, start + len)` of `parent`.
    pub fn new(parent: Arc<dyn BlockDevice>, start: u64, len: u64) -> Result<Self> {
        if start + len > parent.capacity() {
            return Err(Errno::EINVAL);
        }
        Ok(Self { parent, start, len })
    }

    fn clamp(&self, len: usize, offset: u64) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        Ok(len.min((self.len - offset) as usize))
    }
}

impl BlockDevice for Partition {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.clamp(buf.len(), offset)?;
        self.parent.read(&mut buf[..n], self.start + offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let n = self.clamp(buf.len(), offset)?;
        self.parent.write(&buf[..n], self.start + offset)
    }

    fn block_size(&self) -> usize {
        self.parent.block_size()
    }

    fn capacity(&self) -> u64 {
        self.len
    }
}
