//! Block devices and the device registry.
//!
//! Storage drivers (ATA glue, this RAM disk) register under names like
//! `sd0`; partitions register as `sd0p1` slices. Filesystems and the boot
//! `root=` option look devices up by name.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pml_core::sync::SpinLock;
use pml_core::{kinfo, Errno, Result};
use pml_fs::block::Partition;
use pml_fs::BlockDevice;

/// Byte-addressed RAM-backed block device.
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
}

impl RamDisk {
    /// Creates a zero-filled RAM disk of `size` bytes.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new(vec![0u8; size]),
        })
    }

    /// Creates a RAM disk from an existing image.
    pub fn from_image(image: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new(image),
        })
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

/// Name -> device and id -> name maps.
struct DeviceRegistry {
    by_name: BTreeMap<String, Arc<dyn BlockDevice>>,
    by_id: BTreeMap<u64, String>,
    next_id: u64,
}

static DEVICES: SpinLock<Option<DeviceRegistry>> = SpinLock::new(None);

/// Initializes the device maps. Called once from boot.
pub fn device_map_init() {
    let mut devices = DEVICES.lock();
    if devices.is_none() {
        *devices = Some(DeviceRegistry {
            by_name: BTreeMap::new(),
            by_id: BTreeMap::new(),
            next_id: 1,
        });
    }
}

/// Registers a block device under `name`, returning its device id.
pub fn register_device(name: &str, dev: Arc<dyn BlockDevice>) -> Result<u64> {
    let mut devices = DEVICES.lock();
    let registry = devices.as_mut().ok_or(Errno::ENXIO)?;
    if registry.by_name.contains_key(name) {
        return Err(Errno::EEXIST);
    }
    let id = registry.next_id;
    registry.next_id += 1;
    registry.by_name.insert(String::from(name), dev);
    registry.by_id.insert(id, String::from(name));
    kinfo!("device {} registered (id {})", name, id);
    Ok(id)
}

/// Looks up a device by name.
pub fn lookup_device(name: &str) -> Result<Arc<dyn BlockDevice>> {
    let devices = DEVICES.lock();
    let registry = devices.as_ref().ok_or(Errno::ENXIO)?;
    registry.by_name.get(name).cloned().ok_or(Errno::ENOENT)
}

/// Registers the partitions of `disk` as `<name>p<N>` slices.
///
/// `table` lists `(lba_offset, sectors)` pairs from the partition scan.
pub fn register_partitions(
    name: &str,
    disk: &Arc<dyn BlockDevice>,
    table: &[(u64, u64)],
) -> Result<()> {
    let sector = disk.block_size() as u64;
    for (index, (lba, len)) in table.iter().enumerate() {
        let part = Partition::new(disk.clone(), lba * sector, len * sector)?;
        let mut pname = String::from(name);
        pname.push('p');
        push_decimal(&mut pname, index as u64 + 1);
        register_device(&pname, Arc::new(part))?;
    }
    Ok(())
}

fn push_decimal(out: &mut String, mut value: u64) {
    let mut digits = [0u8; 20];
    let mut at = digits.len();
    loop {
        at -= 1;
        digits[at] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    for &d in &digits[at..] {
        out.push(d as char);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_roundtrip() {
        let disk = RamDisk::new(4096);
        assert_eq!(disk.write(b"abc", 100).unwrap(), 3);
        let mut buf = [0u8; 3];
        assert_eq!(disk.read(&mut buf, 100).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        // Reads past the end are short.
        let mut buf = [0u8; 8];
        assert_eq!(disk.read(&mut buf, 4094).unwrap(), 2);
    }

    #[test]
    fn registry_and_partitions() {
        device_map_init();
        let disk = RamDisk::new(64 * 1024);
        disk.write(b"xyzz", 512 * 10).unwrap();
        let disk: Arc<dyn BlockDevice> = disk;
        // Unique names per test run keep the shared registry happy.
        let _ = register_device("sdt0", disk.clone());
        register_partitions("sdt0", &disk, &[(10, 20), (30, 40)]).unwrap();

        let p1 = lookup_device("sdt0p1").unwrap();
        assert_eq!(p1.capacity(), 20 * 512);
        let mut buf = [0u8; 4];
        p1.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"xyzz");
        assert!(lookup_device("sdt0p3").is_err());
    }
}
