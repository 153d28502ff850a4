//! File descriptor tables.
//!
//! Open files live in a system-wide slot table; each process maps small
//! integers onto those slots. `dup` bumps the slot's reference count, and
//! dropping the last reference releases the vnode and clears the slot.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};

use crate::vnode::Vnode;
use crate::OpenFlags;

/// Capacity of the system file descriptor table.
pub const SYSTEM_FD_TABLE_SIZE: usize = 65536;

/// Default size of a fresh per-process fd table.
pub const FD_TABLE_DEFAULT_SIZE: usize = 64;

/// Default soft limit on per-process file descriptors.
pub const FD_TABLE_DEFAULT_MAX: usize = 256;

/// One entry in the system file descriptor table.
#[derive(Default)]
pub struct SysFile {
    /// Open vnode; `None` marks the slot free.
    pub vnode: Option<Arc<Vnode>>,
    /// Absolute path the file was opened with.
    pub path: String,
    /// Current file offset, shared by dup'ed descriptors.
    pub offset: u64,
    /// Flags the file was opened with.
    pub flags: OpenFlags,
    /// Number of process descriptors referencing this slot.
    pub count: usize,
}

/// The system-wide open file table.
pub struct SystemFdTable {
    slots: Vec<SysFile>,
    /// Index to start free-slot searches from.
    cursor: usize,
}

impl SystemFdTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            cursor: 0,
        }
    }

    /// Finds a free slot, growing the table up to its fixed capacity.
    ///
    /// The slot is not considered allocated until a vnode is bound with
    /// [`fill`](Self::fill), so an abandoned reservation needs no cleanup.
    pub fn alloc(&mut self) -> Result<usize> {
        while self.cursor < self.slots.len() {
            if self.slots[self.cursor].vnode.is_none() {
                return Ok(self.cursor);
            }
            self.cursor += 1;
        }
        if self.slots.len() >= SYSTEM_FD_TABLE_SIZE {
            return Err(Errno::ENFILE);
        }
        self.slots.push(SysFile::default());
        Ok(self.slots.len() - 1)
    }

    /// Binds a vnode to a reserved slot.
    pub fn fill(&mut self, slot: usize, vnode: Arc<Vnode>, path: &str, flags: OpenFlags) {
        let file = &mut self.slots[slot];
        file.vnode = Some(vnode);
        file.path = String::from(path);
        file.offset = 0;
        file.flags = flags;
        file.count = 1;
    }

    /// Accesses a bound slot.
    pub fn get(&self, slot: usize) -> Result<&SysFile> {
        let file = self.slots.get(slot).ok_or(Errno::EBADF)?;
        if file.vnode.is_none() {
            return Err(Errno::EBADF);
        }
        Ok(file)
    }

    /// Mutable access to a bound slot.
    pub fn get_mut(&mut self, slot: usize) -> Result<&mut SysFile> {
        let file = self.slots.get_mut(slot).ok_or(Errno::EBADF)?;
        if file.vnode.is_none() {
            return Err(Errno::EBADF);
        }
        Ok(file)
    }

    /// Adds a reference to a slot (dup, fork).
    pub fn reference(&mut self, slot: usize) {
        self.slots[slot].count += 1;
    }

    /// Drops a reference; the last one releases the vnode and the slot.
    pub fn release(&mut self, slot: usize) {
        let file = &mut self.slots[slot];
        if file.count == 0 {
            return;
        }
        file.count -= 1;
        if file.count == 0 {
            *file = SysFile::default();
            if slot < self.cursor {
                self.cursor = slot;
            }
        }
    }
}

/// Global system file table.
static SYSTEM_FDS: SpinLock<SystemFdTable> = SpinLock::new(SystemFdTable::new());

/// Runs a closure with the locked system fd table.
pub fn with_system_fds<R>(f: impl FnOnce(&mut SystemFdTable) -> R) -> R {
    f(&mut SYSTEM_FDS.lock())
}

/// One per-process descriptor: a system slot plus the close-on-exec bit.
#[derive(Debug, Clone, Copy)]
pub struct ProcFile {
    /// Index into the system fd table.
    pub slot: usize,
    /// Whether this descriptor closes across `execve`.
    pub cloexec: bool,
}

/// Per-process file descriptor table.
pub struct FdTable {
    table: Vec<Option<ProcFile>>,
    /// Index to start free-descriptor searches from.
    cursor: usize,
    /// Soft limit the table may grow to.
    max_size: usize,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Creates an empty table at the default size and soft limit.
    pub fn new() -> Self {
        let mut table = Vec::new();
        table.resize_with(FD_TABLE_DEFAULT_SIZE, || None);
        Self {
            table,
            cursor: 0,
            max_size: FD_TABLE_DEFAULT_MAX,
        }
    }

    /// Current table size.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no descriptor is open.
    pub fn is_empty(&self) -> bool {
        self.table.iter().all(Option::is_none)
    }

    /// Allocates the lowest free descriptor, doubling the table up to the
    /// soft limit when needed.
    pub fn alloc(&mut self) -> Result<i32> {
        for fd in self.cursor..self.table.len() {
            if self.table[fd].is_none() {
                self.cursor = fd + 1;
                return Ok(fd as i32);
            }
        }
        if self.table.len() >= self.max_size {
            return Err(Errno::EMFILE);
        }
        let new_size = (self.table.len() * 2).min(self.max_size);
        let fd = self.table.len();
        self.table.resize_with(new_size, || None);
        self.cursor = fd + 1;
        Ok(fd as i32)
    }

    /// Binds a descriptor to a system slot.
    pub fn bind(&mut self, fd: i32, slot: usize, cloexec: bool) {
        self.table[fd as usize] = Some(ProcFile { slot, cloexec });
    }

    /// Resolves a descriptor to its system slot.
    pub fn get(&self, fd: i32) -> Result<ProcFile> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        self.table
            .get(fd as usize)
            .copied()
            .flatten()
            .ok_or(Errno::EBADF)
    }

    /// Sets or clears the close-on-exec bit.
    pub fn set_cloexec(&mut self, fd: i32, cloexec: bool) -> Result<()> {
        let entry = self
            .table
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(Errno::EBADF)?;
        entry.cloexec = cloexec;
        Ok(())
    }

    /// Closes a descriptor, dropping its system-slot reference.
    pub fn close(&mut self, fd: i32) -> Result<()> {
        let entry = self.get(fd)?;
        self.table[fd as usize] = None;
        if (fd as usize) < self.cursor {
            self.cursor = fd as usize;
        }
        with_system_fds(|sys| sys.release(entry.slot));
        Ok(())
    }

    /// Duplicates `fd` onto the lowest free descriptor.
    pub fn dup(&mut self, fd: i32) -> Result<i32> {
        let entry = self.get(fd)?;
        let new_fd = self.alloc()?;
        with_system_fds(|sys| sys.reference(entry.slot));
        self.bind(new_fd, entry.slot, false);
        Ok(new_fd)
    }

    /// Duplicates `fd` onto `new_fd`, closing `new_fd` first if open.
    pub fn dup2(&mut self, fd: i32, new_fd: i32, cloexec: bool) -> Result<i32> {
        let entry = self.get(fd)?;
        if new_fd < 0 || new_fd as usize >= self.max_size {
            return Err(Errno::EBADF);
        }
        if fd == new_fd {
            return Ok(new_fd);
        }
        if new_fd as usize >= self.table.len() {
            let new_size = ((new_fd as usize) + 1).min(self.max_size);
            self.table.resize_with(new_size, || None);
        }
        if self.table[new_fd as usize].is_some() {
            self.close(new_fd)?;
        }
        with_system_fds(|sys| sys.reference(entry.slot));
        self.bind(new_fd, entry.slot, cloexec);
        Ok(new_fd)
    }

    /// Copies the table for `fork`, adding a reference per open descriptor.
    pub fn fork_copy(&self) -> Self {
        let mut copy = Self {
            table: self.table.clone(),
            cursor: self.cursor,
            max_size: self.max_size,
        };
        with_system_fds(|sys| {
            for entry in copy.table.iter().flatten() {
                sys.reference(entry.slot);
            }
        });
        copy
    }

    /// Closes every descriptor marked close-on-exec.
    pub fn close_cloexec(&mut self) {
        for fd in 0..self.table.len() as i32 {
            if matches!(self.table[fd as usize], Some(e) if e.cloexec) {
                let _ = self.close(fd);
            }
        }
    }

    /// Closes everything (process exit).
    pub fn close_all(&mut self) {
        for fd in 0..self.table.len() as i32 {
            if self.table[fd as usize].is_some() {
                let _ = self.close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnode::VnodeOps;
    use alloc::boxed::Box;

    struct NullOps;
    impl VnodeOps for NullOps {}

    fn open_file(fds: &mut FdTable, name: &str) -> i32 {
        let vp = Vnode::new(1, Box::new(NullOps), None);
        let slot = with_system_fds(|sys| {
            let slot = sys.alloc().unwrap();
            sys.fill(slot, vp, name, OpenFlags::empty());
            slot
        });
        let fd = fds.alloc().unwrap();
        fds.bind(fd, slot, false);
        fd
    }

    #[test]
    fn lowest_free_descriptor() {
        let mut fds = FdTable::new();
        let a = open_file(&mut fds, "/a");
        let b = open_file(&mut fds, "/b");
        assert_eq!((a, b), (0, 1));
        fds.close(a).unwrap();
        let c = open_file(&mut fds, "/c");
        assert_eq!(c, 0);
    }

    #[test]
    fn dup_shares_slot_and_count() {
        let mut fds = FdTable::new();
        let a = open_file(&mut fds, "/a");
        let b = fds.dup(a).unwrap();
        let slot = fds.get(a).unwrap().slot;
        assert_eq!(fds.get(b).unwrap().slot, slot);
        assert_eq!(with_system_fds(|sys| sys.get(slot).unwrap().count), 2);
        fds.close(a).unwrap();
        assert_eq!(with_system_fds(|sys| sys.get(slot).unwrap().count), 1);
        fds.close(b).unwrap();
        assert!(with_system_fds(|sys| sys.get(slot).is_err()));
    }

    #[test]
    fn dup2_closes_destination() {
        let mut fds = FdTable::new();
        let a = open_file(&mut fds, "/a");
        let b = open_file(&mut fds, "/b");
        let slot_b = fds.get(b).unwrap().slot;
        fds.dup2(a, b, false).unwrap();
        assert_eq!(fds.get(b).unwrap().slot, fds.get(a).unwrap().slot);
        assert!(with_system_fds(|sys| sys.get(slot_b).is_err()));
    }

    #[test]
    fn cloexec_closed_on_exec() {
        let mut fds = FdTable::new();
        let a = open_file(&mut fds, "/a");
        let b = open_file(&mut fds, "/b");
        fds.set_cloexec(b, true).unwrap();
        fds.close_cloexec();
        assert!(fds.get(a).is_ok());
        assert_eq!(fds.get(b).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn fork_copy_bumps_counts() {
        let mut fds = FdTable::new();
        let a = open_file(&mut fds, "/a");
        let slot = fds.get(a).unwrap().slot;
        let mut child = fds.fork_copy();
        assert_eq!(with_system_fds(|sys| sys.get(slot).unwrap().count), 2);
        child.close_all();
        assert_eq!(with_system_fds(|sys| sys.get(slot).unwrap().count), 1);
        fds.close_all();
    }

    #[test]
    fn table_doubles_to_soft_limit() {
        let mut fds = FdTable::new();
        let mut opened = Vec::new();
        for _ in 0..FD_TABLE_DEFAULT_MAX {
            opened.push(open_file(&mut fds, "/x"));
        }
        assert_eq!(fds.alloc().unwrap_err(), Errno::EMFILE);
        for fd in opened {
            fds.close(fd).unwrap();
        }
    }
}
