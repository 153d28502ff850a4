//! Hostname and system identification.

use pml_core::sync::SpinLock;
use pml_core::{Errno, Result};

use crate::proc::with_current;
use crate::VERSION;

/// Longest allowed hostname.
pub const HOST_NAME_MAX: usize = 64;

/// System identification strings.
#[derive(Debug, Clone)]
pub struct Utsname {
    pub sysname: [u8; 65],
    pub nodename: [u8; 65],
    pub release: [u8; 65],
    pub version: [u8; 65],
    pub machine: [u8; 65],
}

impl Default for Utsname {
    fn default() -> Self {
        Self {
            sysname: [0; 65],
            nodename: [0; 65],
            release: [0; 65],
            version: [0; 65],
            machine: [0; 65],
        }
    }
}

fn fill(field: &mut [u8; 65], value: &[u8]) {
    let n = value.len().min(64);
    field[..n].copy_from_slice(&value[..n]);
    field[n] = 0;
}

struct Hostname {
    bytes: [u8; HOST_NAME_MAX + 1],
    len: usize,
}

const fn initial_hostname() -> [u8; HOST_NAME_MAX + 1] {
    let mut bytes = [0u8; HOST_NAME_MAX + 1];
    let default = b"(none)";
    let mut i = 0;
    while i < default.len() {
        bytes[i] = default[i];
        i += 1;
    }
    bytes
}

/// The node name has no kernel-meaningful default; it starts as "(none)"
/// until `sethostname` is called.
static HOSTNAME: SpinLock<Hostname> = SpinLock::new(Hostname {
    bytes: initial_hostname(),
    len: 6,
});

/// `gethostname(2)`.
pub fn sys_gethostname(out: &mut [u8]) -> Result<usize> {
    let hostname = HOSTNAME.lock();
    if hostname.len >= out.len() {
        return Err(Errno::ENAMETOOLONG);
    }
    out[..hostname.len].copy_from_slice(&hostname.bytes[..hostname.len]);
    out[hostname.len] = 0;
    Ok(hostname.len)
}

/// `sethostname(2)`: root only, bounded length.
pub fn sys_sethostname(name: &[u8]) -> Result<()> {
    let euid = with_current(|p| p.euid);
    if euid != 0 {
        return Err(Errno::EPERM);
    }
    if name.len() > HOST_NAME_MAX {
        return Err(Errno::EINVAL);
    }
    let mut hostname = HOSTNAME.lock();
    hostname.bytes[..name.len()].copy_from_slice(name);
    hostname.bytes[name.len()] = 0;
    hostname.len = name.len();
    Ok(())
}

/// `uname(2)`.
pub fn sys_uname() -> Utsname {
    let mut uts = Utsname::default();
    fill(&mut uts.sysname, b"PML");
    {
        let hostname = HOSTNAME.lock();
        let len = hostname.len;
        let mut node = [0u8; HOST_NAME_MAX + 1];
        node[..len].copy_from_slice(&hostname.bytes[..len]);
        fill(&mut uts.nodename, &node[..len]);
    }
    fill(&mut uts.release, VERSION.as_bytes());
    fill(&mut uts.version, VERSION.as_bytes());
    fill(&mut uts.machine, b"x86_64");
    uts
}
