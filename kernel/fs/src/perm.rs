//! Permission checks performed before dispatching to a filesystem.

use crate::mode::*;
use crate::vnode::Vnode;
use pml_core::{Errno, Result};

/// Credentials of the process performing an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cred {
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective group id.
    pub egid: u32,
}

impl Cred {
    /// Root credentials (boot-time kernel identity).
    pub const fn root() -> Self {
        Self { uid: 0, euid: 0, gid: 0, egid: 0 }
    }

    fn ids(&self, real: bool) -> (u32, u32) {
        if real {
            (self.uid, self.gid)
        } else {
            (self.euid, self.egid)
        }
    }
}

fn check_class(mode: u32, bit: u32) -> Result<()> {
    if mode & bit == 0 {
        return Err(Errno::EACCES);
    }
    Ok(())
}

/// Checks read access. Directories additionally need the execute bit on the
/// matching class.
pub fn can_read(vp: &Vnode, cred: &Cred, real: bool) -> Result<()> {
    let (uid, gid) = cred.ids(real);
    if uid == 0 {
        return Ok(());
    }
    let attr = vp.attr();
    let (r, x) = if attr.uid == uid {
        (S_IRUSR, S_IXUSR)
    } else if attr.gid == gid {
        (S_IRGRP, S_IXGRP)
    } else {
        (S_IROTH, S_IXOTH)
    };
    check_class(attr.mode, r)?;
    if is_dir(attr.mode) {
        check_class(attr.mode, x)?;
    }
    Ok(())
}

/// Checks write access with the same directory rule as [`can_read`].
pub fn can_write(vp: &Vnode, cred: &Cred, real: bool) -> Result<()> {
    let (uid, gid) = cred.ids(real);
    if uid == 0 {
        return Ok(());
    }
    let attr = vp.attr();
    let (w, x) = if attr.uid == uid {
        (S_IWUSR, S_IXUSR)
    } else if attr.gid == gid {
        (S_IWGRP, S_IXGRP)
    } else {
        (S_IWOTH, S_IXOTH)
    };
    check_class(attr.mode, w)?;
    if is_dir(attr.mode) {
        check_class(attr.mode, x)?;
    }
    Ok(())
}

/// Checks execute access.
///
/// Root may execute as long as any execute bit is set; everyone else needs
/// the bit of their class.
pub fn can_exec(vp: &Vnode, cred: &Cred, real: bool) -> Result<()> {
    let (uid, gid) = cred.ids(real);
    let attr = vp.attr();
    if uid == 0 {
        return check_class(attr.mode, S_IXUSR | S_IXGRP | S_IXOTH);
    }
    let x = if attr.uid == uid {
        S_IXUSR
    } else if attr.gid == gid {
        S_IXGRP
    } else {
        S_IXOTH
    };
    check_class(attr.mode, x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnode::{Vnode, VnodeOps};
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    struct NullOps;
    impl VnodeOps for NullOps {}

    fn vnode_with(mode: u32, uid: u32, gid: u32) -> Arc<Vnode> {
        let vp = Vnode::new(1, Box::new(NullOps), None);
        {
            let mut attr = vp.attr.lock();
            attr.mode = mode;
            attr.uid = uid;
            attr.gid = gid;
        }
        vp
    }

    #[test]
    fn owner_group_other_classes() {
        let vp = vnode_with(S_IFREG | 0o640, 100, 50);
        let owner = Cred { uid: 100, euid: 100, gid: 1, egid: 1 };
        let member = Cred { uid: 7, euid: 7, gid: 50, egid: 50 };
        let other = Cred { uid: 8, euid: 8, gid: 8, egid: 8 };
        assert!(can_read(&vp, &owner, false).is_ok());
        assert!(can_write(&vp, &owner, false).is_ok());
        assert!(can_read(&vp, &member, false).is_ok());
        assert_eq!(can_write(&vp, &member, false), Err(Errno::EACCES));
        assert_eq!(can_read(&vp, &other, false), Err(Errno::EACCES));
    }

    #[test]
    fn directory_requires_search_bit() {
        let vp = vnode_with(S_IFDIR | 0o600, 100, 50);
        let owner = Cred { uid: 100, euid: 100, gid: 50, egid: 50 };
        // Readable but not searchable.
        assert_eq!(can_read(&vp, &owner, false), Err(Errno::EACCES));
    }

    #[test]
    fn root_exec_needs_any_x_bit() {
        let vp = vnode_with(S_IFREG | 0o644, 100, 50);
        assert_eq!(can_exec(&vp, &Cred::root(), false), Err(Errno::EACCES));
        let vp = vnode_with(S_IFREG | 0o641, 100, 50);
        assert!(can_exec(&vp, &Cred::root(), false).is_ok());
    }

    #[test]
    fn real_vs_effective_ids() {
        let vp = vnode_with(S_IFREG | 0o600, 100, 50);
        let setuid = Cred { uid: 7, euid: 100, gid: 7, egid: 7 };
        assert!(can_read(&vp, &setuid, false).is_ok());
        assert_eq!(can_read(&vp, &setuid, true), Err(Errno::EACCES));
    }
}
