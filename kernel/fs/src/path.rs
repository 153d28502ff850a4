//! Path resolution.
//!
//! Walks `/`-separated components from the root or a working directory,
//! consulting each directory's resolved-children map before delegating to
//! the filesystem's `lookup`. Symbolic links are followed up to a fixed
//! depth when requested.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use pml_core::{Errno, Result};

use crate::perm;
use crate::vnode::{Vnode, VnodeType};
use crate::Cred;

/// Maximum symlink resolution depth.
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

/// Splits a path into components, ignoring empty segments.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Resolves one component inside `dir`, handling `.` and `..` before
/// delegating to the filesystem.
pub fn lookup_child(dir: &Arc<Vnode>, name: &str, cred: &Cred) -> Result<Arc<Vnode>> {
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    perm::can_read(dir, cred, false)?;
    if name.len() > NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    if name == "." {
        return Ok(dir.clone());
    }
    if name == ".." {
        // The filesystem root is its own parent.
        return Ok(dir.parent_vnode().unwrap_or_else(|| dir.clone()));
    }
    if let Some(child) = dir.cached_child(name) {
        return Ok(child);
    }
    let child = dir.ops.lookup(dir, name)?;
    dir.add_child(name, &child);
    Ok(child)
}

fn read_link_target(vp: &Vnode) -> Result<String> {
    let mut buf = [0u8; NAME_MAX + 1];
    let len = vp.ops.readlink(vp, &mut buf)?;
    core::str::from_utf8(&buf[..len])
        .map(String::from)
        .map_err(|_| Errno::EINVAL)
}

struct Walk<'a> {
    root: &'a Arc<Vnode>,
    cred: &'a Cred,
    depth: usize,
}

impl Walk<'_> {
    fn resolve(&mut self, start: &Arc<Vnode>, path: &str, follow_last: bool) -> Result<Arc<Vnode>> {
        let mut current = if is_absolute(path) {
            self.root.clone()
        } else {
            start.clone()
        };
        let parts: Vec<&str> = components(path).collect();
        for (i, name) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            let next = lookup_child(&current, name, self.cred)?;
            let is_link = next.attr.lock().vtype == VnodeType::Symlink;
            if is_link && (!last || follow_last) {
                if self.depth >= MAX_SYMLINK_DEPTH {
                    return Err(Errno::ELOOP);
                }
                self.depth += 1;
                let target = read_link_target(&next)?;
                current = self.resolve(&current, &target, true)?;
                continue;
            }
            current = next;
        }
        Ok(current)
    }
}

/// Resolves `path` to a vnode.
///
/// Relative paths start at `cwd`; `follow` controls whether a trailing
/// symlink is followed.
pub fn namei(
    root: &Arc<Vnode>,
    cwd: &Arc<Vnode>,
    path: &str,
    cred: &Cred,
    follow: bool,
) -> Result<Arc<Vnode>> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    let mut walk = Walk { root, cred, depth: 0 };
    walk.resolve(cwd, path, follow)
}

/// Resolves everything but the final component.
///
/// Returns the parent directory vnode and the final name, for create-style
/// operations. Fails with `EEXIST`-adjacent semantics left to the caller.
pub fn namei_parent<'p>(
    root: &Arc<Vnode>,
    cwd: &Arc<Vnode>,
    path: &'p str,
    cred: &Cred,
) -> Result<(Arc<Vnode>, &'p str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Errno::EINVAL);
    }
    let (dir_part, name) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    if name.len() > NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    let dir = if dir_part.is_empty() {
        if is_absolute(path) {
            root.clone()
        } else {
            cwd.clone()
        }
    } else {
        namei(root, cwd, dir_part, cred, true)?
    };
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{S_IFDIR, S_IFLNK, S_IFREG};
    use crate::vnode::VnodeOps;
    use alloc::boxed::Box;

    /// Tiny in-memory filesystem: lookups are served from a fixed table of
    /// (dir ino, name) -> (ino, mode, link target).
    struct FakeOps;

    fn entries() -> &'static [(u64, &'static str, u64, u32, &'static str)] {
        &[
            (2, "usr", 10, S_IFDIR | 0o755, ""),
            (10, "bin", 11, S_IFDIR | 0o755, ""),
            (11, "cc", 12, S_IFREG | 0o755, ""),
            (2, "link", 20, S_IFLNK | 0o777, "/usr/bin"),
            (2, "loop", 21, S_IFLNK | 0o777, "/loop"),
            (2, "secret", 30, S_IFDIR | 0o700, ""),
        ]
    }

    impl VnodeOps for FakeOps {
        fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
            for (d, n, ino, mode, _) in entries() {
                if *d == dir.ino && *n == name {
                    let vp = Vnode::new(*ino, Box::new(FakeOps), None);
                    let mut attr = vp.attr.lock();
                    attr.mode = *mode;
                    attr.vtype = VnodeType::from_mode(*mode);
                    attr.uid = if *ino == 30 { 500 } else { 0 };
                    drop(attr);
                    return Ok(vp);
                }
            }
            Err(Errno::ENOENT)
        }

        fn readlink(&self, vp: &Vnode, buf: &mut [u8]) -> Result<usize> {
            for (_, _, ino, _, target) in entries() {
                if *ino == vp.ino && !target.is_empty() {
                    buf[..target.len()].copy_from_slice(target.as_bytes());
                    return Ok(target.len());
                }
            }
            Err(Errno::EINVAL)
        }
    }

    fn fake_root() -> Arc<Vnode> {
        let root = Vnode::new(2, Box::new(FakeOps), None);
        let mut attr = root.attr.lock();
        attr.mode = S_IFDIR | 0o755;
        attr.vtype = VnodeType::Directory;
        drop(attr);
        root
    }

    #[test]
    fn absolute_walk() {
        let root = fake_root();
        let cred = Cred { uid: 1, euid: 1, gid: 1, egid: 1 };
        let vp = namei(&root, &root, "/usr/bin/cc", &cred, true).unwrap();
        assert_eq!(vp.ino, 12);
    }

    #[test]
    fn dot_and_dotdot() {
        let root = fake_root();
        let cred = Cred::root();
        let usr = namei(&root, &root, "/usr", &cred, true).unwrap();
        let back = namei(&root, &usr, "./../usr/bin/..", &cred, true).unwrap();
        assert_eq!(back.ino, 10);
        // `..` at the root stays at the root.
        let top = namei(&root, &root, "/..", &cred, true).unwrap();
        assert_eq!(top.ino, 2);
    }

    #[test]
    fn symlink_followed_mid_path() {
        let root = fake_root();
        let cred = Cred::root();
        let vp = namei(&root, &root, "/link/cc", &cred, true).unwrap();
        assert_eq!(vp.ino, 12);
        // Trailing symlink respected or not.
        let nofollow = namei(&root, &root, "/link", &cred, false).unwrap();
        assert_eq!(nofollow.ino, 20);
        let follow = namei(&root, &root, "/link", &cred, true).unwrap();
        assert_eq!(follow.ino, 11);
    }

    #[test]
    fn symlink_loop_is_eloop() {
        let root = fake_root();
        assert_eq!(
            namei(&root, &root, "/loop", &Cred::root(), true),
            Err(Errno::ELOOP)
        );
    }

    #[test]
    fn permission_denied_stops_walk() {
        let root = fake_root();
        let cred = Cred { uid: 1, euid: 1, gid: 1, egid: 1 };
        let secret = namei(&root, &root, "/secret", &cred, true).unwrap();
        assert_eq!(secret.ino, 30);
        assert_eq!(
            namei(&root, &secret, "anything", &cred, true),
            Err(Errno::EACCES)
        );
    }

    #[test]
    fn parent_resolution() {
        let root = fake_root();
        let cred = Cred::root();
        let (dir, name) = namei_parent(&root, &root, "/usr/bin/newfile", &cred).unwrap();
        assert_eq!(dir.ino, 11);
        assert_eq!(name, "newfile");
        let (dir, name) = namei_parent(&root, &root, "top", &cred).unwrap();
        assert_eq!(dir.ino, 2);
        assert_eq!(name, "top");
        let long = "x".repeat(300);
        assert_eq!(
            namei_parent(&root, &root, &long, &cred).unwrap_err(),
            Errno::ENAMETOOLONG
        );
    }
}
