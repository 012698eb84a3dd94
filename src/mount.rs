//! The mount table: longest-prefix path → backend dispatch (§4.4 C8).
//!
//! Grounded directly on `vfs::mount::MountPoint`/`MountTable` (`mount`/
//! `unmount`/`resolve`/`for_each_child_mount`), generalized from a fixed
//! `[MountPoint; MAX_MOUNTS]` array to a `Vec`, and `parking_lot::RwLock`
//! replacing the teacher's `IrqRwLock` (§5.1).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{already_exists, invalid_argument, not_found, VfsResult};
use crate::fstrait::FileSystem;
use crate::pathutil::normalize;

struct MountPoint {
    path: String,
    fs: Arc<dyn FileSystem>,
}

/// Longest-prefix mapping from absolute path to a mounted backend.
pub struct MountTable {
    mounts: RwLock<Vec<MountPoint>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
        }
    }

    pub fn mount(&self, path: &str, fs: Arc<dyn FileSystem>) -> VfsResult<()> {
        if !path.starts_with('/') {
            return Err(invalid_argument().with_path(path));
        }
        let normalized = normalize(path);
        let mut mounts = self.mounts.write();
        if normalized == "/" {
            mounts.retain(|m| m.path != "/");
        } else if mounts.iter().any(|m| m.path == normalized) {
            return Err(already_exists().with_path(path));
        }
        mounts.push(MountPoint {
            path: normalized,
            fs,
        });
        Ok(())
    }

    pub fn unmount(&self, path: &str) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut mounts = self.mounts.write();
        let before = mounts.len();
        mounts.retain(|m| m.path != normalized);
        if mounts.len() == before {
            return Err(not_found().with_path(path));
        }
        Ok(())
    }

    /// Resolve `path` to its mounted backend and the path local to that
    /// mount, picking the mount with the longest matching path-component
    /// prefix (root `/` always matches as the fallback).
    pub fn resolve(&self, path: &str) -> VfsResult<(Arc<dyn FileSystem>, String)> {
        let normalized = normalize(path);
        let mounts = self.mounts.read();
        let mut best: Option<(&MountPoint, usize)> = None;
        for mp in mounts.iter() {
            let matches = if mp.path == "/" {
                true
            } else if normalized == mp.path {
                true
            } else {
                normalized.starts_with(&mp.path) && normalized.as_bytes().get(mp.path.len()) == Some(&b'/')
            };
            if matches && best.map_or(true, |(_, len)| mp.path.len() > len) {
                best = Some((mp, mp.path.len()));
            }
        }
        let (mp, match_len) = best.ok_or_else(|| not_found().with_path(path))?;
        let relative = if mp.path == "/" {
            normalized.clone()
        } else if normalized.len() == match_len {
            "/".to_string()
        } else {
            normalized[match_len..].to_string()
        };
        Ok((mp.fs.clone(), relative))
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.read().len()
    }

    /// Visit every mount whose path is a direct child of `parent_path`, so
    /// `readdir` on a directory that is itself a mount point can synthesize
    /// entries for mounted children (§9.1 supplemented feature, grounded on
    /// `vfs::mount::MountTable::for_each_child_mount`).
    pub fn for_each_child_mount(&self, parent_path: &str, mut callback: impl FnMut(&str)) -> usize {
        let parent = normalize(parent_path);
        let mounts = self.mounts.read();
        let mut count = 0;
        for mp in mounts.iter() {
            if mp.path == parent {
                continue;
            }
            let child = if parent == "/" {
                mp.path.strip_prefix('/')
            } else {
                mp.path
                    .strip_prefix(&parent)
                    .and_then(|rest| rest.strip_prefix('/'))
            };
            let Some(child) = child else { continue };
            if child.is_empty() || child.contains('/') {
                continue;
            }
            callback(child);
            count += 1;
        }
        count
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::storefs::StoreFS;

    fn fs() -> Arc<dyn FileSystem> {
        Arc::new(StoreFS::new(MemStore::new(), 0, 0).unwrap())
    }

    #[test]
    fn resolve_picks_longest_matching_prefix() {
        let table = MountTable::new();
        table.mount("/", fs()).unwrap();
        table.mount("/mnt", fs()).unwrap();
        table.mount("/mnt/data", fs()).unwrap();

        let (_, rel) = table.resolve("/mnt/data/file.txt").unwrap();
        assert_eq!(rel, "/file.txt");

        let (_, rel) = table.resolve("/mnt/other").unwrap();
        assert_eq!(rel, "/other");

        let (_, rel) = table.resolve("/elsewhere").unwrap();
        assert_eq!(rel, "/elsewhere");
    }

    #[test]
    fn remounting_root_replaces_the_existing_root_mount() {
        let table = MountTable::new();
        table.mount("/", fs()).unwrap();
        table.mount("/", fs()).unwrap();
        assert_eq!(table.mount_count(), 1);
    }

    #[test]
    fn mounting_same_non_root_path_twice_fails() {
        let table = MountTable::new();
        table.mount("/mnt", fs()).unwrap();
        assert!(table.mount("/mnt", fs()).is_err());
    }

    #[test]
    fn unmount_removes_the_mount() {
        let table = MountTable::new();
        table.mount("/", fs()).unwrap();
        table.mount("/tmp", fs()).unwrap();
        table.unmount("/tmp").unwrap();
        assert_eq!(table.mount_count(), 1);
    }

    #[test]
    fn for_each_child_mount_lists_direct_children_only() {
        let table = MountTable::new();
        table.mount("/", fs()).unwrap();
        table.mount("/mnt", fs()).unwrap();
        table.mount("/mnt/data", fs()).unwrap();
        table.mount("/var/lib", fs()).unwrap();

        let mut children = Vec::new();
        table.for_each_child_mount("/", |c| children.push(c.to_string()));
        children.sort();
        assert_eq!(children, vec!["mnt"]);

        let mut children = Vec::new();
        table.for_each_child_mount("/mnt", |c| children.push(c.to_string()));
        assert_eq!(children, vec!["data"]);
    }
}
