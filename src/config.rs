//! Runtime configuration for a [`crate::vfs::Vfs`] instance (§1.1 "Ambient
//! stack — Configuration").
//!
//! Rust-native equivalent of the teacher's compile-time `MAX_*` constants
//! (`MAX_MOUNTS`, `MAX_PATH_LEN`, `FILEIO_MAX_OPEN_FILES` in `fileio.rs`),
//! now runtime-configurable since this crate is not `no_std`/fixed-capacity.

/// Tunables governing path resolution, xattr policy, and resource limits.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Extended-attribute namespaces `xattr.set` accepts; anything else is
    /// `ENOTSUP` (§9 Open Question — xattr namespace policy).
    pub xattr_namespaces: Vec<String>,
    /// Symlink-follow recursion cap before `ELOOP` (§4.4 "~40 hops").
    pub max_symlink_depth: u32,
    /// Soft cap on simultaneously open handles per [`crate::handle::FdTable`];
    /// `None` means unbounded.
    pub max_open_files: Option<usize>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            xattr_namespaces: vec!["user".to_string()],
            max_symlink_depth: 40,
            max_open_files: None,
        }
    }
}

impl VfsConfig {
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.xattr_namespaces.iter().any(|ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_only_user_namespace() {
        let cfg = VfsConfig::default();
        assert!(cfg.allows_namespace("user"));
        assert!(!cfg.allows_namespace("security"));
    }
}
