//! The common backend contract every file system variant implements.
//!
//! Generalizes the teacher's `vfs::traits::FileSystem` trait (same
//! `name`/`root_inode`/`lookup`/`stat`/`read`/`write`/`create`/`unlink`/
//! `readdir`/`truncate`/`rename`/`sync` shape) from `InodeId`/`FileStat` to
//! this crate's `Ino`/`InodeRecord`, and adds `link`/`set_attr` for the full
//! POSIX surface §4 requires.

use crate::error::not_supported;
use crate::error::VfsResult;
use crate::ino::{Ino, InodeRecord};

/// A backend capable of servicing path-addressed VFS operations once a path
/// has been resolved down to an inode id local to this backend.
///
/// Default method bodies return `ENOTSUP`/read-only so a minimal backend
/// (like a hypothetical read-only archive FS) only needs to implement the
/// handful of operations it actually supports.
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &'static str;
    fn root_ino(&self) -> Ino;
    fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino>;
    fn stat(&self, ino: Ino) -> VfsResult<InodeRecord>;
    fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize>;
    fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize>;
    fn create(&self, parent: Ino, name: &str, mode: u32) -> VfsResult<Ino>;
    fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()>;
    fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>>;

    fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        let _ = (ino, size);
        Err(not_supported())
    }

    fn rename(&self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        let _ = (old_parent, old_name, new_parent, new_name);
        Err(not_supported())
    }

    fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        let _ = (existing, new_parent, new_name);
        Err(not_supported())
    }

    fn set_attr(&self, ino: Ino, apply: &mut dyn FnMut(&mut InodeRecord)) -> VfsResult<()> {
        let _ = (ino, apply);
        Err(not_supported())
    }

    /// Update `atime` alone, without touching `ctime` (§4.5 "updates atime
    /// unless the inode/FS has no_atime"). Backends with no meaningful
    /// atime tracking (devices, overlays) may leave this a no-op.
    fn touch_atime(&self, ino: Ino) -> VfsResult<()> {
        let _ = ino;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn sync(&self) -> VfsResult<()> {
        Ok(())
    }
}
