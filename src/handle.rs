//! Open-file handle and the per-context file-descriptor table (§4.4 FD
//! allocation, §4.5 C10 Handle).
//!
//! Grounded on `fileio::FileDescriptor`/`FileTableSlot` (reserved low-FD
//! convention, fixed per-process descriptor array), generalized from a fixed
//! `[FileDescriptor; FILEIO_MAX_OPEN_FILES]` array to a growable `Vec`, since
//! this crate has no compile-time capacity bound (§9.1 supplemented
//! feature).

use std::sync::Arc;

use crate::error::{bad_fd, not_permitted, VfsResult};
use crate::flags::{inode_flags, OpenFlags};
use crate::fstrait::FileSystem;
use crate::ino::Ino;

/// Lowest file descriptor handed out; slots below this are conventionally
/// reserved for stdio-like uses even though this crate doesn't wire them up
/// itself (§4.4 "reserving 0-3 for stdio-like slots").
pub const RESERVED_FD_SLOTS: i32 = 4;

/// An open file reference: owning FS, both the user-facing and backend-local
/// path, the resolved inode, flags, cursor, and dirty/closed state.
pub struct Handle {
    pub fs: Arc<dyn FileSystem>,
    pub user_path: String,
    pub backend_path: String,
    pub ino: Ino,
    pub flags: OpenFlags,
    position: u64,
    dirty: bool,
    closed: bool,
}

impl Handle {
    pub fn new(fs: Arc<dyn FileSystem>, user_path: String, backend_path: String, ino: Ino, flags: OpenFlags) -> Self {
        Self {
            fs,
            user_path,
            backend_path,
            ino,
            flags,
            position: 0,
            dirty: false,
            closed: false,
        }
    }

    /// The position callers observe. Append-mode handles always see the
    /// current file size, per §4.5 "Effective position".
    pub fn effective_position(&self) -> VfsResult<u64> {
        if self.flags.append {
            Ok(self.fs.stat(self.ino)?.size)
        } else {
            Ok(self.position)
        }
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Flush dirty state and mark closed. Returns `EBADF` on double close
    /// (§4.5 "a double close yields EBADF").
    pub fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(bad_fd().with_syscall("close"));
        }
        if self.dirty {
            self.fs.sync()?;
            self.dirty = false;
        }
        self.closed = true;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let pos = self.effective_position()?;
        let n = self.fs.read(self.ino, pos, buf)?;
        self.position = pos + n as u64;
        let rec = self.fs.stat(self.ino)?;
        if rec.flags & inode_flags::NO_ATIME == 0 {
            self.fs.touch_atime(self.ino)?;
        }
        if self.flags.sync {
            self.fs.sync()?;
        }
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        let rec = self.fs.stat(self.ino)?;
        if rec.flags & inode_flags::IMMUTABLE != 0 {
            return Err(not_permitted().with_syscall("write"));
        }
        let pos = self.effective_position()?;
        let n = self.fs.write(self.ino, pos, buf)?;
        self.position = pos + n as u64;
        self.dirty = true;
        if self.flags.sync {
            self.fs.sync()?;
            self.dirty = false;
        }
        Ok(n)
    }

    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.fs.truncate(self.ino, size)?;
        self.dirty = true;
        Ok(())
    }
}

/// A growable table mapping small integer file descriptors to [`Handle`]s,
/// one per execution context. `open` assigns `max(max(existing)+1, 4)`
/// (§4.4); `close` frees the slot for reuse by a later, lower allocation.
#[derive(Default)]
pub struct FdTable {
    slots: Vec<Option<Handle>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// `max(max(existing)+1, 4)` over the currently *open* descriptors
    /// (§4.4) — a fd freed by `close` is reused only once it was the
    /// highest-numbered one open, not via a general lowest-free search.
    fn next_fd(&self) -> i32 {
        let highest = self
            .slots
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, slot)| slot.as_ref().map(|_| i as i32));
        (highest.map(|h| h + 1).unwrap_or(0)).max(RESERVED_FD_SLOTS)
    }

    pub fn insert(&mut self, handle: Handle) -> i32 {
        let fd = self.next_fd();
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(handle);
        fd
    }

    pub fn get(&self, fd: i32) -> VfsResult<&Handle> {
        if fd < 0 {
            return Err(bad_fd());
        }
        self.slots
            .get(fd as usize)
            .and_then(|s| s.as_ref())
            .ok_or_else(bad_fd)
    }

    pub fn get_mut(&mut self, fd: i32) -> VfsResult<&mut Handle> {
        if fd < 0 {
            return Err(bad_fd());
        }
        self.slots
            .get_mut(fd as usize)
            .and_then(|s| s.as_mut())
            .ok_or_else(bad_fd)
    }

    pub fn close(&mut self, fd: i32) -> VfsResult<()> {
        let handle = self.get_mut(fd)?;
        handle.close()?;
        self.slots[fd as usize] = None;
        Ok(())
    }

    pub fn len_open(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::storefs::StoreFS;

    fn test_handle(ino: Ino, flags: OpenFlags) -> Handle {
        let fs: Arc<dyn FileSystem> = Arc::new(StoreFS::new(MemStore::new(), 0, 0).unwrap());
        Handle::new(fs, "/f".to_string(), "/f".to_string(), ino, flags)
    }

    #[test]
    fn first_three_fds_are_never_handed_out() {
        let mut table = FdTable::new();
        let fd = table.insert(test_handle(0, OpenFlags::default()));
        assert_eq!(fd, RESERVED_FD_SLOTS);
    }

    #[test]
    fn closing_the_highest_fd_lets_it_be_reassigned() {
        let mut table = FdTable::new();
        let a = table.insert(test_handle(0, OpenFlags::default()));
        let b = table.insert(test_handle(0, OpenFlags::default()));
        assert_eq!(b, a + 1);
        table.close(b).unwrap();
        let c = table.insert(test_handle(0, OpenFlags::default()));
        assert_eq!(c, b);
    }

    #[test]
    fn closing_a_non_highest_fd_leaves_a_gap() {
        let mut table = FdTable::new();
        let a = table.insert(test_handle(0, OpenFlags::default()));
        let b = table.insert(test_handle(0, OpenFlags::default()));
        table.close(a).unwrap();
        let c = table.insert(test_handle(0, OpenFlags::default()));
        assert_eq!(c, b + 1);
        assert!(table.get(a).is_err());
    }

    #[test]
    fn double_close_is_ebadf() {
        let mut table = FdTable::new();
        let fd = table.insert(test_handle(0, OpenFlags::default()));
        table.close(fd).unwrap();
        assert!(table.close(fd).is_err());
    }

    #[test]
    fn get_on_unopened_fd_is_ebadf() {
        let table = FdTable::new();
        assert!(table.get(99).is_err());
    }
}
