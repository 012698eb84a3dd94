//! The pluggable key-value storage backend (§4.1).
//!
//! Every on-disk/in-memory representation a `StoreFS` or `IndexFS` sits on
//! implements [`Store`]; transactional callers go through [`Transaction`].
//! Grounded in shape on `devfs::DevFsInner`'s `IrqMutex`-guarded inner struct,
//! here `parking_lot::Mutex` replaces `IrqMutex` since this crate runs under
//! a normal OS thread, not inside an interrupt-disabled kernel context.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{bad_fd, not_found, not_supported, VfsResult};
use crate::ino::Ino;

/// A flat namespace mapping an inode id to an opaque byte blob.
///
/// Implementors need not be thread-safe themselves; callers serialize access
/// with their own lock (see `StoreFS`'s guarding `Mutex`).
pub trait Store: Send {
    fn get(&self, ino: Ino) -> VfsResult<Option<Vec<u8>>>;

    /// Write `bytes` under `ino`. If `overwrite` is false and `ino` already
    /// exists, returns `Ok(false)` without modifying the store (atomic
    /// create-if-absent, used by `commitNewFile`'s collision retry).
    fn put(&mut self, ino: Ino, bytes: Vec<u8>, overwrite: bool) -> VfsResult<bool>;

    fn remove(&mut self, ino: Ino) -> VfsResult<Option<Vec<u8>>>;

    fn contains(&self, ino: Ino) -> bool;

    fn clear(&mut self) -> VfsResult<()>;

    /// Begin a transaction over this store. Default implementation returns
    /// `ENOSYS`; stores that can't offer rollback need not implement it.
    fn begin(&mut self) -> VfsResult<Box<dyn Transaction + '_>> {
        Err(not_supported().with_syscall("begin"))
    }
}

/// A transaction accumulates pre-images so `abort` can restore the store to
/// its state at `begin()`, and `commit` makes writes visible atomically.
pub trait Transaction {
    fn get(&self, ino: Ino) -> VfsResult<Option<Vec<u8>>>;
    fn put(&mut self, ino: Ino, bytes: Vec<u8>, overwrite: bool) -> VfsResult<bool>;
    fn remove(&mut self, ino: Ino) -> VfsResult<Option<Vec<u8>>>;
    fn commit(self: Box<Self>) -> VfsResult<()>;
    fn abort(self: Box<Self>) -> VfsResult<()>;
}

/// Async variant of [`Store`] for backends whose I/O genuinely suspends
/// (network-backed KV stores). Sync-only stores inherit `ENOSYS` defaults and
/// need not implement any of these.
#[allow(async_fn_in_trait)]
pub trait AsyncStore: Send + Sync {
    async fn get_async(&self, _ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        Err(not_supported().with_syscall("get_async"))
    }

    async fn put_async(&self, _ino: Ino, _bytes: Vec<u8>, _overwrite: bool) -> VfsResult<bool> {
        Err(not_supported().with_syscall("put_async"))
    }

    async fn remove_async(&self, _ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        Err(not_supported().with_syscall("remove_async"))
    }
}

/// Reference in-memory `Store`, backing the default configuration and all
/// unit tests.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<HashMap<Ino, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Store for MemStore {
    fn get(&self, ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().get(&ino).cloned())
    }

    fn put(&mut self, ino: Ino, bytes: Vec<u8>, overwrite: bool) -> VfsResult<bool> {
        let mut guard = self.inner.lock();
        if !overwrite && guard.contains_key(&ino) {
            return Ok(false);
        }
        guard.insert(ino, bytes);
        Ok(true)
    }

    fn remove(&mut self, ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().remove(&ino))
    }

    fn contains(&self, ino: Ino) -> bool {
        self.inner.lock().contains_key(&ino)
    }

    fn clear(&mut self) -> VfsResult<()> {
        self.inner.lock().clear();
        Ok(())
    }

    fn begin(&mut self) -> VfsResult<Box<dyn Transaction + '_>> {
        Ok(Box::new(MemTransaction {
            store: &self.inner,
            pre_images: HashMap::new(),
            finished: false,
        }))
    }
}

/// Transaction over a [`MemStore`]: stashes the pre-image of every key it
/// touches the first time it touches it, and replays those pre-images on
/// `abort`.
pub struct MemTransaction<'a> {
    store: &'a Mutex<HashMap<Ino, Vec<u8>>>,
    pre_images: HashMap<Ino, Option<Vec<u8>>>,
    finished: bool,
}

impl<'a> MemTransaction<'a> {
    fn stash(&mut self, ino: Ino) {
        self.pre_images
            .entry(ino)
            .or_insert_with(|| self.store.lock().get(&ino).cloned());
    }
}

impl<'a> Transaction for MemTransaction<'a> {
    fn get(&self, ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        Ok(self.store.lock().get(&ino).cloned())
    }

    fn put(&mut self, ino: Ino, bytes: Vec<u8>, overwrite: bool) -> VfsResult<bool> {
        self.stash(ino);
        let mut guard = self.store.lock();
        if !overwrite && guard.contains_key(&ino) {
            return Ok(false);
        }
        guard.insert(ino, bytes);
        Ok(true)
    }

    fn remove(&mut self, ino: Ino) -> VfsResult<Option<Vec<u8>>> {
        self.stash(ino);
        Ok(self.store.lock().remove(&ino))
    }

    fn commit(mut self: Box<Self>) -> VfsResult<()> {
        self.finished = true;
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> VfsResult<()> {
        let mut guard = self.store.lock();
        for (ino, pre) in self.pre_images.drain() {
            match pre {
                Some(bytes) => {
                    guard.insert(ino, bytes);
                }
                None => {
                    guard.remove(&ino);
                }
            }
        }
        self.finished = true;
        Ok(())
    }
}

impl<'a> Drop for MemTransaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            // Caller dropped the transaction without committing or aborting;
            // treat it as an abort so a panic mid-operation can't leave a
            // half-written store behind.
            let mut guard = self.store.lock();
            for (ino, pre) in self.pre_images.drain() {
                match pre {
                    Some(bytes) => {
                        guard.insert(ino, bytes);
                    }
                    None => {
                        guard.remove(&ino);
                    }
                }
            }
        }
    }
}

/// Helper used by callers that need "get or ENOENT" rather than `Option`.
pub fn get_required(store: &dyn Store, ino: Ino) -> VfsResult<Vec<u8>> {
    store.get(ino)?.ok_or_else(|| not_found().with_syscall("get"))
}

/// Helper used by FD-table lookups that want `EBADF` instead of `ENOENT`.
pub fn get_required_fd(store: &dyn Store, ino: Ino) -> VfsResult<Vec<u8>> {
    store.get(ino)?.ok_or_else(|| bad_fd().with_syscall("get"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_without_overwrite_fails_on_existing_key() {
        let mut s = MemStore::new();
        assert!(s.put(1, b"a".to_vec(), false).unwrap());
        assert!(!s.put(1, b"b".to_vec(), false).unwrap());
        assert_eq!(s.get(1).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn put_with_overwrite_replaces_existing_key() {
        let mut s = MemStore::new();
        s.put(1, b"a".to_vec(), false).unwrap();
        assert!(s.put(1, b"b".to_vec(), true).unwrap());
        assert_eq!(s.get(1).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn transaction_abort_restores_pre_image() {
        let mut s = MemStore::new();
        s.put(1, b"orig".to_vec(), false).unwrap();
        {
            let mut txn = s.begin().unwrap();
            txn.put(1, b"changed".to_vec(), true).unwrap();
            txn.remove(1).ok();
            txn.abort().unwrap();
        }
        assert_eq!(s.get(1).unwrap(), Some(b"orig".to_vec()));
    }

    #[test]
    fn transaction_commit_keeps_changes() {
        let mut s = MemStore::new();
        s.put(1, b"orig".to_vec(), false).unwrap();
        {
            let mut txn = s.begin().unwrap();
            txn.put(1, b"changed".to_vec(), true).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(s.get(1).unwrap(), Some(b"changed".to_vec()));
    }

    #[test]
    fn dropping_transaction_without_commit_aborts() {
        let mut s = MemStore::new();
        s.put(1, b"orig".to_vec(), false).unwrap();
        {
            let mut txn = s.begin().unwrap();
            txn.put(1, b"changed".to_vec(), true).unwrap();
            // dropped without commit/abort
        }
        assert_eq!(s.get(1).unwrap(), Some(b"orig".to_vec()));
    }
}
