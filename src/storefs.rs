//! `StoreFS` — the primary backend: a path hierarchy of [`InodeRecord`]s and
//! directory listings materialized over a [`Store`] (§4.2).
//!
//! Grounded on `ramfs::RamFs`'s `RamInode`/`DirEntry`/`add_dir_entry`/
//! `remove_dir_entry` control flow, generalized from fixed-size arrays keyed
//! by array index to a `Store` keyed by random 64-bit [`Ino`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{
    already_exists, busy, cross_device, invalid_argument, is_a_directory, no_space, not_a_directory,
    not_empty, not_found, too_many_links, VfsError, VfsResult,
};
use crate::flags::FileType;
use crate::fstrait::FileSystem;
use crate::ino::{is_valid_name, DirListing, Ino, InodeRecord, ROOT_INO};
use crate::store::{Store, Transaction};

/// Number of random-id collisions `commit_new_file` tolerates before giving
/// up with `ENOSPC` (§4.2 "commitNewFile").
const ALLOC_RETRIES: u32 = 5;

/// Path-hierarchy backend: every inode is a record plus, for directories, a
/// JSON listing blob stored at the same `Ino` under a distinct key space.
///
/// Records live at `2*ino`, directory listings at `2*ino + 1`, so both can
/// share one flat [`Store`] without colliding (`StoreFS` owns the addressing
/// scheme; callers only ever see bare `Ino`s).
pub struct StoreFS<S: Store> {
    store: Mutex<S>,
    uid: u32,
    gid: u32,
    clock: AtomicI64,
}

// Records, directory listings, and file data blobs all share one flat
// `Store`, so each gets its own stripe of the key space off the inode id.
fn record_key(ino: Ino) -> Ino {
    ino.wrapping_mul(3)
}

fn listing_key(ino: Ino) -> Ino {
    ino.wrapping_mul(3).wrapping_add(1)
}

fn data_key(ino: Ino) -> Ino {
    ino.wrapping_mul(3).wrapping_add(2)
}

fn txn_load_record(txn: &dyn Transaction, ino: Ino) -> VfsResult<InodeRecord> {
    let bytes = txn.get(record_key(ino))?.ok_or_else(not_found)?;
    InodeRecord::decode(&bytes)
}

fn txn_save_record(txn: &mut dyn Transaction, rec: &InodeRecord) -> VfsResult<()> {
    txn.put(record_key(rec.ino), rec.encode(), true)?;
    Ok(())
}

fn txn_load_listing(txn: &dyn Transaction, ino: Ino) -> VfsResult<DirListing> {
    let bytes = txn.get(listing_key(ino))?.ok_or_else(not_found)?;
    DirListing::decode(&bytes)
}

fn txn_save_listing(txn: &mut dyn Transaction, ino: Ino, listing: &DirListing) -> VfsResult<()> {
    txn.put(listing_key(ino), listing.encode(), true)?;
    Ok(())
}

impl<S: Store> StoreFS<S> {
    /// Wrap `store`, creating the root directory if it isn't present yet.
    pub fn new(store: S, uid: u32, gid: u32) -> VfsResult<Self> {
        let fs = Self {
            store: Mutex::new(store),
            uid,
            gid,
            clock: AtomicI64::new(0),
        };
        fs.ensure_root()?;
        Ok(fs)
    }

    fn now(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_root(&self) -> VfsResult<()> {
        let mut store = self.store.lock();
        if store.get(record_key(ROOT_INO))?.is_some() {
            return Ok(());
        }
        let now = self.now();
        let mut rec = InodeRecord::new_now(ROOT_INO, ROOT_INO, FileType::Directory.bits() | 0o777, self.uid, self.gid, now);
        rec.nlink = 1;
        store.put(record_key(ROOT_INO), rec.encode(), false)?;
        store.put(listing_key(ROOT_INO), DirListing::new().encode(), false)?;
        Ok(())
    }

    fn load_record(&self, ino: Ino) -> VfsResult<InodeRecord> {
        let bytes = self
            .store
            .lock()
            .get(record_key(ino))?
            .ok_or_else(not_found)?;
        InodeRecord::decode(&bytes)
    }

    fn save_record(&self, rec: &InodeRecord) -> VfsResult<()> {
        self.store.lock().put(record_key(rec.ino), rec.encode(), true)?;
        Ok(())
    }

    fn load_listing(&self, ino: Ino) -> VfsResult<DirListing> {
        let bytes = self
            .store
            .lock()
            .get(listing_key(ino))?
            .ok_or_else(not_found)?;
        DirListing::decode(&bytes)
    }

    fn save_listing(&self, ino: Ino, listing: &DirListing) -> VfsResult<()> {
        self.store.lock().put(listing_key(ino), listing.encode(), true)?;
        Ok(())
    }

    /// Run `body` inside a single store transaction, committing on `Ok` and
    /// aborting (restoring every pre-image `body` touched) on `Err` (§4.1
    /// "abort restores each pre-image", §4.2's per-operation "one
    /// transaction... abort on any error").
    fn in_transaction<T>(&self, body: impl FnOnce(&mut dyn Transaction) -> VfsResult<T>) -> VfsResult<T> {
        let mut store = self.store.lock();
        let mut txn = store.begin()?;
        match body(txn.as_mut()) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.abort()?;
                Err(e)
            }
        }
    }

    /// Resolve a single path component within `parent`, which must be a
    /// directory. Returns `ENOTDIR`/`ENOENT` as appropriate.
    pub fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino> {
        let parent_rec = self.load_record(parent)?;
        if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        let listing = self.load_listing(parent)?;
        listing.get(name).ok_or_else(not_found)
    }

    /// Walk `path` components starting at `root`, visiting a bounded number
    /// of directories so a corrupted store with a listing cycle can't spin
    /// forever (mirrors the depth cap `vfs` applies to symlinks, §4.4).
    pub fn resolve_path(&self, root: Ino, components: &[&str]) -> VfsResult<Ino> {
        let mut current = root;
        let mut visited = HashSet::new();
        visited.insert(current);
        for comp in components {
            current = self.lookup(current, comp)?;
            if !visited.insert(current) {
                return Err(too_many_links());
            }
        }
        Ok(current)
    }

    pub fn stat(&self, ino: Ino) -> VfsResult<InodeRecord> {
        self.load_record(ino)
    }

    pub fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let rec = self.load_record(ino)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory());
        }
        let data = self.store.lock().get(data_key(rec.data))?.unwrap_or_default();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    pub fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let now = self.now();
        self.in_transaction(|txn| {
            let mut rec = txn_load_record(txn, ino)?;
            if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
                return Err(is_a_directory());
            }
            let mut data = txn.get(data_key(rec.data))?.unwrap_or_default();
            let offset = offset as usize;
            let end = offset
                .checked_add(buf.len())
                .ok_or_else(invalid_argument)?;
            if end > data.len() {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(buf);
            let new_len = data.len() as u64;
            txn.put(data_key(rec.data), data, true)?;
            rec.size = new_len;
            rec.touch_mtime(now);
            txn_save_record(txn, &rec)?;
            Ok(buf.len())
        })
    }

    pub fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        let now = self.now();
        self.in_transaction(|txn| {
            let mut rec = txn_load_record(txn, ino)?;
            if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
                return Err(is_a_directory());
            }
            let mut data = txn.get(data_key(rec.data))?.unwrap_or_default();
            data.resize(size as usize, 0);
            txn.put(data_key(rec.data), data, true)?;
            rec.size = size;
            rec.touch_mtime(now);
            txn_save_record(txn, &rec)
        })
    }

    /// Create a new file/dir/symlink/device entry under `parent` (§4.2
    /// "commitNewFile"): allocate a random id, retrying on collision up to
    /// [`ALLOC_RETRIES`] times, write the new record and (for directories) an
    /// empty listing, then link it into the parent's listing.
    ///
    /// `device_data` is only meaningful for char/block device entries, whose
    /// `InodeRecord::data` field encodes a device id rather than a storage
    /// key (`devicefs` interprets it, `StoreFS::read`/`write` never does);
    /// every other file type gets its data blob addressed by its own fresh
    /// inode id and `device_data` is ignored.
    pub fn commit_new_file(
        &self,
        parent: Ino,
        name: &str,
        mode: u32,
        device_data: Ino,
    ) -> VfsResult<Ino> {
        if !is_valid_name(name) {
            return Err(invalid_argument());
        }
        let mut rng = rand::thread_rng();
        let now = self.now();
        self.in_transaction(|txn| {
            let parent_rec = txn_load_record(txn, parent)?;
            if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
                return Err(not_a_directory());
            }
            let listing = txn_load_listing(txn, parent)?;
            if listing.contains(name) {
                return Err(already_exists());
            }

            for _ in 0..ALLOC_RETRIES {
                let new_ino = rng.next_u64().max(1);
                if txn.get(record_key(new_ino))?.is_some() {
                    continue;
                }
                let is_device = matches!(
                    FileType::from_mode(mode),
                    Some(FileType::CharDevice) | Some(FileType::BlockDevice)
                );
                let data_field = if is_device { device_data } else { new_ino };
                let rec = InodeRecord::new_now(new_ino, data_field, mode, self.uid, self.gid, now);
                if !txn.put(record_key(new_ino), rec.encode(), false)? {
                    continue;
                }

                if FileType::from_mode(mode) == Some(FileType::Directory) {
                    txn_save_listing(txn, new_ino, &DirListing::new())?;
                } else if !is_device {
                    txn.put(data_key(new_ino), Vec::new(), true)?;
                }

                let mut listing = txn_load_listing(txn, parent)?;
                listing.insert(name.to_string(), new_ino);
                txn_save_listing(txn, parent, &listing)?;

                if FileType::from_mode(mode) == Some(FileType::Directory) {
                    let mut p = txn_load_record(txn, parent)?;
                    p.nlink += 1;
                    txn_save_record(txn, &p)?;
                }

                return Ok(new_ino);
            }
            Err(no_space().with_syscall("commit_new_file"))
        })
    }

    /// Remove a directory entry (§4.2 "removeEntry"): `rmdir` semantics when
    /// the target is a directory (must be empty), `unlink` semantics
    /// otherwise (decrement `nlink`, reclaim the inode once it hits zero).
    pub fn remove_entry(&self, parent: Ino, name: &str) -> VfsResult<()> {
        self.in_transaction(|txn| {
            let listing_before = txn_load_listing(txn, parent)?;
            let target_ino = listing_before.get(name).ok_or_else(not_found)?;
            let target_rec = txn_load_record(txn, target_ino)?;
            let is_dir = FileType::from_mode(target_rec.mode) == Some(FileType::Directory);

            if is_dir {
                let listing = txn_load_listing(txn, target_ino)?;
                if !listing.is_empty() {
                    return Err(not_empty());
                }
            }

            let mut listing = txn_load_listing(txn, parent)?;
            listing.remove(name);
            txn_save_listing(txn, parent, &listing)?;

            if is_dir {
                let mut p = txn_load_record(txn, parent)?;
                p.nlink = p.nlink.saturating_sub(1);
                txn_save_record(txn, &p)?;
                txn.remove(record_key(target_ino))?;
                txn.remove(listing_key(target_ino))?;
            } else {
                let mut t = target_rec;
                let is_device = matches!(
                    FileType::from_mode(t.mode),
                    Some(FileType::CharDevice) | Some(FileType::BlockDevice)
                );
                t.nlink = t.nlink.saturating_sub(1);
                if t.nlink == 0 {
                    txn.remove(record_key(target_ino))?;
                    if !is_device {
                        txn.remove(data_key(t.data))?;
                    }
                } else {
                    txn_save_record(txn, &t)?;
                }
            }
            Ok(())
        })
    }

    /// Create a second name for an existing inode (`link()`, §4.2): bumps
    /// `nlink`. Directories may not be hard-linked.
    pub fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        if !is_valid_name(new_name) {
            return Err(invalid_argument());
        }
        let now = self.now();
        self.in_transaction(|txn| {
            let mut rec = txn_load_record(txn, existing)?;
            if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
                return Err(is_a_directory().with_syscall("link"));
            }
            let parent_rec = txn_load_record(txn, new_parent)?;
            if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
                return Err(not_a_directory());
            }
            let listing = txn_load_listing(txn, new_parent)?;
            if listing.contains(new_name) {
                return Err(already_exists());
            }
            rec.nlink += 1;
            rec.touch_ctime(now);
            txn_save_record(txn, &rec)?;

            let mut listing = txn_load_listing(txn, new_parent)?;
            listing.insert(new_name.to_string(), existing);
            txn_save_listing(txn, new_parent, &listing)
        })
    }

    /// Move an entry between directories (§4.2 "rename"): self-move onto an
    /// ancestor of itself is `EBUSY`; renaming a directory onto an existing
    /// non-empty directory is `ENOTEMPTY`; renaming onto an existing file
    /// replaces it.
    pub fn rename(
        &self,
        old_parent: Ino,
        old_name: &str,
        new_parent: Ino,
        new_name: &str,
    ) -> VfsResult<()> {
        let now = self.now();
        self.in_transaction(|txn| {
            let old_listing_lookup = txn_load_listing(txn, old_parent)?;
            let moved_ino = old_listing_lookup.get(old_name).ok_or_else(not_found)?;
            if moved_ino == new_parent {
                return Err(busy().with_syscall("rename"));
            }

            let new_listing_lookup = txn_load_listing(txn, new_parent)?;
            if let Some(existing_ino) = new_listing_lookup.get(new_name) {
                let existing_rec = txn_load_record(txn, existing_ino)?;
                let moved_rec = txn_load_record(txn, moved_ino)?;
                let existing_is_dir = FileType::from_mode(existing_rec.mode) == Some(FileType::Directory);
                let moved_is_dir = FileType::from_mode(moved_rec.mode) == Some(FileType::Directory);
                if existing_is_dir != moved_is_dir {
                    // Renaming a file onto an existing directory is EPERM, not
                    // EISDIR; renaming a directory onto an existing file is the
                    // type-mismatch ENOTDIR case (§4.7 distinguishes the two).
                    return Err(if existing_is_dir {
                        crate::error::not_permitted().with_syscall("rename")
                    } else {
                        not_a_directory().with_syscall("rename")
                    });
                }
                if existing_is_dir {
                    let listing = txn_load_listing(txn, existing_ino)?;
                    if !listing.is_empty() {
                        return Err(not_empty());
                    }
                    txn.remove(record_key(existing_ino))?;
                    txn.remove(listing_key(existing_ino))?;
                } else {
                    let mut t = existing_rec;
                    let is_device = matches!(
                        FileType::from_mode(t.mode),
                        Some(FileType::CharDevice) | Some(FileType::BlockDevice)
                    );
                    t.nlink = t.nlink.saturating_sub(1);
                    if t.nlink == 0 {
                        txn.remove(record_key(existing_ino))?;
                        if !is_device {
                            txn.remove(data_key(t.data))?;
                        }
                    } else {
                        txn_save_record(txn, &t)?;
                    }
                }
            }

            let mut old_listing = txn_load_listing(txn, old_parent)?;
            old_listing.remove(old_name);
            txn_save_listing(txn, old_parent, &old_listing)?;

            let mut new_listing = txn_load_listing(txn, new_parent)?;
            new_listing.insert(new_name.to_string(), moved_ino);
            txn_save_listing(txn, new_parent, &new_listing)?;

            if old_parent != new_parent {
                let mut moved_rec = txn_load_record(txn, moved_ino)?;
                if FileType::from_mode(moved_rec.mode) == Some(FileType::Directory) {
                    let mut old_p = txn_load_record(txn, old_parent)?;
                    old_p.nlink = old_p.nlink.saturating_sub(1);
                    txn_save_record(txn, &old_p)?;
                    let mut new_p = txn_load_record(txn, new_parent)?;
                    new_p.nlink += 1;
                    txn_save_record(txn, &new_p)?;
                }
                moved_rec.touch_ctime(now);
                txn_save_record(txn, &moved_rec)?;
            }

            Ok(())
        })
    }

    pub fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>> {
        let rec = self.load_record(ino)?;
        if FileType::from_mode(rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        let listing = self.load_listing(ino)?;
        Ok(listing.iter().map(|(n, i)| (n.to_string(), i)).collect())
    }

    pub fn set_attr(&self, ino: Ino, f: impl FnOnce(&mut InodeRecord)) -> VfsResult<()> {
        let mut rec = self.load_record(ino)?;
        f(&mut rec);
        let now = self.now();
        rec.touch_ctime(now);
        self.save_record(&rec)
    }

    pub fn touch_atime(&self, ino: Ino) -> VfsResult<()> {
        let mut rec = self.load_record(ino)?;
        let now = self.now();
        rec.touch_atime(now);
        self.save_record(&rec)
    }
}

impl<S: Store + Send + Sync> FileSystem for StoreFS<S> {
    fn name(&self) -> &'static str {
        "storefs"
    }

    fn root_ino(&self) -> Ino {
        ROOT_INO
    }

    fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino> {
        StoreFS::lookup(self, parent, name)
    }

    fn stat(&self, ino: Ino) -> VfsResult<InodeRecord> {
        StoreFS::stat(self, ino)
    }

    fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        StoreFS::read(self, ino, offset, buf)
    }

    fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        StoreFS::write(self, ino, offset, buf)
    }

    fn create(&self, parent: Ino, name: &str, mode: u32) -> VfsResult<Ino> {
        self.commit_new_file(parent, name, mode, 0)
    }

    fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()> {
        self.remove_entry(parent, name)
    }

    fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>> {
        StoreFS::readdir(self, ino)
    }

    fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        StoreFS::truncate(self, ino, size)
    }

    fn rename(&self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        StoreFS::rename(self, old_parent, old_name, new_parent, new_name)
    }

    fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        StoreFS::link(self, existing, new_parent, new_name)
    }

    fn set_attr(&self, ino: Ino, apply: &mut dyn FnMut(&mut InodeRecord)) -> VfsResult<()> {
        StoreFS::set_attr(self, ino, |rec| apply(rec))
    }

    fn touch_atime(&self, ino: Ino) -> VfsResult<()> {
        StoreFS::touch_atime(self, ino)
    }
}

/// Cross-device detection helper used by `vfs::rename` when two paths
/// resolve through different mounts (§4.2, §4.7 `EXDEV`).
pub fn require_same_device(a: Ino, b: Ino, same: bool) -> VfsResult<()> {
    if same {
        Ok(())
    } else {
        let _ = (a, b);
        Err(cross_device())
    }
}

pub type StoreFSError = VfsError;
