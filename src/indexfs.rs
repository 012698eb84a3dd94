//! `IndexFS` — an alternative to [`crate::storefs::StoreFS`] that keeps
//! metadata in an in-memory index rather than going through the [`Store`]
//! key-value abstraction (§4.2 C5).
//!
//! Grounded on `ramfs::RamFs` directly (not through `StoreFS`'s `Store`
//! detour): the teacher keeps a fixed `[RamInode; MAX_INODES]` array plus
//! per-inode `DirEntry` arrays entirely in memory. `IndexFS` keeps that same
//! "no backing store, just an index" shape but swaps the fixed arrays for
//! `HashMap`s keyed by the same random [`Ino`] allocation `StoreFS` uses, so
//! the two backends differ only in where metadata lives, not in addressing.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{
    already_exists, busy, invalid_argument, is_a_directory, no_space, not_a_directory, not_empty,
    not_found, too_many_links, VfsResult,
};
use crate::flags::FileType;
use crate::fstrait::FileSystem;
use crate::ino::{is_valid_name, DirListing, Ino, InodeRecord, ROOT_INO};

const ALLOC_RETRIES: u32 = 5;

struct Index {
    records: HashMap<Ino, InodeRecord>,
    listings: HashMap<Ino, DirListing>,
    data: HashMap<Ino, Vec<u8>>,
    clock: i64,
}

impl Index {
    fn now(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

/// Metadata-in-memory backend: same path-hierarchy contract as `StoreFS`,
/// but records/listings/data blobs live directly in `HashMap`s behind one
/// lock instead of being serialized through a `Store`.
pub struct IndexFS {
    index: Mutex<Index>,
    uid: u32,
    gid: u32,
}

impl IndexFS {
    pub fn new(uid: u32, gid: u32) -> Self {
        let mut index = Index {
            records: HashMap::new(),
            listings: HashMap::new(),
            data: HashMap::new(),
            clock: 0,
        };
        let now = index.now();
        let mut root = InodeRecord::new_now(ROOT_INO, ROOT_INO, FileType::Directory.bits() | 0o755, uid, gid, now);
        root.nlink = 1;
        index.records.insert(ROOT_INO, root);
        index.listings.insert(ROOT_INO, DirListing::new());
        Self {
            index: Mutex::new(index),
            uid,
            gid,
        }
    }

    pub fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino> {
        let index = self.index.lock();
        let parent_rec = index.records.get(&parent).ok_or_else(not_found)?;
        if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        let listing = index.listings.get(&parent).ok_or_else(not_found)?;
        listing.get(name).ok_or_else(not_found)
    }

    pub fn stat(&self, ino: Ino) -> VfsResult<InodeRecord> {
        self.index.lock().records.get(&ino).cloned().ok_or_else(not_found)
    }

    pub fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let index = self.index.lock();
        let rec = index.records.get(&ino).ok_or_else(not_found)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory());
        }
        let data = index.data.get(&rec.data).cloned().unwrap_or_default();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    pub fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let mut index = self.index.lock();
        let rec = index.records.get(&ino).ok_or_else(not_found)?.clone();
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory());
        }
        let mut data = index.data.get(&rec.data).cloned().unwrap_or_default();
        let offset = offset as usize;
        let end = offset.checked_add(buf.len()).ok_or_else(invalid_argument)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        let new_len = data.len() as u64;
        index.data.insert(rec.data, data);
        let now = index.now();
        let rec_mut = index.records.get_mut(&ino).unwrap();
        rec_mut.size = new_len;
        rec_mut.touch_mtime(now);
        Ok(buf.len())
    }

    pub fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        let mut index = self.index.lock();
        let rec = index.records.get(&ino).ok_or_else(not_found)?.clone();
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory());
        }
        let mut data = index.data.get(&rec.data).cloned().unwrap_or_default();
        data.resize(size as usize, 0);
        index.data.insert(rec.data, data);
        let now = index.now();
        let rec_mut = index.records.get_mut(&ino).unwrap();
        rec_mut.size = size;
        rec_mut.touch_mtime(now);
        Ok(())
    }

    pub fn create(&self, parent: Ino, name: &str, mode: u32) -> VfsResult<Ino> {
        if !is_valid_name(name) {
            return Err(invalid_argument());
        }
        let mut index = self.index.lock();
        let parent_rec = index.records.get(&parent).ok_or_else(not_found)?;
        if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        if index.listings.get(&parent).ok_or_else(not_found)?.contains(name) {
            return Err(already_exists());
        }

        let mut rng = rand::thread_rng();
        let now = index.now();
        let is_device = matches!(
            FileType::from_mode(mode),
            Some(FileType::CharDevice) | Some(FileType::BlockDevice)
        );
        let mut new_ino = 0;
        let mut ok = false;
        for _ in 0..ALLOC_RETRIES {
            let candidate = rng.next_u64().max(1);
            if !index.records.contains_key(&candidate) {
                new_ino = candidate;
                ok = true;
                break;
            }
        }
        if !ok {
            return Err(no_space().with_syscall("create"));
        }

        let data_field = if is_device { 0 } else { new_ino };
        let rec = InodeRecord::new_now(new_ino, data_field, mode, self.uid, self.gid, now);
        index.records.insert(new_ino, rec);
        if FileType::from_mode(mode) == Some(FileType::Directory) {
            index.listings.insert(new_ino, DirListing::new());
        } else if !is_device {
            index.data.insert(new_ino, Vec::new());
        }

        let listing = index.listings.get_mut(&parent).unwrap();
        listing.insert(name.to_string(), new_ino);

        if FileType::from_mode(mode) == Some(FileType::Directory) {
            index.records.get_mut(&parent).unwrap().nlink += 1;
        }
        Ok(new_ino)
    }

    pub fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()> {
        let mut index = self.index.lock();
        let target_ino = {
            let listing = index.listings.get(&parent).ok_or_else(not_found)?;
            listing.get(name).ok_or_else(not_found)?
        };
        let target_rec = index.records.get(&target_ino).ok_or_else(not_found)?.clone();
        let is_dir = FileType::from_mode(target_rec.mode) == Some(FileType::Directory);

        if is_dir {
            let listing = index.listings.get(&target_ino).ok_or_else(not_found)?;
            if !listing.is_empty() {
                return Err(not_empty());
            }
        }

        index.listings.get_mut(&parent).unwrap().remove(name);

        if is_dir {
            index.records.get_mut(&parent).unwrap().nlink -= 1;
            index.records.remove(&target_ino);
            index.listings.remove(&target_ino);
        } else {
            let rec = index.records.get_mut(&target_ino).unwrap();
            rec.nlink = rec.nlink.saturating_sub(1);
            if rec.nlink == 0 {
                let data_ino = rec.data;
                let is_device = matches!(
                    FileType::from_mode(rec.mode),
                    Some(FileType::CharDevice) | Some(FileType::BlockDevice)
                );
                index.records.remove(&target_ino);
                if !is_device {
                    index.data.remove(&data_ino);
                }
            }
        }
        Ok(())
    }

    pub fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        if !is_valid_name(new_name) {
            return Err(invalid_argument());
        }
        let mut index = self.index.lock();
        let rec = index.records.get(&existing).ok_or_else(not_found)?.clone();
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory().with_syscall("link"));
        }
        let parent_rec = index.records.get(&new_parent).ok_or_else(not_found)?;
        if FileType::from_mode(parent_rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        if index.listings.get(&new_parent).ok_or_else(not_found)?.contains(new_name) {
            return Err(already_exists());
        }
        let now = index.now();
        let rec_mut = index.records.get_mut(&existing).unwrap();
        rec_mut.nlink += 1;
        rec_mut.touch_ctime(now);
        index.listings.get_mut(&new_parent).unwrap().insert(new_name.to_string(), existing);
        Ok(())
    }

    pub fn rename(&self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        let mut index = self.index.lock();
        let moved_ino = index
            .listings
            .get(&old_parent)
            .ok_or_else(not_found)?
            .get(old_name)
            .ok_or_else(not_found)?;
        if moved_ino == new_parent {
            return Err(busy().with_syscall("rename"));
        }

        if let Some(existing_ino) = index.listings.get(&new_parent).and_then(|l| l.get(new_name)) {
            let existing_rec = index.records.get(&existing_ino).ok_or_else(not_found)?.clone();
            let moved_rec = index.records.get(&moved_ino).ok_or_else(not_found)?.clone();
            let existing_is_dir = FileType::from_mode(existing_rec.mode) == Some(FileType::Directory);
            let moved_is_dir = FileType::from_mode(moved_rec.mode) == Some(FileType::Directory);
            if existing_is_dir != moved_is_dir {
                return Err(if existing_is_dir {
                    crate::error::not_permitted().with_syscall("rename")
                } else {
                    not_a_directory().with_syscall("rename")
                });
            }
            if existing_is_dir {
                let listing = index.listings.get(&existing_ino).ok_or_else(not_found)?;
                if !listing.is_empty() {
                    return Err(not_empty());
                }
            }
            drop(index);
            self.unlink(new_parent, new_name)?;
            index = self.index.lock();
        }

        index.listings.get_mut(&old_parent).unwrap().remove(old_name);
        index.listings.get_mut(&new_parent).unwrap().insert(new_name.to_string(), moved_ino);

        if old_parent != new_parent {
            let moved_is_dir = FileType::from_mode(index.records[&moved_ino].mode) == Some(FileType::Directory);
            if moved_is_dir {
                index.records.get_mut(&old_parent).unwrap().nlink -= 1;
                index.records.get_mut(&new_parent).unwrap().nlink += 1;
            }
            let now = index.now();
            index.records.get_mut(&moved_ino).unwrap().touch_ctime(now);
        }
        Ok(())
    }

    pub fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>> {
        let index = self.index.lock();
        let rec = index.records.get(&ino).ok_or_else(not_found)?;
        if FileType::from_mode(rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory());
        }
        Ok(index
            .listings
            .get(&ino)
            .ok_or_else(not_found)?
            .iter()
            .map(|(n, i)| (n.to_string(), i))
            .collect())
    }

    pub fn set_attr(&self, ino: Ino, f: impl FnOnce(&mut InodeRecord)) -> VfsResult<()> {
        let mut index = self.index.lock();
        let rec = index.records.get_mut(&ino).ok_or_else(not_found)?;
        f(rec);
        let now = index.now();
        index.records.get_mut(&ino).unwrap().touch_ctime(now);
        Ok(())
    }

    pub fn touch_atime(&self, ino: Ino) -> VfsResult<()> {
        let mut index = self.index.lock();
        if !index.records.contains_key(&ino) {
            return Err(not_found());
        }
        let now = index.now();
        index.records.get_mut(&ino).unwrap().touch_atime(now);
        Ok(())
    }

    /// Resolve a dotted path against this index without going through the
    /// `vfs` dispatch layer, e.g. for embedders that only ever talk to one
    /// `IndexFS` and don't need mounts (§4.2's "data read/written by path").
    pub fn resolve_path(&self, components: &[&str]) -> VfsResult<Ino> {
        let mut current = ROOT_INO;
        let mut hops = 0;
        for comp in components {
            current = self.lookup(current, comp)?;
            hops += 1;
            if hops > 1024 {
                return Err(too_many_links());
            }
        }
        Ok(current)
    }
}

impl FileSystem for IndexFS {
    fn name(&self) -> &'static str {
        "indexfs"
    }

    fn root_ino(&self) -> Ino {
        ROOT_INO
    }

    fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino> {
        IndexFS::lookup(self, parent, name)
    }

    fn stat(&self, ino: Ino) -> VfsResult<InodeRecord> {
        IndexFS::stat(self, ino)
    }

    fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        IndexFS::read(self, ino, offset, buf)
    }

    fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        IndexFS::write(self, ino, offset, buf)
    }

    fn create(&self, parent: Ino, name: &str, mode: u32) -> VfsResult<Ino> {
        IndexFS::create(self, parent, name, mode)
    }

    fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()> {
        IndexFS::unlink(self, parent, name)
    }

    fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>> {
        IndexFS::readdir(self, ino)
    }

    fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        IndexFS::truncate(self, ino, size)
    }

    fn rename(&self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        IndexFS::rename(self, old_parent, old_name, new_parent, new_name)
    }

    fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        IndexFS::link(self, existing, new_parent, new_name)
    }

    fn set_attr(&self, ino: Ino, apply: &mut dyn FnMut(&mut InodeRecord)) -> VfsResult<()> {
        IndexFS::set_attr(self, ino, |rec| apply(rec))
    }

    fn touch_atime(&self, ino: Ino) -> VfsResult<()> {
        IndexFS::touch_atime(self, ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fs() -> IndexFS {
        IndexFS::new(1000, 1000)
    }

    #[test]
    fn root_is_a_directory() {
        let fs = new_fs();
        let rec = fs.stat(ROOT_INO).unwrap();
        assert_eq!(FileType::from_mode(rec.mode), Some(FileType::Directory));
    }

    #[test]
    fn create_write_read_roundtrip() {
        let fs = new_fs();
        let ino = fs.create(ROOT_INO, "a.bin", FileType::Regular.bits() | 0o644).unwrap();
        fs.write(ino, 0, b"indexed").unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(fs.read(ino, 0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"indexed");
    }

    #[test]
    fn nested_directories_resolve_by_path() {
        let fs = new_fs();
        let a = fs.create(ROOT_INO, "a", FileType::Directory.bits() | 0o755).unwrap();
        fs.create(a, "b", FileType::Directory.bits() | 0o755).unwrap();
        assert_eq!(fs.resolve_path(&["a", "b"]).unwrap(), fs.lookup(a, "b").unwrap());
    }

    #[test]
    fn unlink_decrements_nlink_and_frees_when_zero() {
        let fs = new_fs();
        let ino = fs.create(ROOT_INO, "f", FileType::Regular.bits() | 0o644).unwrap();
        fs.link(ino, ROOT_INO, "g").unwrap();
        assert_eq!(fs.stat(ino).unwrap().nlink, 2);
        fs.unlink(ROOT_INO, "f").unwrap();
        assert_eq!(fs.stat(ino).unwrap().nlink, 1);
        fs.unlink(ROOT_INO, "g").unwrap();
        assert!(fs.stat(ino).is_err());
    }

    #[test]
    fn rename_self_move_is_busy() {
        let fs = new_fs();
        let a = fs.create(ROOT_INO, "a", FileType::Directory.bits() | 0o755).unwrap();
        let err = fs.rename(ROOT_INO, "a", a, "x").unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::Busy);
    }

    #[test]
    fn rmdir_nonempty_is_rejected() {
        let fs = new_fs();
        let a = fs.create(ROOT_INO, "a", FileType::Directory.bits() | 0o755).unwrap();
        fs.create(a, "child", FileType::Regular.bits() | 0o644).unwrap();
        let err = fs.unlink(ROOT_INO, "a").unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::NotEmpty);
    }
}
