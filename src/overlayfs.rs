//! `OverlayFS` — a read-only lower layer composed with a writable upper
//! layer, copy-up-on-write, and a persistent deletion log (§4.3).
//!
//! No teacher precedent exists for this component (SlopLabs has no overlay
//! FS); it is built in the teacher's "wrap another `FileSystem`" idiom
//! (`ext2_vfs::StaticExt2Vfs` wraps a backend the same way) but the
//! path-addressed copy-up/deletion-log logic follows §4.3 directly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{busy, invalid_argument, not_empty, not_found, not_permitted, VfsResult};
use crate::flags::FileType;
use crate::fstrait::FileSystem;
use crate::ino::{Ino, InodeRecord};
use crate::pathutil::{join, normalize, split_parent};

/// The reserved path user code can never address directly (§4.3 "Invariants").
pub const DELETION_LOG_PATH: &str = "/.deleted";

/// Resolve `path` to an inode id within `fs`, walking component by component
/// from `fs`'s root. Used instead of a native path-lookup API because every
/// backend only exposes inode-relative `lookup`.
fn resolve_in(fs: &dyn FileSystem, path: &str) -> VfsResult<Ino> {
    let mut current = fs.root_ino();
    let normalized = normalize(path);
    if normalized == "/" {
        return Ok(current);
    }
    for comp in normalized.trim_start_matches('/').split('/') {
        current = fs.lookup(current, comp)?;
    }
    Ok(current)
}

fn exists_in(fs: &dyn FileSystem, path: &str) -> bool {
    resolve_in(fs, path).is_ok()
}

/// Bidirectional path↔ino registry: the overlay presents itself as an
/// inode-addressed `FileSystem` (to compose uniformly with `StoreFS`/
/// `DeviceFS` under the mount table) even though its real state of truth is
/// the path-addressed union of its two children.
struct PathRegistry {
    next: AtomicU64,
    ino_to_path: Mutex<HashMap<Ino, String>>,
    path_to_ino: Mutex<HashMap<String, Ino>>,
}

impl PathRegistry {
    fn new() -> Self {
        let reg = Self {
            next: AtomicU64::new(1),
            ino_to_path: Mutex::new(HashMap::new()),
            path_to_ino: Mutex::new(HashMap::new()),
        };
        reg.ino_to_path.lock().insert(0, "/".to_string());
        reg.path_to_ino.lock().insert("/".to_string(), 0);
        reg
    }

    fn ino_for(&self, path: &str) -> Ino {
        if let Some(&ino) = self.path_to_ino.lock().get(path) {
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.ino_to_path.lock().insert(ino, path.to_string());
        self.path_to_ino.lock().insert(path.to_string(), ino);
        ino
    }

    fn path_for(&self, ino: Ino) -> VfsResult<String> {
        self.ino_to_path.lock().get(&ino).cloned().ok_or_else(not_found)
    }
}

/// Serializes deletion-log rewrites behind a pending/needed pair so
/// concurrent deletes coalesce into one rewrite instead of racing (§4.3
/// "Deletion-log write coalescing").
struct DeletionLog {
    entries: HashSet<String>,
    pending: bool,
    needed: bool,
    latched_error: Option<crate::error::VfsError>,
}

impl DeletionLog {
    fn parse(bytes: &[u8]) -> HashSet<String> {
        let mut set = HashSet::new();
        if let Ok(text) = std::str::from_utf8(bytes) {
            for line in text.lines() {
                if let Some(path) = line.strip_prefix('d') {
                    set.insert(path.to_string());
                }
            }
        }
        set
    }

    fn render(&self) -> Vec<u8> {
        let mut out = String::new();
        for path in &self.entries {
            out.push('d');
            out.push_str(path);
            out.push('\n');
        }
        out.into_bytes()
    }
}

pub struct OverlayFS {
    lower: Box<dyn FileSystem>,
    upper: Box<dyn FileSystem>,
    registry: PathRegistry,
    log: Mutex<DeletionLog>,
}

impl OverlayFS {
    /// Compose `lower` (read-only) with `upper` (writable). Loads the
    /// upper's deletion log if present, treating a missing log as empty
    /// (§7 "Missing deletion log on overlay init").
    pub fn new(lower: Box<dyn FileSystem>, upper: Box<dyn FileSystem>) -> VfsResult<Self> {
        if upper.is_read_only() {
            return Err(invalid_argument().with_syscall("overlay_new"));
        }
        let entries = match resolve_in(upper.as_ref(), DELETION_LOG_PATH) {
            Ok(ino) => {
                let mut buf = vec![0u8; 65536];
                let n = upper.read(ino, 0, &mut buf).unwrap_or(0);
                DeletionLog::parse(&buf[..n])
            }
            Err(_) => HashSet::new(),
        };
        Ok(Self {
            lower,
            upper,
            registry: PathRegistry::new(),
            log: Mutex::new(DeletionLog {
                entries,
                pending: false,
                needed: false,
                latched_error: None,
            }),
        })
    }

    fn is_deleted(&self, path: &str) -> bool {
        self.log.lock().entries.contains(path)
    }

    fn raise_latched(&self) -> VfsResult<()> {
        if let Some(err) = self.log.lock().latched_error.take() {
            return Err(err);
        }
        Ok(())
    }

    /// Append-and-coalesce write of the deletion log (§4.3 "updateLog"): a
    /// rewrite already in flight gets a "needed" bit set instead of a second
    /// concurrent write; since this crate is single-threaded per mount, the
    /// in-flight window is just this call, but the flag bookkeeping still
    /// guards against reentrant calls from within `upper` callbacks.
    fn flush_log(&self) {
        let mut guard = self.log.lock();
        if guard.pending {
            guard.needed = true;
            return;
        }
        guard.pending = true;
        loop {
            let bytes = guard.render();
            drop(guard);
            let result = self.write_upper_raw(DELETION_LOG_PATH, &bytes);
            guard = self.log.lock();
            if let Err(e) = result {
                warn!("overlay: deletion log write failed: {e}");
                guard.latched_error = Some(e);
            }
            if guard.needed {
                guard.needed = false;
                continue;
            }
            break;
        }
        guard.pending = false;
    }

    fn write_upper_raw(&self, path: &str, bytes: &[u8]) -> VfsResult<()> {
        let ino = match resolve_in(self.upper.as_ref(), path) {
            Ok(ino) => ino,
            Err(_) => {
                let (parent, base) = split_parent(path).ok_or_else(invalid_argument)?;
                self.ensure_upper_path(&parent)?;
                let parent_ino = resolve_in(self.upper.as_ref(), &parent)?;
                self.upper
                    .create(parent_ino, &base, FileType::Regular.bits() | 0o600)?
            }
        };
        self.upper.truncate(ino, 0)?;
        self.upper.write(ino, 0, bytes)?;
        Ok(())
    }

    fn mark_deleted(&self, path: &str) {
        self.log.lock().entries.insert(path.to_string());
        self.flush_log();
    }

    /// Recursively materialize `dir_path`'s ancestor chain on upper, copying
    /// directory modes from lower where present (§4.3 "Write path").
    fn ensure_upper_path(&self, dir_path: &str) -> VfsResult<Ino> {
        if dir_path == "/" || dir_path.is_empty() {
            return Ok(self.upper.root_ino());
        }
        if let Ok(ino) = resolve_in(self.upper.as_ref(), dir_path) {
            return Ok(ino);
        }
        let (parent, base) = split_parent(dir_path).ok_or_else(invalid_argument)?;
        let parent_ino = self.ensure_upper_path(&parent)?;
        let mode = match resolve_in(self.lower.as_ref(), dir_path).and_then(|i| self.lower.stat(i)) {
            Ok(rec) => rec.mode,
            Err(_) => FileType::Directory.bits() | 0o755,
        };
        self.upper.create(parent_ino, &base, mode)
    }

    /// Guarantee `path` exists (and is writable) on upper, copying its bytes
    /// up from lower first if it only exists there (§4.3 "Write path").
    fn copy_up(&self, path: &str) -> VfsResult<Ino> {
        if let Ok(ino) = resolve_in(self.upper.as_ref(), path) {
            return Ok(ino);
        }
        let lower_ino = resolve_in(self.lower.as_ref(), path)?;
        let lower_rec = self.lower.stat(lower_ino)?;
        let (parent, base) = split_parent(path).ok_or_else(invalid_argument)?;
        let parent_ino = self.ensure_upper_path(&parent)?;

        if FileType::from_mode(lower_rec.mode) == Some(FileType::Directory) {
            let new_ino = self
                .upper
                .create(parent_ino, &base, lower_rec.mode | 0o222)?;
            for (name, _) in self.lower.readdir(lower_ino)? {
                self.copy_up(&join(path, &name))?;
            }
            return Ok(new_ino);
        }

        let new_ino = self
            .upper
            .create(parent_ino, &base, lower_rec.mode | 0o222)?;
        let mut buf = vec![0u8; lower_rec.size as usize];
        self.lower.read(lower_ino, 0, &mut buf)?;
        if !buf.is_empty() {
            self.upper.write(new_ino, 0, &buf)?;
        }
        Ok(new_ino)
    }
}

impl FileSystem for OverlayFS {
    fn name(&self) -> &'static str {
        "overlayfs"
    }

    fn root_ino(&self) -> Ino {
        0
    }

    fn lookup(&self, parent: Ino, name: &str) -> VfsResult<Ino> {
        self.raise_latched()?;
        let parent_path = self.registry.path_for(parent)?;
        let child_path = join(&parent_path, name);
        if child_path == DELETION_LOG_PATH {
            return Err(not_permitted());
        }
        let visible = exists_in(self.upper.as_ref(), &child_path)
            || (exists_in(self.lower.as_ref(), &child_path) && !self.is_deleted(&child_path));
        if !visible {
            return Err(not_found());
        }
        Ok(self.registry.ino_for(&child_path))
    }

    fn stat(&self, ino: Ino) -> VfsResult<InodeRecord> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        if let Ok(upper_ino) = resolve_in(self.upper.as_ref(), &path) {
            return self.upper.stat(upper_ino);
        }
        if self.is_deleted(&path) {
            return Err(not_found());
        }
        let lower_ino = resolve_in(self.lower.as_ref(), &path)?;
        let mut rec = self.lower.stat(lower_ino)?;
        rec.mode |= 0o222;
        Ok(rec)
    }

    fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        if let Ok(upper_ino) = resolve_in(self.upper.as_ref(), &path) {
            return self.upper.read(upper_ino, offset, buf);
        }
        if self.is_deleted(&path) {
            return Err(not_found());
        }
        let lower_ino = resolve_in(self.lower.as_ref(), &path)?;
        self.lower.read(lower_ino, offset, buf)
    }

    fn write(&self, ino: Ino, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        if path == DELETION_LOG_PATH {
            return Err(not_permitted());
        }
        let upper_ino = self.copy_up(&path)?;
        let n = self.upper.write(upper_ino, offset, buf)?;
        debug!("overlay: wrote {n} bytes to {path} after copy-up");
        Ok(n)
    }

    fn create(&self, parent: Ino, name: &str, mode: u32) -> VfsResult<Ino> {
        self.raise_latched()?;
        let parent_path = self.registry.path_for(parent)?;
        let child_path = join(&parent_path, name);
        if child_path == DELETION_LOG_PATH {
            return Err(not_permitted());
        }
        let visible = exists_in(self.upper.as_ref(), &child_path)
            || (exists_in(self.lower.as_ref(), &child_path) && !self.is_deleted(&child_path));
        if visible {
            return Err(crate::error::already_exists());
        }
        let parent_upper = self.ensure_upper_path(&parent_path)?;
        let new_ino = self.upper.create(parent_upper, name, mode)?;
        let _ = new_ino;
        self.log.lock().entries.remove(&child_path);
        Ok(self.registry.ino_for(&child_path))
    }

    fn unlink(&self, parent: Ino, name: &str) -> VfsResult<()> {
        self.raise_latched()?;
        let parent_path = self.registry.path_for(parent)?;
        let child_path = join(&parent_path, name);
        if child_path == DELETION_LOG_PATH {
            return Err(not_permitted());
        }

        let in_upper = exists_in(self.upper.as_ref(), &child_path);
        if in_upper {
            let upper_ino = resolve_in(self.upper.as_ref(), &child_path)?;
            let rec = self.upper.stat(upper_ino)?;
            if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
                if !self.upper.readdir(upper_ino)?.is_empty() {
                    return Err(not_empty());
                }
            }
            let upper_parent = resolve_in(self.upper.as_ref(), &parent_path)?;
            self.upper.unlink(upper_parent, name)?;
        }

        let still_in_lower = exists_in(self.lower.as_ref(), &child_path) && !self.is_deleted(&child_path);
        if still_in_lower {
            let lower_ino = resolve_in(self.lower.as_ref(), &child_path)?;
            let rec = self.lower.stat(lower_ino)?;
            if FileType::from_mode(rec.mode) == Some(FileType::Directory)
                && !self.lower.readdir(lower_ino)?.is_empty()
            {
                return Err(not_empty());
            }
            self.mark_deleted(&child_path);
        } else if !in_upper {
            return Err(not_found());
        }
        Ok(())
    }

    fn readdir(&self, ino: Ino) -> VfsResult<Vec<(String, Ino)>> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        if let Ok(upper_ino) = resolve_in(self.upper.as_ref(), &path) {
            for (name, _) in self.upper.readdir(upper_ino)? {
                if path == "/" && name == ".deleted" {
                    continue;
                }
                if seen.insert(name.clone()) {
                    let child = join(&path, &name);
                    out.push((name, self.registry.ino_for(&child)));
                }
            }
        }
        if let Ok(lower_ino) = resolve_in(self.lower.as_ref(), &path) {
            for (name, _) in self.lower.readdir(lower_ino)? {
                let child = join(&path, &name);
                if self.is_deleted(&child) || !seen.insert(name.clone()) {
                    continue;
                }
                out.push((name, self.registry.ino_for(&child)));
            }
        }
        Ok(out)
    }

    fn truncate(&self, ino: Ino, size: u64) -> VfsResult<()> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        let upper_ino = self.copy_up(&path)?;
        self.upper.truncate(upper_ino, size)
    }

    fn rename(&self, old_parent: Ino, old_name: &str, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        self.raise_latched()?;
        let old_parent_path = self.registry.path_for(old_parent)?;
        let new_parent_path = self.registry.path_for(new_parent)?;
        let old_path = join(&old_parent_path, old_name);
        let new_path = join(&new_parent_path, new_name);
        if old_path == DELETION_LOG_PATH || new_path == DELETION_LOG_PATH {
            return Err(not_permitted());
        }
        if new_path.starts_with(&format!("{old_path}/")) {
            return Err(busy().with_syscall("rename"));
        }

        self.copy_up(&old_path)?;
        let old_parent_upper = self.ensure_upper_path(&old_parent_path)?;
        let new_parent_upper = self.ensure_upper_path(&new_parent_path)?;
        self.upper.rename(old_parent_upper, old_name, new_parent_upper, new_name)?;

        if exists_in(self.lower.as_ref(), &old_path) {
            self.mark_deleted(&old_path);
        }
        self.log.lock().entries.remove(&new_path);
        Ok(())
    }

    fn link(&self, existing: Ino, new_parent: Ino, new_name: &str) -> VfsResult<()> {
        self.raise_latched()?;
        let existing_path = self.registry.path_for(existing)?;
        let new_parent_path = self.registry.path_for(new_parent)?;
        let existing_upper = self.copy_up(&existing_path)?;
        let new_parent_upper = self.ensure_upper_path(&new_parent_path)?;
        self.upper.link(existing_upper, new_parent_upper, new_name)
    }

    fn set_attr(&self, ino: Ino, apply: &mut dyn FnMut(&mut InodeRecord)) -> VfsResult<()> {
        self.raise_latched()?;
        let path = self.registry.path_for(ino)?;
        let upper_ino = self.copy_up(&path)?;
        self.upper.set_attr(upper_ino, apply)
    }

    fn sync(&self) -> VfsResult<()> {
        self.upper.sync()?;
        self.lower.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::storefs::StoreFS;

    fn new_overlay() -> OverlayFS {
        let lower = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        let upper = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        OverlayFS::new(Box::new(lower), Box::new(upper)).unwrap()
    }

    #[test]
    fn write_through_overlay_copies_up_and_leaves_lower_untouched() {
        let lower = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        let r = lower
            .commit_new_file(0, "r", FileType::Regular.bits() | 0o644, 0)
            .unwrap();
        lower.write(r, 0, b"OLD").unwrap();

        let upper = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        let lower_box: Box<dyn FileSystem> = Box::new(lower);
        let upper_box: Box<dyn FileSystem> = Box::new(upper);
        let overlay = OverlayFS::new(lower_box, upper_box).unwrap();

        let r_ino = overlay.lookup(overlay.root_ino(), "r").unwrap();
        overlay.write(r_ino, 0, b"NEW").unwrap();

        let mut buf = [0u8; 3];
        overlay.read(r_ino, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"NEW");
    }

    #[test]
    fn delete_only_visible_through_lower_adds_deletion_entry() {
        let overlay = new_overlay();
        // create directly on the overlay so it lands on upper
        overlay.create(overlay.root_ino(), "a", FileType::Regular.bits() | 0o644).unwrap();
        overlay.unlink(overlay.root_ino(), "a").unwrap();
        assert!(overlay.lookup(overlay.root_ino(), "a").is_err());
    }

    #[test]
    fn reserved_deletion_log_path_is_not_addressable() {
        let overlay = new_overlay();
        let err = overlay
            .create(overlay.root_ino(), ".deleted", FileType::Regular.bits() | 0o644)
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::Perm);
    }

    #[test]
    fn readdir_unions_upper_and_lower_without_duplicates() {
        let lower = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        lower
            .commit_new_file(0, "shared", FileType::Regular.bits() | 0o644, 0)
            .unwrap();
        lower
            .commit_new_file(0, "lower_only", FileType::Regular.bits() | 0o644, 0)
            .unwrap();

        let upper = StoreFS::new(MemStore::new(), 0, 0).unwrap();
        upper
            .commit_new_file(0, "shared", FileType::Regular.bits() | 0o644, 0)
            .unwrap();
        upper
            .commit_new_file(0, "upper_only", FileType::Regular.bits() | 0o644, 0)
            .unwrap();

        let overlay = OverlayFS::new(Box::new(lower), Box::new(upper)).unwrap();
        let mut names: Vec<String> = overlay
            .readdir(overlay.root_ino())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        names.sort();
        assert_eq!(names, vec!["lower_only", "shared", "upper_only"]);
    }
}
