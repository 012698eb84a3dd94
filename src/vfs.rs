//! The top-level VFS dispatch layer (§4.4 C9): path normalization, mount
//! resolution, symlink following, the open state machine, and the full
//! POSIX-ish surface listed in §6.
//!
//! Grounded on `vfs::ops::vfs_open`/`vfs_stat`/`VfsHandle` (mount-resolve
//! then stat-or-create), generalized to the complete §4.4 state machine
//! (excl/trunc/append/create, access checks, symlink following with a depth
//! cap) and the extended surface §6 lists (`readlink`, `access`,
//! `chmod`/`chown`/`utimes`, `statfs`, `realpath`, `copy_file`, `readv`/
//! `writev`, recursive `cp`/`rm`, `mkdtemp`, xattr, `ioctl`).

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::config::VfsConfig;
use crate::error::{
    access_denied, already_exists, busy, cross_device, invalid_argument, is_a_directory, no_data,
    no_space, not_a_directory, not_permitted, not_supported, read_only, too_many_links, VfsResult,
};
use crate::flags::{AccessMask, FileType, OpenFlags};
use crate::fstrait::FileSystem;
use crate::handle::FdTable;
use crate::ino::{Ino, InodeRecord};
use crate::mount::MountTable;
use crate::pathutil::{join, normalize, split_parent};

/// A path resolved all the way down to a concrete backend inode.
pub struct Resolved {
    pub fs: Arc<dyn FileSystem>,
    pub ino: Ino,
    pub canonical_path: String,
}

/// Caller identity used for permission checks (§4.4 "effective uid/gid").
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials { uid: 0, gid: 0 };
}

/// Coarse `statfs`-style summary; this crate has no fixed block size or
/// physical capacity, so most fields are nominal.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u64,
    pub mounts: usize,
}

/// Closed `ioctl` command set (§6: "commands are a closed symbolic enum, not
/// raw integers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCommand {
    GetFlags,
    SetFlags(u32),
    GetVersion,
    SetVersion(u64),
    GetXattr,
    SetXattr,
    GetLabel,
    SetLabel,
    GetUuid,
    GetSysfsPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlResult {
    Flags(u32),
    Version(u64),
    Unit,
    NotApplicable,
}

/// Ties a mount table, configuration, and per-context FD table together
/// into the single entry point user code calls through.
pub struct Vfs {
    mounts: MountTable,
    config: VfsConfig,
    fds: Mutex<FdTable>,
}

impl Vfs {
    pub fn new(config: VfsConfig) -> Self {
        Self {
            mounts: MountTable::new(),
            config,
            fds: Mutex::new(FdTable::new()),
        }
    }

    pub fn mount(&self, path: &str, fs: Arc<dyn FileSystem>) -> VfsResult<()> {
        info!("mount {path} -> {}", fs.name());
        self.mounts.mount(path, fs)
    }

    pub fn unmount(&self, path: &str) -> VfsResult<()> {
        info!("unmount {path}");
        self.mounts.unmount(path)
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    // ---- path resolution --------------------------------------------

    fn walk_mount(&self, path: &str) -> VfsResult<(Arc<dyn FileSystem>, Ino)> {
        let (fs, local) = self.mounts.resolve(path)?;
        let mut ino = fs.root_ino();
        if local != "/" {
            for comp in local.trim_start_matches('/').split('/') {
                ino = fs.lookup(ino, comp)?;
            }
        }
        Ok((fs, ino))
    }

    /// Resolve `path`, following a trailing symlink (and every symlink it in
    /// turn points to) up to [`VfsConfig::max_symlink_depth`] hops (§4.4).
    pub fn resolve(&self, path: &str, preserve_symlinks: bool) -> VfsResult<Resolved> {
        self.resolve_depth(path, preserve_symlinks, 0)
    }

    fn resolve_depth(&self, path: &str, preserve_symlinks: bool, depth: u32) -> VfsResult<Resolved> {
        if path.contains('\0') {
            return Err(invalid_argument().with_path(path));
        }
        let normalized = normalize(path);
        let (fs, ino) = self.walk_mount(&normalized)?;
        if preserve_symlinks {
            return Ok(Resolved {
                fs,
                ino,
                canonical_path: normalized,
            });
        }
        let rec = fs.stat(ino)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Symlink) {
            if depth >= self.config.max_symlink_depth {
                return Err(too_many_links().with_path(path));
            }
            let mut buf = vec![0u8; rec.size as usize];
            fs.read(ino, 0, &mut buf)?;
            let target = String::from_utf8(buf).map_err(|_| invalid_argument())?;
            let next_path = if target.starts_with('/') {
                target
            } else {
                let (parent, _) = split_parent(&normalized).unwrap_or(("/".to_string(), String::new()));
                join(&parent, &target)
            };
            return self.resolve_depth(&next_path, false, depth + 1);
        }
        Ok(Resolved {
            fs,
            ino,
            canonical_path: normalized,
        })
    }

    /// Resolve `path`'s parent directory, returning `(fs, parent_ino,
    /// base_name)`. Does not itself check that `base_name` exists.
    fn resolve_parent(&self, path: &str) -> VfsResult<(Arc<dyn FileSystem>, Ino, String)> {
        let normalized = normalize(path);
        let (parent_path, base) = split_parent(&normalized).ok_or_else(|| invalid_argument().with_path(path))?;
        let resolved = self.resolve(&parent_path, false)?;
        let rec = resolved.fs.stat(resolved.ino)?;
        if FileType::from_mode(rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory().with_path(path));
        }
        Ok((resolved.fs, resolved.ino, base))
    }

    pub fn realpath(&self, path: &str) -> VfsResult<String> {
        Ok(self.resolve(path, false)?.canonical_path)
    }

    // ---- metadata -----------------------------------------------------

    pub fn stat(&self, path: &str) -> VfsResult<InodeRecord> {
        let r = self.resolve(path, false)?;
        r.fs.stat(r.ino).map_err(|e| e.rewrite_path(path.to_string()))
    }

    pub fn lstat(&self, path: &str) -> VfsResult<InodeRecord> {
        let r = self.resolve(path, true)?;
        r.fs.stat(r.ino).map_err(|e| e.rewrite_path(path.to_string()))
    }

    pub fn access(&self, path: &str, mask: AccessMask, who: Credentials) -> VfsResult<()> {
        let rec = self.stat(path)?;
        if mask.check(rec.mode & 0o777, rec.uid, rec.gid, who.uid, who.gid) {
            Ok(())
        } else {
            Err(access_denied().with_path(path))
        }
    }

    pub fn chmod(&self, path: &str, mode: u32, follow: bool) -> VfsResult<()> {
        let r = self.resolve(path, !follow)?;
        r.fs.set_attr(r.ino, &mut |rec| {
            rec.mode = (rec.mode & !0o7777) | (mode & 0o7777);
        })
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>, follow: bool) -> VfsResult<()> {
        let r = self.resolve(path, !follow)?;
        r.fs.set_attr(r.ino, &mut |rec| {
            if let Some(uid) = uid {
                rec.uid = uid;
            }
            if let Some(gid) = gid {
                rec.gid = gid;
            }
        })
    }

    pub fn utimes(&self, path: &str, atime: Option<i64>, mtime: Option<i64>, follow: bool) -> VfsResult<()> {
        let r = self.resolve(path, !follow)?;
        r.fs.set_attr(r.ino, &mut |rec| {
            if let Some(a) = atime {
                rec.atime = a;
            }
            if let Some(m) = mtime {
                rec.mtime = m;
            }
        })
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: 4096,
            mounts: self.mounts.mount_count(),
        }
    }

    // ---- open/close/read/write -----------------------------------------

    fn effective_create_mode(&self, parent_rec: &InodeRecord, requested_mode: u32, is_dir: bool) -> u32 {
        let mut mode = requested_mode & 0o7777;
        if parent_rec.mode & crate::flags::S_ISGID != 0 {
            mode |= crate::flags::S_ISGID;
            if !is_dir {
                mode &= !0o010; // drop group-exec unless explicitly requested
                mode |= requested_mode & 0o010;
            }
        }
        mode
    }

    /// The open state machine (§4.4): parse flags, resolve (or create), and
    /// install a new FD.
    pub fn open(&self, path: &str, flag_bits: u32, mode: u32, who: Credentials) -> VfsResult<i32> {
        let flags = OpenFlags::parse(flag_bits);
        let normalized = normalize(path);

        let (fs, ino) = match self.resolve(&normalized, false) {
            Ok(resolved) => {
                if flags.excl && flags.create {
                    return Err(already_exists().with_path(path));
                }
                let rec = resolved.fs.stat(resolved.ino)?;
                let is_dir = FileType::from_mode(rec.mode) == Some(FileType::Directory);
                if is_dir && flags.write {
                    return Err(is_a_directory().with_path(path));
                }
                let wanted = AccessMask {
                    read: flags.read,
                    write: flags.write,
                    exec: false,
                };
                if !wanted.check(rec.mode & 0o777, rec.uid, rec.gid, who.uid, who.gid) {
                    return Err(access_denied().with_path(path));
                }
                if flags.trunc && flags.write && !is_dir {
                    resolved.fs.truncate(resolved.ino, 0)?;
                }
                (resolved.fs, resolved.ino)
            }
            Err(e) if e.code == crate::error::ErrCode::NoEnt && flags.create => {
                let (parent_fs, parent_ino, base) = self.resolve_parent(&normalized)?;
                let parent_rec = parent_fs.stat(parent_ino)?;
                let write_mask = AccessMask::WRITE;
                if !write_mask.check(parent_rec.mode & 0o777, parent_rec.uid, parent_rec.gid, who.uid, who.gid) {
                    return Err(access_denied().with_path(path));
                }
                let effective = self.effective_create_mode(&parent_rec, mode, false);
                let new_ino = parent_fs.create(parent_ino, &base, FileType::Regular.bits() | effective)?;
                (parent_fs, new_ino)
            }
            Err(e) => return Err(e.rewrite_path(path.to_string())),
        };

        let backend_path = normalized.clone();
        let handle = crate::handle::Handle::new(fs, normalized, backend_path, ino, flags);
        if let Some(limit) = self.config.max_open_files {
            if self.fds.lock().len_open() >= limit {
                return Err(no_space().with_syscall("open").with_path(path));
            }
        }
        Ok(self.fds.lock().insert(handle))
    }

    pub fn close(&self, fd: i32) -> VfsResult<()> {
        self.fds.lock().close(fd)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> VfsResult<usize> {
        let mut table = self.fds.lock();
        let handle = table.get_mut(fd)?;
        if !handle.flags.read {
            return Err(not_permitted().with_syscall("read"));
        }
        handle.read(buf)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> VfsResult<usize> {
        let mut table = self.fds.lock();
        let handle = table.get_mut(fd)?;
        if !handle.flags.write {
            return Err(not_permitted().with_syscall("write"));
        }
        if handle.fs.is_read_only() {
            return Err(read_only().with_syscall("write"));
        }
        handle.write(buf)
    }

    pub fn seek(&self, fd: i32, position: u64) -> VfsResult<()> {
        self.fds.lock().get_mut(fd)?.seek(position);
        Ok(())
    }

    pub fn readv(&self, fd: i32, bufs: &mut [&mut [u8]]) -> VfsResult<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.read(fd, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn writev(&self, fd: i32, bufs: &[&[u8]]) -> VfsResult<usize> {
        let mut total = 0;
        for buf in bufs {
            total += self.write(fd, buf)?;
        }
        Ok(total)
    }

    pub fn truncate_path(&self, path: &str, size: u64) -> VfsResult<()> {
        let r = self.resolve(path, false)?;
        r.fs.truncate(r.ino, size)
    }

    // ---- directory / link operations -----------------------------------

    pub fn mkdir(&self, path: &str, mode: u32, who: Credentials) -> VfsResult<()> {
        let (parent_fs, parent_ino, base) = self.resolve_parent(path)?;
        let parent_rec = parent_fs.stat(parent_ino)?;
        if !AccessMask::WRITE.check(parent_rec.mode & 0o777, parent_rec.uid, parent_rec.gid, who.uid, who.gid) {
            return Err(access_denied().with_path(path));
        }
        let effective = self.effective_create_mode(&parent_rec, mode, true);
        parent_fs
            .create(parent_ino, &base, FileType::Directory.bits() | effective)
            .map(|_| ())
            .map_err(|e| e.rewrite_path(path.to_string()))
    }

    /// `mkdir -p`: create every missing ancestor, succeeding if the full
    /// path already exists as a directory (§8 scenario 2).
    pub fn mkdir_p(&self, path: &str, mode: u32, who: Credentials) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut built = String::new();
        for comp in normalized.trim_start_matches('/').split('/') {
            if comp.is_empty() {
                continue;
            }
            built = join(&built, comp);
            match self.mkdir(&built, mode, who) {
                Ok(()) => {}
                Err(e) if e.code == crate::error::ErrCode::Exist => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let (parent_fs, parent_ino, base) = self.resolve_parent(path)?;
        let ino = parent_fs.lookup(parent_ino, &base).map_err(|e| e.rewrite_path(path.to_string()))?;
        let rec = parent_fs.stat(ino)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            return Err(is_a_directory().with_path(path));
        }
        parent_fs.unlink(parent_ino, &base).map_err(|e| e.rewrite_path(path.to_string()))
    }

    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let (parent_fs, parent_ino, base) = self.resolve_parent(path)?;
        let ino = parent_fs.lookup(parent_ino, &base).map_err(|e| e.rewrite_path(path.to_string()))?;
        let rec = parent_fs.stat(ino)?;
        if FileType::from_mode(rec.mode) != Some(FileType::Directory) {
            return Err(not_a_directory().with_path(path));
        }
        parent_fs.unlink(parent_ino, &base).map_err(|e| e.rewrite_path(path.to_string()))
    }

    pub fn readdir(&self, path: &str) -> VfsResult<Vec<(String, Ino)>> {
        let r = self.resolve(path, false)?;
        let mut entries = r.fs.readdir(r.ino).map_err(|e| e.rewrite_path(path.to_string()))?;
        let mut names: std::collections::HashSet<String> = entries.iter().map(|(n, _)| n.clone()).collect();
        self.mounts.for_each_child_mount(&r.canonical_path, |name| {
            if names.insert(name.to_string()) {
                entries.push((name.to_string(), 0));
            }
        });
        Ok(entries)
    }

    pub fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let old_norm = normalize(old);
        let new_norm = normalize(new);
        // A directory cannot be renamed into its own descendant: testable
        // as `(newParent + "/")` starting with `(oldPath + "/")` (§4.4/I8).
        let old_prefix = if old_norm == "/" { "/".to_string() } else { format!("{old_norm}/") };
        if new_norm == old_norm || new_norm.starts_with(&old_prefix) {
            return Err(busy().with_path(new).with_syscall("rename"));
        }

        let (old_fs, old_parent, old_base) = self.resolve_parent(&old_norm)?;
        let (new_fs, new_parent, new_base) = self.resolve_parent(&new_norm)?;
        if !Arc::ptr_eq(&old_fs, &new_fs) {
            return Err(cross_device().with_path(new));
        }
        old_fs
            .rename(old_parent, &old_base, new_parent, &new_base)
            .map_err(|e| e.rewrite_path(old.to_string()))
    }

    pub fn link(&self, existing: &str, new: &str) -> VfsResult<()> {
        let existing_resolved = self.resolve(existing, false)?;
        let (new_fs, new_parent, new_base) = self.resolve_parent(new)?;
        if !Arc::ptr_eq(&existing_resolved.fs, &new_fs) {
            return Err(cross_device().with_path(new));
        }
        new_fs
            .link(existing_resolved.ino, new_parent, &new_base)
            .map_err(|e| e.rewrite_path(new.to_string()))
    }

    pub fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        let (parent_fs, parent_ino, base) = self.resolve_parent(link_path)?;
        let ino = parent_fs
            .create(parent_ino, &base, FileType::Symlink.bits() | 0o777)
            .map_err(|e| e.rewrite_path(link_path.to_string()))?;
        parent_fs.write(ino, 0, target.as_bytes())?;
        parent_fs.set_attr(ino, &mut |rec| rec.size = target.len() as u64)
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let r = self.resolve(path, true)?;
        let rec = r.fs.stat(r.ino)?;
        if FileType::from_mode(rec.mode) != Some(FileType::Symlink) {
            return Err(invalid_argument().with_path(path));
        }
        let mut buf = vec![0u8; rec.size as usize];
        r.fs.read(r.ino, 0, &mut buf)?;
        String::from_utf8(buf).map_err(|_| invalid_argument().with_path(path))
    }

    // ---- copy / recursive helpers ---------------------------------------

    pub fn copy_file(&self, src: &str, dst: &str, who: Credentials) -> VfsResult<u64> {
        let src_fd = self.open(src, crate::flags::O_RDONLY, 0, who)?;
        let dst_fd = self.open(
            dst,
            crate::flags::O_WRONLY | crate::flags::O_CREAT | crate::flags::O_TRUNC,
            0o644,
            who,
        )?;
        let mut total = 0u64;
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(src_fd, &mut buf)?;
            if n == 0 {
                break;
            }
            self.write(dst_fd, &buf[..n])?;
            total += n as u64;
        }
        self.close(src_fd)?;
        self.close(dst_fd)?;
        Ok(total)
    }

    /// Recursively copy a file or directory tree.
    pub fn cp_recursive(&self, src: &str, dst: &str, who: Credentials) -> VfsResult<()> {
        let rec = self.stat(src)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            self.mkdir_p(dst, rec.mode & 0o7777, who)?;
            for (name, _) in self.readdir(src)? {
                self.cp_recursive(&join(src, &name), &join(dst, &name), who)?;
            }
            Ok(())
        } else {
            self.copy_file(src, dst, who).map(|_| ())
        }
    }

    /// Recursively remove a file or directory tree.
    pub fn rm_recursive(&self, path: &str) -> VfsResult<()> {
        let rec = self.stat(path)?;
        if FileType::from_mode(rec.mode) == Some(FileType::Directory) {
            for (name, _) in self.readdir(path)? {
                self.rm_recursive(&join(path, &name))?;
            }
            self.rmdir(path)
        } else {
            self.unlink(path)
        }
    }

    /// Create a uniquely named temporary directory under `template`'s
    /// parent, replacing a trailing run of `X` characters with random
    /// alphanumerics (mirroring POSIX `mkdtemp`).
    pub fn mkdtemp(&self, template: &str, who: Credentials) -> VfsResult<String> {
        if !template.ends_with("XXXXXX") {
            return Err(invalid_argument().with_path(template));
        }
        let prefix = &template[..template.len() - 6];
        let mut rng = rand::thread_rng();
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        for _ in 0..100 {
            let suffix: String = (0..6)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            let candidate = format!("{prefix}{suffix}");
            match self.mkdir(&candidate, 0o700, who) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.code == crate::error::ErrCode::Exist => continue,
                Err(e) => return Err(e),
            }
        }
        Err(busy().with_path(template))
    }

    // ---- extended attributes --------------------------------------------

    pub fn xattr_get(&self, path: &str, name: &str) -> VfsResult<Vec<u8>> {
        let rec = self.stat(path)?;
        rec.attributes.get(name).cloned().ok_or_else(|| no_data().with_path(path))
    }

    pub fn xattr_set(&self, path: &str, name: &str, value: Vec<u8>, create_only: bool, replace_only: bool) -> VfsResult<()> {
        let namespace = name.split('.').next().unwrap_or("");
        if !self.config.allows_namespace(namespace) {
            return Err(not_supported().with_path(path));
        }
        let r = self.resolve(path, false)?;
        let existing = r.fs.stat(r.ino)?.attributes.contains_key(name);
        if create_only && existing {
            return Err(already_exists().with_path(path));
        }
        if replace_only && !existing {
            return Err(no_data().with_path(path));
        }
        let name_owned = name.to_string();
        r.fs.set_attr(r.ino, &mut |rec| {
            rec.attributes.insert(name_owned.clone(), value.clone());
        })
    }

    pub fn xattr_remove(&self, path: &str, name: &str) -> VfsResult<()> {
        let r = self.resolve(path, false)?;
        let existing = r.fs.stat(r.ino)?.attributes.contains_key(name);
        if !existing {
            return Err(no_data().with_path(path));
        }
        let name_owned = name.to_string();
        r.fs.set_attr(r.ino, &mut |rec| {
            rec.attributes.remove(&name_owned);
        })
    }

    pub fn xattr_list(&self, path: &str) -> VfsResult<Vec<String>> {
        let rec = self.stat(path)?;
        Ok(rec.attributes.keys().cloned().collect())
    }

    // ---- ioctl -----------------------------------------------------------

    pub fn ioctl(&self, path: &str, cmd: IoctlCommand) -> VfsResult<IoctlResult> {
        match cmd {
            IoctlCommand::GetFlags => Ok(IoctlResult::Flags(self.stat(path)?.flags)),
            IoctlCommand::SetFlags(bits) => {
                let r = self.resolve(path, false)?;
                r.fs.set_attr(r.ino, &mut |rec| rec.flags = bits)?;
                Ok(IoctlResult::Unit)
            }
            IoctlCommand::GetVersion => Ok(IoctlResult::Version(self.stat(path)?.version)),
            IoctlCommand::SetVersion(v) => {
                let r = self.resolve(path, false)?;
                r.fs.set_attr(r.ino, &mut |rec| rec.version = v)?;
                Ok(IoctlResult::Unit)
            }
            IoctlCommand::GetXattr
            | IoctlCommand::SetXattr
            | IoctlCommand::GetLabel
            | IoctlCommand::SetLabel
            | IoctlCommand::GetUuid
            | IoctlCommand::GetSysfsPath => {
                warn!("ioctl: {cmd:?} has no backing implementation, returning NotApplicable");
                Ok(IoctlResult::NotApplicable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::storefs::StoreFS;

    fn new_vfs() -> Vfs {
        let vfs = Vfs::new(VfsConfig::default());
        let root: Arc<dyn FileSystem> = Arc::new(StoreFS::new(MemStore::new(), 0, 0).unwrap());
        vfs.mount("/", root).unwrap();
        vfs
    }

    #[test]
    fn create_read_write_close_roundtrip() {
        let vfs = new_vfs();
        let fd = vfs
            .open("/a.txt", crate::flags::O_CREAT | crate::flags::O_WRONLY, 0o644, Credentials::ROOT)
            .unwrap();
        vfs.write(fd, b"hello").unwrap();
        vfs.close(fd).unwrap();

        let fd2 = vfs.open("/a.txt", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap();
        let mut buf = [0u8; 5];
        vfs.read(fd2, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(vfs.stat("/a.txt").unwrap().size, 5);
    }

    #[test]
    fn mkdir_p_recursion_then_readdir() {
        let vfs = new_vfs();
        vfs.mkdir_p("/x/y/z", 0o755, Credentials::ROOT).unwrap();
        let entries = vfs.readdir("/x/y").unwrap();
        assert!(entries.iter().any(|(n, _)| n == "z"));
    }

    #[test]
    fn unlink_with_two_hardlinks() {
        let vfs = new_vfs();
        let fd = vfs
            .open("/a", crate::flags::O_CREAT | crate::flags::O_WRONLY, 0o644, Credentials::ROOT)
            .unwrap();
        vfs.write(fd, b"X").unwrap();
        vfs.close(fd).unwrap();
        vfs.link("/a", "/b").unwrap();
        vfs.unlink("/a").unwrap();

        let fd2 = vfs.open("/b", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap();
        let mut buf = [0u8; 1];
        vfs.read(fd2, &mut buf).unwrap();
        assert_eq!(&buf, b"X");
        assert_eq!(vfs.stat("/b").unwrap().nlink, 1);
    }

    #[test]
    fn rename_onto_directory_is_rejected() {
        let vfs = new_vfs();
        vfs.mkdir("/d", 0o755, Credentials::ROOT).unwrap();
        let fd = vfs
            .open("/f", crate::flags::O_CREAT | crate::flags::O_WRONLY, 0o644, Credentials::ROOT)
            .unwrap();
        vfs.write(fd, b"Y").unwrap();
        vfs.close(fd).unwrap();

        let err = vfs.rename("/f", "/d").unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::Perm);

        let fd2 = vfs
            .open("/g", crate::flags::O_CREAT | crate::flags::O_WRONLY, 0o644, Credentials::ROOT)
            .unwrap();
        vfs.write(fd2, b"Z").unwrap();
        vfs.close(fd2).unwrap();
        vfs.rename("/g", "/f").unwrap();

        let fd3 = vfs.open("/f", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap();
        let mut buf = [0u8; 1];
        vfs.read(fd3, &mut buf).unwrap();
        assert_eq!(&buf, b"Z");
    }

    #[test]
    fn rename_of_directory_into_its_own_descendant_is_busy() {
        let vfs = new_vfs();
        vfs.mkdir_p("/p/q", 0o755, Credentials::ROOT).unwrap();
        let err = vfs.rename("/p", "/p/q/moved").unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::Busy);
        assert!(vfs.readdir("/p").unwrap().iter().any(|(n, _)| n == "q"));
    }

    #[test]
    fn symlink_resolves_to_target_contents() {
        let vfs = new_vfs();
        let fd = vfs
            .open("/real", crate::flags::O_CREAT | crate::flags::O_WRONLY, 0o644, Credentials::ROOT)
            .unwrap();
        vfs.write(fd, b"payload").unwrap();
        vfs.close(fd).unwrap();
        vfs.symlink("/real", "/link").unwrap();

        assert_eq!(vfs.readlink("/link").unwrap(), "/real");
        let fd2 = vfs.open("/link", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap();
        let mut buf = [0u8; 7];
        vfs.read(fd2, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn self_referential_symlink_is_eloop() {
        let vfs = new_vfs();
        vfs.symlink("/loop", "/loop").unwrap();
        let err = vfs.open("/loop", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::Loop);
    }

    #[test]
    fn device_zero_and_full_behave_per_spec() {
        let vfs = new_vfs();
        let devfs: Arc<dyn FileSystem> = Arc::new(crate::devicefs::DeviceFS::new());
        vfs.mount("/dev", devfs).unwrap();

        let mut buf = [0xffu8; 16];
        let fd = vfs.open("/dev/zero", crate::flags::O_RDONLY, 0, Credentials::ROOT).unwrap();
        vfs.read(fd, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let full_fd = vfs
            .open("/dev/full", crate::flags::O_WRONLY, 0, Credentials::ROOT)
            .unwrap();
        let err = vfs.write(full_fd, b"x").unwrap_err();
        assert_eq!(err.code, crate::error::ErrCode::NoSpc);

        let rec = vfs.lstat("/dev/null").unwrap();
        assert_eq!(crate::flags::FileType::from_mode(rec.mode), Some(crate::flags::FileType::CharDevice));
    }
}
