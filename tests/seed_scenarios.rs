//! End-to-end scenarios over the public `Vfs` surface, one per documented
//! seed scenario: round-trip, recursive mkdir, hardlink unlink, rename
//! overwrite rules, and device behavior. Overlay copy-up has its own
//! dedicated coverage in `overlayfs`'s unit tests, since `Vfs::mount` takes
//! an `Arc<dyn FileSystem>` while `OverlayFS::new` composes boxed backends.

use std::sync::Arc;

use vfscore::{
    flags::{FileType, O_CREAT, O_EXCL, O_RDONLY, O_WRONLY},
    Credentials, DeviceFS, ErrCode, FileSystem, MemStore, StoreFS, Vfs, VfsConfig,
};

fn mounted_vfs() -> Vfs {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new(VfsConfig::default());
    let root: Arc<dyn FileSystem> = Arc::new(StoreFS::new(MemStore::new(), 0, 0).unwrap());
    vfs.mount("/", root).unwrap();
    vfs
}

#[test]
fn create_read_write_close_round_trip() {
    let vfs = mounted_vfs();
    let fd = vfs
        .open("/a.txt", O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    vfs.write(fd, b"hello").unwrap();
    vfs.close(fd).unwrap();

    let fd2 = vfs.open("/a.txt", O_RDONLY, 0, Credentials::ROOT).unwrap();
    let mut buf = [0u8; 5];
    let n = vfs.read(fd2, &mut buf).unwrap();
    vfs.close(fd2).unwrap();

    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(vfs.stat("/a.txt").unwrap().size, 5);
}

#[test]
fn mkdir_p_recursion_then_readdir() {
    let vfs = mounted_vfs();
    vfs.mkdir_p("/x/y/z", 0o755, Credentials::ROOT).unwrap();
    let entries = vfs.readdir("/x/y").unwrap();
    assert!(entries.iter().any(|(name, _)| name == "z"));
    assert!(vfs.stat("/x/y/z").unwrap().mode & vfscore::flags::S_IFMT == FileType::Directory.bits() & vfscore::flags::S_IFMT);
}

#[test]
fn unlink_with_two_hardlinks() {
    let vfs = mounted_vfs();
    let fd = vfs
        .open("/a", O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    vfs.write(fd, b"X").unwrap();
    vfs.close(fd).unwrap();

    vfs.link("/a", "/b").unwrap();
    vfs.unlink("/a").unwrap();

    let fd2 = vfs.open("/b", O_RDONLY, 0, Credentials::ROOT).unwrap();
    let mut buf = [0u8; 1];
    vfs.read(fd2, &mut buf).unwrap();
    vfs.close(fd2).unwrap();

    assert_eq!(&buf, b"X");
    assert_eq!(vfs.stat("/b").unwrap().nlink, 1);
}

#[test]
fn rename_overwriting_a_file_but_not_a_directory() {
    let vfs = mounted_vfs();
    vfs.mkdir("/d", 0o755, Credentials::ROOT).unwrap();

    let fd = vfs
        .open("/f", O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    vfs.write(fd, b"Y").unwrap();
    vfs.close(fd).unwrap();

    let err = vfs.rename("/f", "/d").unwrap_err();
    assert_eq!(err.code, ErrCode::Perm);

    let fd2 = vfs
        .open("/g", O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    vfs.write(fd2, b"Z").unwrap();
    vfs.close(fd2).unwrap();

    vfs.rename("/g", "/f").unwrap();

    let fd3 = vfs.open("/f", O_RDONLY, 0, Credentials::ROOT).unwrap();
    let mut buf = [0u8; 1];
    vfs.read(fd3, &mut buf).unwrap();
    vfs.close(fd3).unwrap();
    assert_eq!(&buf, b"Z");
}

#[test]
fn rename_creating_a_name_twice_is_exclusive() {
    let vfs = mounted_vfs();
    vfs.open("/only-once", O_CREAT | O_EXCL | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    let err = vfs
        .open("/only-once", O_CREAT | O_EXCL | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap_err();
    assert_eq!(err.code, ErrCode::Exist);
}

#[test]
fn device_behavior_zero_full_and_null() {
    let vfs = mounted_vfs();
    let devfs: Arc<dyn FileSystem> = Arc::new(DeviceFS::new());
    vfs.mount("/dev", devfs).unwrap();

    let mut buf = [0xffu8; 16];
    let fd = vfs.open("/dev/zero", O_RDONLY, 0, Credentials::ROOT).unwrap();
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 16);
    vfs.close(fd).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    let full_fd = vfs.open("/dev/full", O_WRONLY, 0, Credentials::ROOT).unwrap();
    let err = vfs.write(full_fd, b"x").unwrap_err();
    assert_eq!(err.code, ErrCode::NoSpc);
    vfs.close(full_fd).unwrap();

    let rec = vfs.lstat("/dev/null").unwrap();
    assert_eq!(
        FileType::from_mode(rec.mode),
        Some(FileType::CharDevice)
    );
}

#[test]
fn self_rename_of_a_directory_into_its_own_descendant_is_refused() {
    let vfs = mounted_vfs();
    vfs.mkdir_p("/p/q", 0o755, Credentials::ROOT).unwrap();
    let err = vfs.rename("/p", "/p/q/moved").unwrap_err();
    assert_eq!(err.code, ErrCode::Busy);
    // tree unchanged
    assert!(vfs.readdir("/p").unwrap().iter().any(|(n, _)| n == "q"));
}
