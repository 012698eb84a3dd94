//! Property-based checks for the invariants that must hold after arbitrary
//! sequences of file operations, not just the happy-path seed scenarios.

use std::sync::Arc;

use proptest::prelude::*;
use vfscore::{
    flags::{O_CREAT, O_RDONLY, O_WRONLY},
    Credentials, DeviceFS, FileSystem, MemStore, StoreFS, Vfs, VfsConfig,
};

fn mounted_vfs() -> Vfs {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new(VfsConfig::default());
    let root: Arc<dyn FileSystem> = Arc::new(StoreFS::new(MemStore::new(), 0, 0).unwrap());
    vfs.mount("/", root).unwrap();
    vfs
}

fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
    let fd = vfs
        .open(path, O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)
        .unwrap();
    vfs.write(fd, data).unwrap();
    vfs.close(fd).unwrap();
}

fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
    let fd = vfs.open(path, O_RDONLY, 0, Credentials::ROOT).unwrap();
    let size = vfs.stat(path).unwrap().size as usize;
    let mut buf = vec![0u8; size];
    vfs.read(fd, &mut buf).unwrap();
    vfs.close(fd).unwrap();
    buf
}

proptest! {
    // I1: round-trip for arbitrary non-empty byte strings under arbitrary names.
    #[test]
    fn round_trip_write_then_read(name in "[a-z][a-z0-9_]{0,15}", data in prop::collection::vec(any::<u8>(), 0..256)) {
        let vfs = mounted_vfs();
        let path = format!("/{}", name);
        write_file(&vfs, &path, &data);
        prop_assert_eq!(read_file(&vfs, &path), data.clone());
        prop_assert_eq!(vfs.stat(&path).unwrap().size as usize, data.len());
    }

    // I2 + I3: after a random sequence of create/link/unlink, nlink equals
    // the number of surviving names and every surviving name resolves.
    #[test]
    fn link_counting_and_no_dangling_entries(
        ops in prop::collection::vec(0u8..3, 1..12),
    ) {
        let vfs = mounted_vfs();
        write_file(&vfs, "/seed", b"payload");
        let mut names = vec!["seed".to_string()];
        let mut next = 0u32;

        for op in ops {
            match op {
                // link the first surviving name to a fresh name
                0 => {
                    if let Some(src) = names.first().cloned() {
                        next += 1;
                        let dst = format!("alias{next}");
                        if vfs.link(&format!("/{src}"), &format!("/{dst}")).is_ok() {
                            names.push(dst);
                        }
                    }
                }
                // unlink the last surviving name, unless it's the only one
                1 => {
                    if names.len() > 1 {
                        let victim = names.pop().unwrap();
                        vfs.unlink(&format!("/{victim}")).unwrap();
                    }
                }
                // no-op read, exercises I3 on every iteration
                _ => {
                    for n in &names {
                        prop_assert!(vfs.stat(&format!("/{n}")).is_ok());
                    }
                }
            }
        }

        if let Some(first) = names.first() {
            let nlink = vfs.stat(&format!("/{first}")).unwrap().nlink as usize;
            prop_assert_eq!(nlink, names.len());
        }
        for n in &names {
            prop_assert!(vfs.stat(&format!("/{n}")).is_ok());
        }
    }

    // I4: root persists and stays a directory through arbitrary activity.
    #[test]
    fn root_persists_through_arbitrary_activity(names in prop::collection::vec("[a-z][a-z0-9]{0,8}", 0..8)) {
        let vfs = mounted_vfs();
        for n in &names {
            let _ = write_file_opt(&vfs, n);
        }
        let root = vfs.stat("/").unwrap();
        prop_assert_eq!(root.mode & vfscore::flags::S_IFMT, vfscore::flags::FileType::Directory.bits() & vfscore::flags::S_IFMT);
    }
}

fn write_file_opt(vfs: &Vfs, name: &str) -> vfscore::VfsResult<()> {
    let path = format!("/{name}");
    let fd = vfs.open(&path, O_CREAT | O_WRONLY, 0o644, Credentials::ROOT)?;
    vfs.write(fd, b"x")?;
    vfs.close(fd)
}

#[test]
fn device_fs_has_no_link_counting_surprises() {
    // Devices are not create/unlink/rename/link-able; sanity check the
    // error shape independent of the randomized suite above.
    let vfs = mounted_vfs();
    let devfs: Arc<dyn FileSystem> = Arc::new(DeviceFS::new());
    vfs.mount("/dev", devfs).unwrap();
    assert!(vfs.unlink("/dev/null").is_err());
    assert!(vfs.link("/dev/null", "/dev/null2").is_err());
}
