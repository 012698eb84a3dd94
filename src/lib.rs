//! An in-process, pluggable virtual file system: a POSIX-like path/FD
//! surface over one or more backing stores, with an overlay FS for
//! writable-over-readonly composition and a small device FS for synthetic
//! files like `/dev/null`.
//!
//! The entry point is [`vfs::Vfs`]: mount one or more [`fstrait::FileSystem`]
//! implementations ([`storefs::StoreFS`], [`indexfs::IndexFS`],
//! [`devicefs::DeviceFS`], [`overlayfs::OverlayFS`]) onto it and drive it
//! through `open`/`read`/`write`/`stat`/... .

pub mod config;
pub mod devicefs;
pub mod error;
pub mod flags;
pub mod fstrait;
pub mod handle;
pub mod indexfs;
pub mod ino;
pub mod mount;
pub mod overlayfs;
pub mod pathutil;
pub mod store;
pub mod storefs;
pub mod vfs;

pub use config::VfsConfig;
pub use devicefs::DeviceFS;
pub use error::{ErrCode, VfsError, VfsResult};
pub use flags::{AccessMask, FileType, OpenFlags};
pub use fstrait::FileSystem;
pub use handle::{FdTable, Handle};
pub use indexfs::IndexFS;
pub use ino::{DirListing, Ino, InodeRecord};
pub use mount::MountTable;
pub use overlayfs::OverlayFS;
pub use store::{MemStore, Store, Transaction};
pub use storefs::StoreFS;
pub use vfs::{Credentials, IoctlCommand, IoctlResult, Resolved, StatFs, Vfs};
