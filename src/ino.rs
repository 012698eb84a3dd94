//! The inode record (C2) and directory listing codec (C3).
//!
//! `InodeRecord` is encoded to a fixed-layout little-endian byte string per
//! §6 ("Implementations must preserve byte positions so stores populated by
//! one implementation are readable by another"); `DirListing` is encoded as
//! the UTF-8 JSON object §6 specifies.

use std::collections::BTreeMap;
use std::convert::TryInto;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, VfsResult};

/// 64-bit inode/data-blob key. The root directory is always `0`.
pub type Ino = u64;

pub const ROOT_INO: Ino = 0;

/// Milliseconds since the Unix epoch, the unit every timestamp field uses.
pub type MillisTime = i64;

/// Fixed-layout metadata block (§3 "Inode record").
///
/// Field order below is the on-the-wire order; do not reorder fields without
/// bumping a format version, since §6 requires byte-position stability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub ino: Ino,
    pub data: Ino,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: MillisTime,
    pub mtime: MillisTime,
    pub ctime: MillisTime,
    pub birthtime: MillisTime,
    pub flags: u32,
    pub version: u64,
    pub attributes: BTreeMap<String, Vec<u8>>,
}

/// Byte length of the fixed (non-attribute) portion of an encoded record.
const FIXED_LEN: usize = 8 * 2 // ino, data
    + 8 // size
    + 4 // mode
    + 4 // nlink
    + 4 // uid
    + 4 // gid
    + 8 * 4 // atime, mtime, ctime, birthtime
    + 4 // flags
    + 8; // version

impl InodeRecord {
    pub fn new_now(ino: Ino, data: Ino, mode: u32, uid: u32, gid: u32, now_ms: MillisTime) -> Self {
        Self {
            ino,
            data,
            size: 0,
            mode,
            nlink: 1,
            uid,
            gid,
            atime: now_ms,
            mtime: now_ms,
            ctime: now_ms,
            birthtime: now_ms,
            flags: 0,
            version: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn touch_mtime(&mut self, now_ms: MillisTime) {
        self.mtime = now_ms;
        self.ctime = now_ms;
        self.version += 1;
    }

    pub fn touch_ctime(&mut self, now_ms: MillisTime) {
        self.ctime = now_ms;
        self.version += 1;
    }

    pub fn touch_atime(&mut self, now_ms: MillisTime) {
        self.atime = now_ms;
    }

    /// Encode this record into the bit-stable little-endian wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_LEN + 64);
        buf.extend_from_slice(&self.ino.to_le_bytes());
        buf.extend_from_slice(&self.data.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.nlink.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.ctime.to_le_bytes());
        buf.extend_from_slice(&self.birthtime.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());

        // Attribute map: count, then (name-len u32, name bytes, value-len u32, value bytes)*
        buf.extend_from_slice(&(self.attributes.len() as u32).to_le_bytes());
        for (name, value) in &self.attributes {
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        buf
    }

    /// Decode a record previously produced by [`InodeRecord::encode`].
    pub fn decode(bytes: &[u8]) -> VfsResult<Self> {
        if bytes.len() < FIXED_LEN + 4 {
            return Err(invalid_argument().with_syscall("decode_inode"));
        }
        let mut off = 0usize;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let slice: [u8; N] = bytes[off..off + N]
                    .try_into()
                    .map_err(|_| invalid_argument())?;
                off += N;
                <$ty>::from_le_bytes(slice)
            }};
        }
        let ino = take!(u64);
        let data = take!(u64);
        let size = take!(u64);
        let mode = take!(u32);
        let nlink = take!(u32);
        let uid = take!(u32);
        let gid = take!(u32);
        let atime = take!(i64);
        let mtime = take!(i64);
        let ctime = take!(i64);
        let birthtime = take!(i64);
        let flags = take!(u32);
        let version = take!(u64);
        let attr_count = take!(u32) as usize;

        let mut attributes = BTreeMap::new();
        for _ in 0..attr_count {
            let name_len = take!(u32) as usize;
            if off + name_len > bytes.len() {
                return Err(invalid_argument());
            }
            let name = String::from_utf8(bytes[off..off + name_len].to_vec())
                .map_err(|_| invalid_argument())?;
            off += name_len;
            let val_len = take!(u32) as usize;
            if off + val_len > bytes.len() {
                return Err(invalid_argument());
            }
            let value = bytes[off..off + val_len].to_vec();
            off += val_len;
            attributes.insert(name, value);
        }

        Ok(Self {
            ino,
            data,
            size,
            mode,
            nlink,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            birthtime,
            flags,
            version,
            attributes,
        })
    }
}

/// A directory's data blob: child name → child inode id (§3 "Directory listing").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirListing(BTreeMap<String, Ino>);

impl DirListing {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<Ino> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: String, ino: Ino) {
        self.0.insert(name, ino);
    }

    pub fn remove(&mut self, name: &str) -> Option<Ino> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Ino)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Encode as the UTF-8 JSON object §6 specifies (name → decimal inode id).
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("directory listing must be serializable")
    }

    pub fn decode(bytes: &[u8]) -> VfsResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| invalid_argument().with_syscall("decode_dir"))
    }
}

/// Validate a single path component as a legal directory-entry name (§3).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_record_roundtrips_through_encode_decode() {
        let mut rec = InodeRecord::new_now(42, 43, 0o100644, 1000, 1000, 123_456);
        rec.attributes
            .insert("user.comment".to_string(), b"hi".to_vec());
        let bytes = rec.encode();
        let decoded = InodeRecord::decode(&bytes).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn dir_listing_roundtrips_through_json() {
        let mut dl = DirListing::new();
        dl.insert("a.txt".to_string(), 7);
        dl.insert("sub".to_string(), 8);
        let bytes = dl.encode();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("a.txt"));
        let decoded = DirListing::decode(&bytes).unwrap();
        assert_eq!(decoded.get("a.txt"), Some(7));
        assert_eq!(decoded.get("sub"), Some(8));
    }

    #[test]
    fn name_validation_rejects_dot_and_dotdot_and_slash() {
        assert!(is_valid_name("hello"));
        assert!(!is_valid_name("."));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a/b"));
    }
}
