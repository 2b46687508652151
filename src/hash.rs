// src/hash.rs

//! Content identity: the `Crc` lattice and file signatures.
//!
//! A [`Crc`] is a fixed-width content hash with non-value states:
//! - `Unknown`: not yet computed (never compares equal, not even to itself)
//! - `None`: the file does not exist
//! - `Empty` / `EmptyLnk`: empty regular file / empty symlink target, kept
//!   distinct so an empty file is never confused with an empty link
//! - `Reg(h)` / `Lnk(h)`: hash of regular content / of the link target
//!
//! A [`FileSig`] is the cheap identity `(mtime, tag)` used before a CRC has
//! been computed. A node known by signature is upgraded to CRC on demand by
//! rehashing, but only if the on-disk signature still equals the one stored
//! when the CRC was computed.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::digest::Accesses;

/// Nanoseconds since the Unix epoch. `0` means "no date".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FileDate(pub u64);

impl FileDate {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        FileDate(nanos)
    }

    pub fn from_system(t: SystemTime) -> Self {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        FileDate(nanos)
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }
}

/// What kind of filesystem object a signature describes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FileTag {
    #[default]
    None,
    Reg,
    Exe,
    Lnk,
    Empty,
    Dir,
}

impl FileTag {
    pub fn exists(self) -> bool {
        self != FileTag::None
    }

    /// Regular-ish content (something a `Reg` access can observe).
    pub fn is_reg(self) -> bool {
        matches!(self, FileTag::Reg | FileTag::Exe | FileTag::Empty)
    }
}

/// Cheap file identity: modification date plus object tag.
///
/// Two signatures compare equal iff both components match.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FileSig {
    pub date: FileDate,
    pub tag: FileTag,
}

impl FileSig {
    /// Probe the filesystem for the current signature of `path`.
    ///
    /// Symlinks are not followed: a link's signature describes the link
    /// itself, matching what jobs observe through `Lnk` accesses.
    pub fn probe(path: &Path) -> FileSig {
        match fs::symlink_metadata(path) {
            Ok(meta) => {
                let date = meta
                    .modified()
                    .map(FileDate::from_system)
                    .unwrap_or_default();
                let tag = if meta.file_type().is_symlink() {
                    FileTag::Lnk
                } else if meta.is_dir() {
                    FileTag::Dir
                } else if meta.len() == 0 {
                    FileTag::Empty
                } else {
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        if meta.permissions().mode() & 0o111 != 0 {
                            FileTag::Exe
                        } else {
                            FileTag::Reg
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        FileTag::Reg
                    }
                };
                FileSig { date, tag }
            }
            Err(_) => FileSig::default(),
        }
    }

    pub fn exists(self) -> bool {
        self.tag.exists()
    }
}

/// Content hash with its non-value lattice states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crc {
    /// Not yet computed. Never matches anything, including itself.
    #[default]
    Unknown,
    /// File is absent.
    None,
    /// Empty regular file.
    Empty,
    /// Empty (zero-length target) symlink.
    EmptyLnk,
    /// Hash of regular file content.
    Reg(u64),
    /// Hash of a symlink target.
    Lnk(u64),
}

impl Crc {
    pub fn is_valid(self) -> bool {
        self != Crc::Unknown
    }

    pub fn exists(self) -> bool {
        !matches!(self, Crc::Unknown | Crc::None)
    }

    /// Hash the file at `path`, classifying it into the lattice.
    ///
    /// Directories hash as `None`: the engine never takes a directory as a
    /// content dep.
    pub fn compute(path: &Path) -> Crc {
        match fs::symlink_metadata(path) {
            Err(_) => Crc::None,
            Ok(meta) if meta.file_type().is_symlink() => match fs::read_link(path) {
                Ok(tgt) => {
                    let bytes = tgt.as_os_str().as_encoded_bytes();
                    if bytes.is_empty() {
                        Crc::EmptyLnk
                    } else {
                        Crc::Lnk(hash_bytes(bytes))
                    }
                }
                Err(_) => Crc::None,
            },
            Ok(meta) if meta.is_dir() => Crc::None,
            Ok(meta) if meta.len() == 0 => Crc::Empty,
            Ok(_) => match hash_file(path) {
                Ok(h) => Crc::Reg(h),
                Err(_) => Crc::None,
            },
        }
    }

    /// Compare two CRCs, restricted to the projections selected by the
    /// access mask.
    ///
    /// - `Stat` sees only existence and object kind.
    /// - `Lnk` sees link content (a non-link is uniformly "not a link").
    /// - `Reg` sees regular content (a non-regular is uniformly "not regular").
    ///
    /// `Unknown` on either side never matches.
    pub fn matches(self, other: Crc, accesses: Accesses) -> bool {
        if self == Crc::Unknown || other == Crc::Unknown {
            return false;
        }
        if accesses.stat() && !self.stat_eq(other) {
            return false;
        }
        if accesses.lnk() && self.lnk_view() != other.lnk_view() {
            return false;
        }
        if accesses.reg() && self.reg_view() != other.reg_view() {
            return false;
        }
        true
    }

    fn stat_eq(self, other: Crc) -> bool {
        self.kind() == other.kind()
    }

    /// Coarse object kind as seen by a stat-like access.
    fn kind(self) -> u8 {
        match self {
            Crc::Unknown => 0,
            Crc::None => 1,
            Crc::Empty | Crc::Reg(_) => 2,
            Crc::EmptyLnk | Crc::Lnk(_) => 3,
        }
    }

    /// Link-content projection: `None` when the object is not a link.
    fn lnk_view(self) -> Option<u64> {
        match self {
            Crc::Lnk(h) => Some(h),
            Crc::EmptyLnk => Some(0),
            _ => None,
        }
    }

    /// Regular-content projection: `None` when the object is not regular.
    fn reg_view(self) -> Option<u64> {
        match self {
            Crc::Reg(h) => Some(h),
            Crc::Empty => Some(0),
            _ => None,
        }
    }
}

/// Either a computed CRC or a file signature, discriminating how a dep value
/// was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepValue {
    Crc(Crc),
    Sig(FileSig),
}

impl Default for DepValue {
    fn default() -> Self {
        DepValue::Crc(Crc::Unknown)
    }
}

impl DepValue {
    pub fn is_crc(self) -> bool {
        matches!(self, DepValue::Crc(_))
    }

    pub fn crc(self) -> Option<Crc> {
        match self {
            DepValue::Crc(c) => Some(c),
            DepValue::Sig(_) => None,
        }
    }

    pub fn sig(self) -> Option<FileSig> {
        match self {
            DepValue::Crc(_) => None,
            DepValue::Sig(s) => Some(s),
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

fn hash_file(path: &Path) -> std::io::Result<u64> {
    let mut hasher = blake3::Hasher::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap()))
}
