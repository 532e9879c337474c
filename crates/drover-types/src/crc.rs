//! Content hashes, on-disk signatures and date types.
//!
//! A [`Crc`] records what a file's content looked like when it was last
//! observed; a [`FileSig`] records the cheap stat-level identity
//! (tag + inode + mtime + size) used to decide whether the expensive hash
//! must be recomputed.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::flags::Accesses;

/// What kind of filesystem object a path resolves to (without following
/// symlinks).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum FileTag {
    /// No entry at this path.
    #[default]
    None,
    /// Regular file.
    Reg,
    /// Regular file with the executable bit set.
    Exe,
    /// Symbolic link.
    Lnk,
    /// Directory.
    Dir,
}

impl FileTag {
    /// Whether this tag denotes something a job can legitimately produce.
    #[inline]
    #[must_use]
    pub fn is_target_like(self) -> bool {
        matches!(self, FileTag::Reg | FileTag::Exe | FileTag::Lnk)
    }
}

/// Cheap on-disk identity of a file: enough to detect that a path was
/// touched without hashing its content.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub struct FileSig {
    pub tag: FileTag,
    pub inode: u64,
    pub mtime: Ddate,
    pub size: u64,
}

impl FileSig {
    /// Stat `path` without following symlinks.
    ///
    /// An absent path yields the default signature (`tag == None`).
    #[must_use]
    pub fn of(path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt as _;
        use std::os::unix::fs::PermissionsExt as _;
        match fs::symlink_metadata(path) {
            Ok(md) => {
                let tag = if md.file_type().is_symlink() {
                    FileTag::Lnk
                } else if md.file_type().is_dir() {
                    FileTag::Dir
                } else if md.permissions().mode() & 0o111 != 0 {
                    FileTag::Exe
                } else {
                    FileTag::Reg
                };
                let mtime = Ddate::from_parts(md.mtime(), md.mtime_nsec());
                Self {
                    tag,
                    inode: md.ino(),
                    mtime,
                    size: md.size(),
                }
            }
            Err(_) => Self::default(),
        }
    }

    /// Whether the path existed when the signature was taken.
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.tag != FileTag::None
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Disk date: mtime of a file, nanoseconds since the epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Ddate(pub u64);

impl Ddate {
    #[must_use]
    pub fn from_parts(secs: i64, nsecs: i64) -> Self {
        let secs = u64::try_from(secs).unwrap_or(0);
        let nsecs = u64::try_from(nsecs).unwrap_or(0);
        Self(secs.saturating_mul(1_000_000_000).saturating_add(nsecs))
    }

    /// The zero date, meaning "never observed".
    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ddate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// Process date: a wall-clock instant used to order events within the
/// engine, nanoseconds since the epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Pdate(pub u64);

impl Pdate {
    /// The zero date, ordered before every real instant.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        Self(
            self.0
                .saturating_add(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
        )
    }

    /// Duration from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub fn since(self, earlier: Pdate) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Pdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

// ---------------------------------------------------------------------------
// Crc
// ---------------------------------------------------------------------------

/// Content hash of a node as last observed.
///
/// `None` means the path was known absent; `Unknown` means the content was
/// never reliably observed (it never matches, forcing a rerun); `Lnk` and
/// `Reg` carry an XXH3-128 digest of the link target or the regular file
/// body; `Val` carries an opaque value hash for code-encoded nodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum Crc {
    /// Known absent.
    None,
    /// Known present and empty.
    Empty,
    /// Never reliably observed.
    #[default]
    Unknown,
    /// Symlink, hash of the link target text.
    Lnk(u128),
    /// Regular file, hash of the content.
    Reg(u128),
    /// Opaque value hash (encode/decode nodes).
    Val(u128),
}

/// What a link-aware syscall sees at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LnkView {
    Absent,
    NotALink,
    Link(u128),
}

/// What a data-reading syscall sees at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegView {
    Absent,
    NotARegular,
    Data(u128),
}

impl Crc {
    /// Hash the on-disk content of `path` according to its tag.
    #[must_use]
    pub fn of_file(path: &Path) -> Self {
        use xxhash_rust::xxh3::xxh3_128;
        let sig = FileSig::of(path);
        match sig.tag {
            FileTag::None | FileTag::Dir => Crc::None,
            FileTag::Lnk => match fs::read_link(path) {
                Ok(tgt) => Crc::Lnk(xxh3_128(tgt.as_os_str().as_encoded_bytes())),
                Err(_) => Crc::Unknown,
            },
            FileTag::Reg | FileTag::Exe => {
                let mut f = match fs::File::open(path) {
                    Ok(f) => f,
                    Err(_) => return Crc::Unknown,
                };
                let mut buf = Vec::new();
                if f.read_to_end(&mut buf).is_err() {
                    return Crc::Unknown;
                }
                if buf.is_empty() {
                    Crc::Empty
                } else {
                    Crc::Reg(xxh3_128(&buf))
                }
            }
        }
    }

    /// Hash an in-memory byte string as regular-file content.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        use xxhash_rust::xxh3::xxh3_128;
        if bytes.is_empty() {
            Crc::Empty
        } else {
            Crc::Reg(xxh3_128(bytes))
        }
    }

    /// Whether this crc carries a usable content observation.
    #[inline]
    #[must_use]
    pub fn is_reliable(self) -> bool {
        self != Crc::Unknown
    }

    fn lnk_view(self) -> LnkView {
        match self {
            Crc::None => LnkView::Absent,
            Crc::Lnk(h) => LnkView::Link(h),
            _ => LnkView::NotALink,
        }
    }

    fn reg_view(self) -> RegView {
        match self {
            Crc::None => RegView::Absent,
            Crc::Empty => RegView::Data(0),
            Crc::Reg(h) | Crc::Val(h) => RegView::Data(h),
            Crc::Lnk(_) => RegView::NotARegular,
            Crc::Unknown => RegView::NotARegular,
        }
    }

    /// Whether `new` looks unchanged from `self` through the given accesses.
    ///
    /// A `Stat` access sees the inode, so any change at all invalidates. A
    /// `Lnk` access only sees link content; a `Reg` access only sees regular
    /// content. With no accesses at all, content is irrelevant and the dep
    /// always matches. `Unknown` on either side never matches a non-empty
    /// access set.
    #[must_use]
    pub fn matches(self, new: Crc, accesses: Accesses) -> bool {
        if accesses.is_empty() {
            return true;
        }
        if self == Crc::Unknown || new == Crc::Unknown {
            return false;
        }
        if accesses.contains(Accesses::STAT) && self != new {
            return false;
        }
        if accesses.contains(Accesses::LNK) && self.lnk_view() != new.lnk_view() {
            return false;
        }
        if accesses.contains(Accesses::REG) && self.reg_view() != new.reg_view() {
            return false;
        }
        true
    }
}

impl fmt::Display for Crc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crc::None => f.write_str("none"),
            Crc::Empty => f.write_str("empty"),
            Crc::Unknown => f.write_str("unknown"),
            Crc::Lnk(h) => write!(f, "L-{h:032x}"),
            Crc::Reg(h) => write!(f, "R-{h:032x}"),
            Crc::Val(h) => write!(f, "V-{h:032x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_never_matches() {
        let a = Accesses::REG;
        assert!(!Crc::Unknown.matches(Crc::Unknown, a));
        assert!(!Crc::Reg(1).matches(Crc::Unknown, a));
        assert!(!Crc::Unknown.matches(Crc::Reg(1), a));
    }

    #[test]
    fn test_no_access_always_matches() {
        assert!(Crc::Reg(1).matches(Crc::Reg(2), Accesses::empty()));
        assert!(Crc::Unknown.matches(Crc::None, Accesses::empty()));
    }

    #[test]
    fn test_stat_access_sees_everything() {
        let stat = Accesses::STAT;
        assert!(Crc::Reg(1).matches(Crc::Reg(1), stat));
        assert!(!Crc::Reg(1).matches(Crc::Reg(2), stat));
        assert!(!Crc::Reg(1).matches(Crc::Lnk(1), stat));
        assert!(!Crc::None.matches(Crc::Empty, stat));
    }

    #[test]
    fn test_lnk_access_ignores_regular_content() {
        let lnk = Accesses::LNK;
        // two different regular files look the same through readlink
        assert!(Crc::Reg(1).matches(Crc::Reg(2), lnk));
        assert!(Crc::Reg(1).matches(Crc::Empty, lnk));
        // but appearing/disappearing or becoming a link is visible
        assert!(!Crc::Reg(1).matches(Crc::None, lnk));
        assert!(!Crc::Reg(1).matches(Crc::Lnk(7), lnk));
        assert!(!Crc::Lnk(7).matches(Crc::Lnk(8), lnk));
        assert!(Crc::Lnk(7).matches(Crc::Lnk(7), lnk));
    }

    #[test]
    fn test_reg_access_ignores_link_retargeting_only() {
        let reg = Accesses::REG;
        assert!(Crc::Lnk(1).matches(Crc::Lnk(2), reg));
        assert!(!Crc::Lnk(1).matches(Crc::Reg(2), reg));
        assert!(!Crc::Reg(1).matches(Crc::Reg(2), reg));
        assert!(!Crc::Empty.matches(Crc::None, reg));
    }

    #[test]
    fn test_of_bytes_empty_is_empty() {
        assert_eq!(Crc::of_bytes(b""), Crc::Empty);
        assert!(matches!(Crc::of_bytes(b"x"), Crc::Reg(_)));
        assert_eq!(Crc::of_bytes(b"x"), Crc::of_bytes(b"x"));
        assert_ne!(Crc::of_bytes(b"x"), Crc::of_bytes(b"y"));
    }
}
