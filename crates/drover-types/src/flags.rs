//! Target and dep flags, and the access-kind bitmap.
//!
//! The sets are `bitflags` types; the companion enums exist for the fixed
//! wire characters (used when flags are persisted or printed — part of the
//! store format, never to change) and for per-kind bookkeeping where an
//! individual flag is addressed by value.

use std::fmt;

bitflags::bitflags! {
    /// Access kinds accumulated for one dep: what content its syscalls
    /// could observe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Accesses: u16 {
        /// Inode content (implied by the other accesses).
        const STAT = 1 << 0;
        /// Link content, if the dep is a symlink.
        const LNK = 1 << 1;
        /// Regular content, if the dep is a regular file.
        const REG = 1 << 2;
        /// Accesses that see actual data, not mere inode presence.
        const DATA = Self::LNK.bits() | Self::REG.bits();
    }
}

bitflags::bitflags! {
    /// Target flags as declared in a rule or applied by modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Tflags: u16 {
        const ESSENTIAL = 1 << 0;
        /// Reads before the first write are allowed.
        const INCREMENTAL = 1 << 1;
        const NO_UNIQUIFY = 1 << 2;
        const NO_WARNING = 1 << 3;
        /// The target counts as produced even when absent.
        const PHONY = 1 << 4;
        const STATIC = 1 << 5;
        const TARGET = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Target flags that never reach the store, only job execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtraTflags: u16 {
        const IGNORE = 1 << 0;
        const SOURCE_OK = 1 << 1;
        const ALLOW = 1 << 2;
        const TOP = 1 << 3;
        const OPTIONAL = 1 << 4;
        const WASH = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Dep flags as declared in a rule or applied by modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Dflags: u16 {
        /// When modified, analysis of following deps stops until rerun.
        const CRITICAL = 1 << 0;
        const ESSENTIAL = 1 << 1;
        const IGNORE_ERROR = 1 << 2;
        const REQUIRED = 1 << 3;
        const STATIC = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Dep flags that never reach the store, only job execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtraDflags: u16 {
        const IGNORE = 1 << 0;
        const STAT_READ_DATA = 1 << 1;
    }
}

/// Access kind of a single syscall.
///
/// Discriminants index per-kind bookkeeping arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Access {
    Stat = 0,
    Lnk = 1,
    Reg = 2,
}

/// A single target flag, for wire-char mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Tflag {
    Essential,
    Incremental,
    NoUniquify,
    NoWarning,
    Phony,
    Static,
    Target,
}

/// A single extra target flag, for wire-char mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ExtraTflag {
    Ignore,
    SourceOk,
    Allow,
    Top,
    Optional,
    Wash,
}

/// A single dep flag, for wire-char mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Dflag {
    Critical,
    Essential,
    IgnoreError,
    Required,
    Static,
}

/// A single extra dep flag, for wire-char mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ExtraDflag {
    Ignore,
    StatReadData,
}

macro_rules! flag_set_glue {
    (
        $flag:ident, $set:ident;
        $( $variant:ident => $cst:ident, $char:expr );+ $(;)?
    ) => {
        impl $flag {
            /// All flags, in declaration order.
            pub const ALL: &'static [$flag] = &[ $( $flag::$variant ),+ ];

            /// Wire character, or `None` for flags with no short form.
            #[must_use]
            pub const fn as_char(self) -> Option<char> {
                match self {
                    $( $flag::$variant => $char ),+
                }
            }

            /// Parse a wire character.
            #[must_use]
            pub fn from_char(c: char) -> Option<Self> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|f| f.as_char() == Some(c))
            }

            /// The set with only this flag.
            #[must_use]
            pub const fn mask(self) -> $set {
                match self {
                    $( $flag::$variant => $set::$cst ),+
                }
            }
        }

        impl From<$flag> for $set {
            fn from(flag: $flag) -> Self {
                flag.mask()
            }
        }

        impl Default for $set {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl fmt::Display for $set {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for flag in $flag::ALL {
                    if self.contains(flag.mask()) {
                        if let Some(c) = flag.as_char() {
                            write!(f, "{c}")?;
                        }
                    }
                }
                Ok(())
            }
        }

        // persisted as bare bits, like every other compact store field
        impl serde::Serialize for $set {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                serde::Serialize::serialize(&self.bits(), s)
            }
        }

        impl<'de> serde::Deserialize<'de> for $set {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                <u16 as serde::Deserialize>::deserialize(d).map(Self::from_bits_truncate)
            }
        }
    };
}

flag_set_glue! {
    Access, Accesses;
    Stat => STAT, Some('t');
    Lnk => LNK, Some('l');
    Reg => REG, Some('g');
}

flag_set_glue! {
    Tflag, Tflags;
    Essential => ESSENTIAL, Some('E');
    Incremental => INCREMENTAL, Some('i');
    NoUniquify => NO_UNIQUIFY, Some('u');
    NoWarning => NO_WARNING, Some('w');
    Phony => PHONY, Some('p');
    Static => STATIC, Some('S');
    Target => TARGET, Some('T');
}

flag_set_glue! {
    ExtraTflag, ExtraTflags;
    Ignore => IGNORE, Some('I');
    SourceOk => SOURCE_OK, Some('s');
    Allow => ALLOW, Some('a');
    Top => TOP, None;
    Optional => OPTIONAL, None;
    Wash => WASH, None;
}

flag_set_glue! {
    Dflag, Dflags;
    Critical => CRITICAL, Some('c');
    Essential => ESSENTIAL, Some('E');
    IgnoreError => IGNORE_ERROR, Some('e');
    Required => REQUIRED, Some('r');
    Static => STATIC, Some('S');
}

flag_set_glue! {
    ExtraDflag, ExtraDflags;
    Ignore => IGNORE, Some('I');
    StatReadData => STAT_READ_DATA, Some('d');
}

/// Whether a target with these flags is guaranteed to exist as a target even
/// when the job does not write it.
#[inline]
#[must_use]
pub fn static_phony(tflags: Tflags) -> bool {
    tflags.contains(Tflags::TARGET)
        && (tflags.contains(Tflags::STATIC) || tflags.contains(Tflags::PHONY))
}
