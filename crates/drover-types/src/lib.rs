pub mod crc;
pub mod flags;
pub mod status;

pub use crc::{Crc, Ddate, FileSig, FileTag, Pdate};
pub use flags::{
    Access, Accesses, Dflag, Dflags, ExtraDflag, ExtraDflags, ExtraTflag, ExtraTflags, Tflag,
    Tflags, static_phony,
};
pub use status::{Buildable, DepState, JobReason, JobReasonTag, Manual, RunStatus, Status};

use std::fmt;
use std::num::NonZeroU32;

/// Number of high bits reserved as guard bits in slot words.
///
/// A slot word either holds nothing, inlines a single small value, or points
/// into a vector file; the tag lives in the top bits so indexes are limited
/// to [`MAX_IDX`].
pub const GUARD_BITS: u32 = 2;

/// Largest raw index representable once guard bits are reserved.
pub const MAX_IDX: u32 = (1 << (32 - GUARD_BITS)) - 1;

macro_rules! define_idx {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Create from a raw index.
            ///
            /// Returns `None` for 0 (the null index) and for values that
            /// collide with the guard bits.
            #[inline]
            #[must_use]
            pub const fn new(raw: u32) -> Option<Self> {
                if raw > MAX_IDX {
                    return None;
                }
                match NonZeroU32::new(raw) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Raw index value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0.get()
            }

            /// Zero-based slot position in a record table.
            #[inline]
            #[must_use]
            pub const fn slot(self) -> usize {
                (self.0.get() - 1) as usize
            }

            /// Index for a zero-based slot position.
            #[inline]
            #[must_use]
            pub fn from_slot(slot: usize) -> Option<Self> {
                u32::try_from(slot + 1).ok().and_then(Self::new)
            }

            /// Entity kind, for diagnostics.
            #[must_use]
            pub const fn kind() -> &'static str {
                $kind
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $kind, self.0)
            }
        }
    };
}

define_idx!(
    /// Index of a job record in the job table.
    JobIdx,
    "J"
);
define_idx!(
    /// Index of a node record in the node table.
    NodeIdx,
    "N"
);
define_idx!(
    /// Index of a compiled rule in the rule table.
    RuleIdx,
    "R"
);
define_idx!(
    /// Index of an interned name in the shared name trie.
    NameId,
    "nm"
);
define_idx!(
    /// Index of an allocated block in a vector file.
    VecIdx,
    "v"
);
define_idx!(
    /// Index of a rule-target entry in the suffix index.
    RuleTgtIdx,
    "rt"
);

/// Small dense identifier of an open request.
///
/// Requests are few and short-lived; ids are recycled by [`SmallIds`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ReqIdx(pub u8);

impl fmt::Display for ReqIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req{}", self.0)
    }
}

/// Allocator of small dense ids, recycling freed ones lowest-first.
#[derive(Debug, Default)]
pub struct SmallIds {
    in_use: Vec<bool>,
}

impl SmallIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the lowest free id.
    pub fn acquire(&mut self) -> ReqIdx {
        for (i, used) in self.in_use.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return ReqIdx(u8::try_from(i).unwrap_or(u8::MAX));
            }
        }
        self.in_use.push(true);
        ReqIdx(u8::try_from(self.in_use.len() - 1).unwrap_or(u8::MAX))
    }

    /// Return an id to the pool.
    pub fn release(&mut self, id: ReqIdx) {
        if let Some(slot) = self.in_use.get_mut(id.0 as usize) {
            *slot = false;
        }
    }

    /// Number of ids currently live.
    #[must_use]
    pub fn n_live(&self) -> usize {
        self.in_use.iter().filter(|u| **u).count()
    }
}

// ---------------------------------------------------------------------------
// Crunch slots
// ---------------------------------------------------------------------------

const TAG_SHIFT: u32 = 32 - GUARD_BITS;
const TAG_EMPTY: u32 = 0;
const TAG_ONE: u32 = 1;
const TAG_VEC: u32 = 2;

/// A decoded slot word: nothing, one inline element, or an indirect vector.
///
/// This is the "crunch" optimization: the common 0- or 1-element dep/target
/// set costs no vector-file allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crunch {
    Empty,
    One(u32),
    Vec(VecIdx),
}

impl Crunch {
    /// Decode a raw slot word.
    #[must_use]
    pub fn decode(word: u32) -> Self {
        let payload = word & MAX_IDX;
        match word >> TAG_SHIFT {
            TAG_ONE => Crunch::One(payload),
            TAG_VEC => match VecIdx::new(payload) {
                Some(idx) => Crunch::Vec(idx),
                None => Crunch::Empty,
            },
            _ => Crunch::Empty,
        }
    }

    /// Encode back to a raw slot word.
    ///
    /// Inline values above [`MAX_IDX`] cannot be represented; callers must
    /// spill them to a vector first.
    #[must_use]
    pub fn encode(self) -> u32 {
        match self {
            Crunch::Empty => TAG_EMPTY << TAG_SHIFT,
            Crunch::One(v) => {
                debug_assert!(v <= MAX_IDX, "inline crunch value exceeds guard budget");
                (TAG_ONE << TAG_SHIFT) | (v & MAX_IDX)
            }
            Crunch::Vec(idx) => (TAG_VEC << TAG_SHIFT) | idx.get(),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        matches!(self, Crunch::Empty)
    }
}
