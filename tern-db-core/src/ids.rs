//! Term identifiers.
//!
//! A `TermId` is a single `u64` whose two high bits carry a tag:
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `00` | Index into the permanent vocabulary |
//! | `01` | Index into an overlay-local vocabulary (not yet materialized) |
//! | `10` | Reserved special terms (e.g. the default graph) |
//!
//! Ordering is the raw `u64` ordering, so permanent ids sort before local
//! ids and local ids before specials. Rebuilds replace every local id by a
//! permanent one before anything is written to disk.

use serde::{Deserialize, Serialize};
use std::fmt;

const TAG_SHIFT: u32 = 62;
const TAG_MASK: u64 = 0b11 << TAG_SHIFT;
const INDEX_MASK: u64 = !TAG_MASK;

const TAG_VOCAB: u64 = 0b00 << TAG_SHIFT;
const TAG_LOCAL: u64 = 0b01 << TAG_SHIFT;
const TAG_SPECIAL: u64 = 0b10 << TAG_SHIFT;

/// Largest index representable in the 62-bit payload.
pub const MAX_TERM_INDEX: u64 = INDEX_MASK;

/// Tagged term identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermId(u64);

impl TermId {
    /// The graph of statements that were loaded without a named graph.
    pub const DEFAULT_GRAPH: TermId = TermId(TAG_SPECIAL);

    /// Id of word `index` in the permanent vocabulary.
    #[inline]
    pub const fn vocab(index: u64) -> Self {
        TermId(TAG_VOCAB | (index & INDEX_MASK))
    }

    /// Id of word `index` in an overlay-local vocabulary.
    #[inline]
    pub const fn local(index: u64) -> Self {
        TermId(TAG_LOCAL | (index & INDEX_MASK))
    }

    /// Reconstruct from the raw on-disk representation.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        TermId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Payload without the tag bits.
    #[inline]
    pub const fn index(self) -> u64 {
        self.0 & INDEX_MASK
    }

    #[inline]
    pub const fn is_vocab(self) -> bool {
        self.0 & TAG_MASK == TAG_VOCAB
    }

    #[inline]
    pub const fn is_local(self) -> bool {
        self.0 & TAG_MASK == TAG_LOCAL
    }

    #[inline]
    pub const fn is_special(self) -> bool {
        self.0 & TAG_MASK == TAG_SPECIAL
    }
}

impl fmt::Debug for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 & TAG_MASK {
            TAG_VOCAB => write!(f, "V{}", self.index()),
            TAG_LOCAL => write!(f, "L{}", self.index()),
            TAG_SPECIAL if *self == TermId::DEFAULT_GRAPH => write!(f, "DEFAULT_GRAPH"),
            _ => write!(f, "X{:#x}", self.0),
        }
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
