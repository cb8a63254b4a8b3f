//! Permutations (sort orders) of the quad set
//!
//! The index keeps the same statements sorted six ways so that any
//! bound-term pattern can be answered by a range scan:
//!
//! | Permutation | Key order | Use Case |
//! |-------------|-----------|----------|
//! | PSO | p, s, o, g | Predicate-subject lookups |
//! | POS | p, o, s, g | Property value lookups |
//! | SPO | s, p, o, g | Subject lookups |
//! | SOP | s, o, p, g | Subject-object lookups |
//! | OSP | o, s, p, g | Reverse traversal |
//! | OPS | o, p, s, g | Reverse traversal by predicate |
//!
//! Permutations are rebuilt in pairs that share their leading term. The
//! internal PSO/POS pair holds statements generated by the store itself
//! and is stored in separate `.internal` files.
//!
//! ## Strict Total Ordering
//!
//! All comparators compare every term; graph always breaks the final tie.

use crate::quad::{Quad, TripleScope};
use crate::TermId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Sort order of one permutation file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permutation {
    Pso,
    Pos,
    Spo,
    Sop,
    Osp,
    Ops,
}

impl Permutation {
    pub fn all() -> &'static [Permutation] {
        &[
            Permutation::Pso,
            Permutation::Pos,
            Permutation::Spo,
            Permutation::Sop,
            Permutation::Osp,
            Permutation::Ops,
        ]
    }

    /// Comparator function for this permutation.
    pub fn comparator(&self) -> fn(&Quad, &Quad) -> Ordering {
        match self {
            Permutation::Pso => cmp_pso,
            Permutation::Pos => cmp_pos,
            Permutation::Spo => cmp_spo,
            Permutation::Sop => cmp_sop,
            Permutation::Osp => cmp_osp,
            Permutation::Ops => cmp_ops,
        }
    }

    #[inline]
    pub fn compare(&self, a: &Quad, b: &Quad) -> Ordering {
        self.comparator()(a, b)
    }

    /// Sort key tuple; lexicographic order on it equals [`compare`](Self::compare).
    #[inline]
    pub fn key(&self, q: &Quad) -> [TermId; 4] {
        match self {
            Permutation::Pso => [q.p, q.s, q.o, q.g],
            Permutation::Pos => [q.p, q.o, q.s, q.g],
            Permutation::Spo => [q.s, q.p, q.o, q.g],
            Permutation::Sop => [q.s, q.o, q.p, q.g],
            Permutation::Osp => [q.o, q.s, q.p, q.g],
            Permutation::Ops => [q.o, q.p, q.s, q.g],
        }
    }

    /// Short lowercase name used in file names.
    pub fn name(&self) -> &'static str {
        match self {
            Permutation::Pso => "pso",
            Permutation::Pos => "pos",
            Permutation::Spo => "spo",
            Permutation::Sop => "sop",
            Permutation::Osp => "osp",
            Permutation::Ops => "ops",
        }
    }
}

impl fmt::Display for Permutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Permutation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pso" => Ok(Permutation::Pso),
            "pos" => Ok(Permutation::Pos),
            "spo" => Ok(Permutation::Spo),
            "sop" => Ok(Permutation::Sop),
            "osp" => Ok(Permutation::Osp),
            "ops" => Ok(Permutation::Ops),
            _ => Err(format!("Unknown permutation: {}", s)),
        }
    }
}

// === Comparator implementations ===

macro_rules! cmp_fields {
    ($name:ident, $a:ident, $b:ident, [$($f:ident),+]) => {
        #[inline]
        pub fn $name($a: &Quad, $b: &Quad) -> Ordering {
            Ordering::Equal
                $(.then_with(|| $a.$f.cmp(&$b.$f)))+
        }
    };
}

cmp_fields!(cmp_pso, a, b, [p, s, o, g]);
cmp_fields!(cmp_pos, a, b, [p, o, s, g]);
cmp_fields!(cmp_spo, a, b, [s, p, o, g]);
cmp_fields!(cmp_sop, a, b, [s, o, p, g]);
cmp_fields!(cmp_osp, a, b, [o, s, p, g]);
cmp_fields!(cmp_ops, a, b, [o, p, s, g]);

/// One on-disk permutation: a sort order plus the regular/internal family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PermutationId {
    pub permutation: Permutation,
    pub internal: bool,
}

impl PermutationId {
    pub const fn regular(permutation: Permutation) -> Self {
        Self {
            permutation,
            internal: false,
        }
    }

    pub const fn internal(permutation: Permutation) -> Self {
        Self {
            permutation,
            internal: true,
        }
    }

    pub fn scope(&self) -> TripleScope {
        if self.internal {
            TripleScope::Internal
        } else {
            TripleScope::Regular
        }
    }

    /// File-name suffix, e.g. `pso` or `pso.internal`.
    pub fn file_suffix(&self) -> String {
        if self.internal {
            format!("{}.internal", self.permutation.name())
        } else {
            self.permutation.name().to_string()
        }
    }

    /// Every permutation the index stores, in pair order.
    pub fn all() -> Vec<PermutationId> {
        PermutationPair::all()
            .iter()
            .flat_map(|pair| pair.permutations())
            .collect()
    }
}

impl fmt::Display for PermutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_suffix())
    }
}

impl FromStr for PermutationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_suffix(".internal") {
            Some(base) => Ok(PermutationId::internal(base.parse()?)),
            None => Ok(PermutationId::regular(s.parse()?)),
        }
    }
}

/// Unit of rebuild work: two permutations sharing their leading term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationPair {
    PsoPos,
    SpoSop,
    OspOps,
    InternalPsoPos,
}

impl PermutationPair {
    pub fn all() -> &'static [PermutationPair] {
        &[
            PermutationPair::PsoPos,
            PermutationPair::SpoSop,
            PermutationPair::OspOps,
            PermutationPair::InternalPsoPos,
        ]
    }

    /// The two permutations of this pair, in processing order.
    pub fn permutations(&self) -> [PermutationId; 2] {
        use Permutation::*;
        match self {
            PermutationPair::PsoPos => [PermutationId::regular(Pso), PermutationId::regular(Pos)],
            PermutationPair::SpoSop => [PermutationId::regular(Spo), PermutationId::regular(Sop)],
            PermutationPair::OspOps => [PermutationId::regular(Osp), PermutationId::regular(Ops)],
            PermutationPair::InternalPsoPos => {
                [PermutationId::internal(Pso), PermutationId::internal(Pos)]
            }
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, PermutationPair::InternalPsoPos)
    }

    /// Edits of this scope are merged into the pair; all others are ignored.
    pub fn scope(&self) -> TripleScope {
        if self.is_internal() {
            TripleScope::Internal
        } else {
            TripleScope::Regular
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PermutationPair::PsoPos => "pso-pos",
            PermutationPair::SpoSop => "spo-sop",
            PermutationPair::OspOps => "osp-ops",
            PermutationPair::InternalPsoPos => "internal-pso-pos",
        }
    }
}

impl fmt::Display for PermutationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
