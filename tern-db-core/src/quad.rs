//! Statements in id space.

use crate::ids::TermId;
use serde::{Deserialize, Serialize};

/// Serialized width of a quad in block payloads (four little-endian `u64`).
pub const QUAD_BYTES: usize = 32;

/// One statement: subject, predicate, object and graph.
///
/// The derived `Ord` is the canonical SPO+G order; permutations use their
/// own comparators (see [`Permutation::compare`](crate::Permutation::compare)).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quad {
    pub s: TermId,
    pub p: TermId,
    pub o: TermId,
    pub g: TermId,
}

impl Quad {
    pub const fn new(s: TermId, p: TermId, o: TermId, g: TermId) -> Self {
        Self { s, p, o, g }
    }

    /// A statement in the default graph.
    pub const fn triple(s: TermId, p: TermId, o: TermId) -> Self {
        Self::new(s, p, o, TermId::DEFAULT_GRAPH)
    }

    /// True if any term still refers to an overlay-local vocabulary.
    pub fn has_local_terms(&self) -> bool {
        self.s.is_local() || self.p.is_local() || self.o.is_local() || self.g.is_local()
    }

    /// Apply `f` to every term.
    pub fn map_terms<E>(&self, mut f: impl FnMut(TermId) -> Result<TermId, E>) -> Result<Quad, E> {
        Ok(Quad {
            s: f(self.s)?,
            p: f(self.p)?,
            o: f(self.o)?,
            g: f(self.g)?,
        })
    }

    pub fn write_le(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.s.raw().to_le_bytes());
        buf[8..16].copy_from_slice(&self.p.raw().to_le_bytes());
        buf[16..24].copy_from_slice(&self.o.raw().to_le_bytes());
        buf[24..32].copy_from_slice(&self.g.raw().to_le_bytes());
    }

    pub fn read_le(buf: &[u8; QUAD_BYTES]) -> Self {
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            TermId::from_raw(u64::from_le_bytes(b))
        };
        Quad {
            s: word(0),
            p: word(1),
            o: word(2),
            g: word(3),
        }
    }
}

/// Which family of permutations a statement belongs to.
///
/// Internal statements (reified / auxiliary triples generated by the
/// store itself) live in their own permutation pair and are never mixed
/// into the regular permutations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripleScope {
    Regular,
    Internal,
}
