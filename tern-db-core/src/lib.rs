//! # Tern DB Core
//!
//! Shared vocabulary types for the tern-db quad store.
//!
//! This crate provides:
//! - `TermId`: tagged 64-bit term identifiers (permanent vocabulary, overlay-local, reserved)
//! - `Quad`: one `(s, p, o, g)` statement in id space
//! - `Permutation` / `PermutationId` / `PermutationPair`: the redundant sort orders
//!   the index keeps on disk, and their comparators
//!
//! ## Design Principles
//!
//! 1. **No I/O**: file formats live in `tern-db-binary-index`
//! 2. **Strict total ordering**: every permutation compares all four terms
//! 3. **Plain data**: everything here is `Copy` and `serde`-serializable

pub mod ids;
pub mod permutation;
pub mod quad;

pub use ids::TermId;
pub use permutation::{Permutation, PermutationId, PermutationPair};
pub use quad::{Quad, TripleScope};
