//! Local-to-permanent vocabulary remapping and per-permutation edit lists.
//!
//! Both are built once, before any task starts, and shared read-only.

use crate::error::{RebuildError, Result};
use rustc_hash::FxHashMap;
use tern_db_binary_index::Vocabulary;
use tern_db_core::{PermutationId, Quad, TermId};
use tern_db_delta::{DeltaSnapshot, EditOp};

/// Maps `TermId::local(i)` to its permanent id.
#[derive(Clone, Debug, Default)]
pub struct VocabRemapTable {
    permanent: Vec<TermId>,
    added: usize,
}

impl VocabRemapTable {
    pub fn len(&self) -> usize {
        self.permanent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permanent.is_empty()
    }

    /// Words that were new to the permanent vocabulary.
    pub fn added(&self) -> usize {
        self.added
    }

    /// Permanent id of every local word, in local order.
    pub fn permanent_ids(&self) -> &[TermId] {
        &self.permanent
    }

    pub fn remap(&self, id: TermId) -> Result<TermId> {
        if !id.is_local() {
            return Ok(id);
        }
        self.permanent
            .get(id.index() as usize)
            .copied()
            .ok_or_else(|| {
                RebuildError::VocabRemap(format!(
                    "local id {:?} has no word ({} local words)",
                    id,
                    self.permanent.len()
                ))
            })
    }

    pub fn remap_quad(&self, quad: &Quad) -> Result<Quad> {
        quad.map_terms(|t| self.remap(t))
    }
}

/// Append the local words to `vocabulary` and build the remap table.
///
/// Words already present keep their permanent id; unseen words are
/// appended in local order. Existing ids never move.
pub fn remap_vocabulary(vocabulary: &mut Vocabulary, local_words: &[String]) -> VocabRemapTable {
    let mut permanent = Vec::with_capacity(local_words.len());
    let mut added = 0;
    for word in local_words {
        let (id, new) = vocabulary.get_or_insert(word);
        if new {
            added += 1;
        }
        permanent.push(id);
    }
    VocabRemapTable { permanent, added }
}

/// One edit in permanent-id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortedEdit {
    pub quad: Quad,
    pub op: EditOp,
}

/// Remapped edits, sorted once per permutation.
#[derive(Debug, Default)]
pub struct PreparedEdits {
    by_permutation: FxHashMap<PermutationId, Vec<SortedEdit>>,
}

impl PreparedEdits {
    /// Edits that apply to `id`, in `id`'s sort order. Empty if none.
    pub fn for_permutation(&self, id: PermutationId) -> &[SortedEdit] {
        self.by_permutation
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn total(&self, id: PermutationId) -> usize {
        self.for_permutation(id).len()
    }
}

/// Remap every snapshot edit and sort the result for each permutation.
///
/// Two edits can collapse onto the same quad when a local word turns out
/// to be a known permanent word. If they disagree, the insert is kept.
pub fn prepare_edits(snapshot: &DeltaSnapshot, table: &VocabRemapTable) -> Result<PreparedEdits> {
    let mut by_scope: FxHashMap<_, FxHashMap<Quad, EditOp>> = FxHashMap::default();
    for edit in &snapshot.edits {
        let quad = table.remap_quad(&edit.quad)?;
        by_scope
            .entry(edit.scope)
            .or_default()
            .entry(quad)
            .and_modify(|op| {
                if edit.op == EditOp::Insert {
                    *op = EditOp::Insert;
                }
            })
            .or_insert(edit.op);
    }

    let mut by_permutation = FxHashMap::default();
    for id in PermutationId::all() {
        let Some(edits) = by_scope.get(&id.scope()) else {
            continue;
        };
        let mut sorted: Vec<SortedEdit> = edits
            .iter()
            .map(|(&quad, &op)| SortedEdit { quad, op })
            .collect();
        let perm = id.permutation;
        sorted.sort_unstable_by(|a, b| perm.compare(&a.quad, &b.quad));
        by_permutation.insert(id, sorted);
    }
    Ok(PreparedEdits { by_permutation })
}
