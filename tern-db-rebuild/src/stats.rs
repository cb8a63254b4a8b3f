//! Aggregate statistics for query-planning estimates.
//!
//! Collected by a read-only pass over the old permutations before any
//! task starts, then completed with the exact post-rebuild row counts
//! from the finalized block tables.
//!
//! Distinct counts come from permutations whose leading term is the one
//! being counted, so each is a single change-of-key pass:
//! subjects from SPO, predicates (and per-predicate counts) from PSO,
//! objects from OSP. Graphs are collected from SPO into a set.

use crate::error::{RebuildError, Result};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tern_db_binary_index::{IndexLayout, PermutationMeta, PermutationReader, Vocabulary};
use tern_db_core::{Permutation, PermutationId, TermId};

/// How many predicates are listed in [`IndexStatistics::top_predicates`].
pub const TOP_PREDICATES: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateCount {
    pub predicate: TermId,
    pub word: Option<String>,
    pub count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub triple_count: u64,
    pub internal_triple_count: u64,
    pub distinct_subjects: u64,
    pub distinct_predicates: u64,
    pub distinct_objects: u64,
    pub distinct_graphs: u64,
    pub top_predicates: Vec<PredicateCount>,
    /// Generation of the index the distinct counts were taken from.
    pub sampled_generation: u64,
}

impl IndexStatistics {
    /// Replace the row counts with the rebuilt permutations' exact totals.
    pub fn complete_with(&mut self, metas: &[PermutationMeta]) {
        for meta in metas {
            if meta.permutation == PermutationId::regular(Permutation::Spo) {
                self.triple_count = meta.total_rows;
            } else if meta.permutation == PermutationId::internal(Permutation::Pso) {
                self.internal_triple_count = meta.total_rows;
            }
        }
    }
}

/// Visit every row of `id` in order.
fn for_each_row(
    layout: &IndexLayout,
    id: PermutationId,
    mut f: impl FnMut(&tern_db_core::Quad),
) -> Result<u64> {
    let reader = PermutationReader::open(layout, id).map_err(RebuildError::scan(id, None))?;
    let mut rows = 0u64;
    for i in 0..reader.num_blocks() {
        let block = reader.read_block(i).map_err(RebuildError::scan(id, Some(i)))?;
        for q in &block.rows {
            f(q);
        }
        rows += block.rows.len() as u64;
    }
    Ok(rows)
}

/// Count key changes of `key` over the rows of `id`.
fn distinct_leading(
    layout: &IndexLayout,
    id: PermutationId,
    key: impl Fn(&tern_db_core::Quad) -> TermId,
) -> Result<(u64, u64)> {
    let mut prev: Option<TermId> = None;
    let mut distinct = 0u64;
    let rows = for_each_row(layout, id, |q| {
        let k = key(q);
        if prev != Some(k) {
            distinct += 1;
            prev = Some(k);
        }
    })?;
    Ok((distinct, rows))
}

pub fn collect_statistics(
    layout: &IndexLayout,
    vocabulary: &Vocabulary,
    generation: u64,
) -> Result<IndexStatistics> {
    let span = tracing::debug_span!("collect_statistics", generation);
    let _g = span.enter();

    let (distinct_subjects, triple_count) =
        distinct_leading(layout, PermutationId::regular(Permutation::Spo), |q| q.s)?;
    let (distinct_objects, _) =
        distinct_leading(layout, PermutationId::regular(Permutation::Osp), |q| q.o)?;

    let mut graphs = FxHashSet::default();
    for_each_row(layout, PermutationId::regular(Permutation::Spo), |q| {
        graphs.insert(q.g);
    })?;

    let mut per_predicate: Vec<(TermId, u64)> = Vec::new();
    for_each_row(layout, PermutationId::regular(Permutation::Pso), |q| {
        match per_predicate.last_mut() {
            Some((p, n)) if *p == q.p => *n += 1,
            _ => per_predicate.push((q.p, 1)),
        }
    })?;
    let distinct_predicates = per_predicate.len() as u64;
    per_predicate.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let top_predicates = per_predicate
        .into_iter()
        .take(TOP_PREDICATES)
        .map(|(predicate, count)| PredicateCount {
            predicate,
            word: vocabulary.word(predicate).map(str::to_string),
            count,
        })
        .collect();

    let internal_triple_count = for_each_row(
        layout,
        PermutationId::internal(Permutation::Pso),
        |_| {},
    )?;

    let stats = IndexStatistics {
        triple_count,
        internal_triple_count,
        distinct_subjects,
        distinct_predicates,
        distinct_objects,
        distinct_graphs: graphs.len() as u64,
        top_predicates,
        sampled_generation: generation,
    };
    tracing::debug!(
        triples = stats.triple_count,
        subjects = stats.distinct_subjects,
        predicates = stats.distinct_predicates,
        objects = stats.distinct_objects,
        "statistics collected"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_binary_index::{write_index, WriteOptions};
    use tern_db_core::{Quad, TripleScope};

    #[test]
    fn test_collect_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("kb");
        let vocab = Vocabulary::from_words((0..8).map(|i| format!("<w{i}>"))).unwrap();
        let v = TermId::vocab;
        let quads = vec![
            (Quad::triple(v(0), v(5), v(1)), TripleScope::Regular),
            (Quad::triple(v(0), v(5), v(2)), TripleScope::Regular),
            (Quad::triple(v(1), v(5), v(2)), TripleScope::Regular),
            (Quad::new(v(1), v(6), v(3), v(7)), TripleScope::Regular),
            (Quad::triple(v(2), v(6), v(3)), TripleScope::Internal),
        ];
        let opts = WriteOptions {
            target_block_rows: 2,
            zstd_level: 1,
        };
        write_index(&base, &vocab, &quads, &opts).unwrap();

        let stats = collect_statistics(&IndexLayout::from_base(&base), &vocab, 0).unwrap();
        assert_eq!(stats.triple_count, 4);
        assert_eq!(stats.internal_triple_count, 1);
        assert_eq!(stats.distinct_subjects, 2);
        assert_eq!(stats.distinct_predicates, 2);
        assert_eq!(stats.distinct_objects, 3);
        assert_eq!(stats.distinct_graphs, 2);
        assert_eq!(stats.top_predicates[0].predicate, v(5));
        assert_eq!(stats.top_predicates[0].count, 3);
        assert_eq!(stats.top_predicates[0].word.as_deref(), Some("<w5>"));
    }
}
