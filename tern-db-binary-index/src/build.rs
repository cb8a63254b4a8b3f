//! Building a complete index from an in-memory quad set.
//!
//! Used to create the first generation of an index; later generations
//! come from the rebuild pipeline. Every permutation is sorted,
//! deduplicated and cut into blocks of `target_block_rows`.

use crate::block::{encode_block, DEFAULT_BLOCK_ROWS};
use crate::error::{BinaryIndexError, Result};
use crate::layout::IndexLayout;
use crate::meta::{write_json, IndexManifest, PermutationSummary, FORMAT_VERSION};
use crate::storage::{FsStorage, PermutationWriter};
use crate::vocab::Vocabulary;
use std::path::Path;
use tern_db_core::{PermutationId, Quad, TermId, TripleScope};

#[derive(Clone, Debug)]
pub struct WriteOptions {
    pub target_block_rows: usize,
    pub zstd_level: i32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            target_block_rows: DEFAULT_BLOCK_ROWS,
            zstd_level: 1,
        }
    }
}

fn check_term(vocabulary: &Vocabulary, t: TermId) -> Result<()> {
    if t.is_special() || (t.is_vocab() && (t.index() as usize) < vocabulary.len()) {
        Ok(())
    } else {
        Err(BinaryIndexError::Decode(format!(
            "term {:?} is not in the permanent vocabulary ({} words)",
            t,
            vocabulary.len()
        )))
    }
}

/// Write every permutation, the vocabulary and the manifest for `base`.
pub fn write_index(
    base: &Path,
    vocabulary: &Vocabulary,
    quads: &[(Quad, TripleScope)],
    opts: &WriteOptions,
) -> Result<IndexManifest> {
    if opts.target_block_rows == 0 {
        return Err(BinaryIndexError::Decode("target_block_rows must be > 0".into()));
    }
    for (q, _) in quads {
        for t in [q.s, q.p, q.o, q.g] {
            check_term(vocabulary, t)?;
        }
    }

    let layout = IndexLayout::from_base(base);
    std::fs::create_dir_all(layout.dir())?;

    let mut permutations = Vec::new();
    for id in PermutationId::all() {
        let mut rows: Vec<Quad> = quads
            .iter()
            .filter(|(_, scope)| *scope == id.scope())
            .map(|(q, _)| *q)
            .collect();
        let perm = id.permutation;
        rows.sort_unstable_by(|a, b| perm.compare(a, b));
        rows.dedup();

        let mut writer = PermutationWriter::create(
            &FsStorage,
            &layout.data_path(id),
            id,
            opts.target_block_rows,
        )?;
        for chunk in rows.chunks(opts.target_block_rows) {
            writer.append(&encode_block(chunk, opts.zstd_level)?)?;
        }
        let meta = writer.finish()?;
        write_json(&layout.meta_path(id), &meta)?;
        tracing::debug!(
            permutation = %id,
            rows = meta.total_rows,
            blocks = meta.blocks.len(),
            "permutation written"
        );
        permutations.push(PermutationSummary::from(&meta));
    }

    vocabulary.save(&layout.vocabulary_path())?;

    let rows_of = |id: PermutationId| {
        permutations
            .iter()
            .find(|s: &&PermutationSummary| s.permutation == id)
            .map(|s| s.rows)
            .unwrap_or(0)
    };
    let manifest = IndexManifest {
        format_version: FORMAT_VERSION,
        generation: 0,
        triple_count: rows_of(PermutationId::regular(tern_db_core::Permutation::Spo)),
        internal_triple_count: rows_of(PermutationId::internal(tern_db_core::Permutation::Pso)),
        vocabulary_size: vocabulary.len() as u64,
        permutations,
    };
    write_json(&layout.manifest_path(), &manifest)?;
    tracing::info!(
        base = %layout.base().display(),
        triples = manifest.triple_count,
        vocabulary = manifest.vocabulary_size,
        "index written"
    );
    Ok(manifest)
}
