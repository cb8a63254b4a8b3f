//! Permutation block tables and the index manifest.

use crate::block::BlockMeta;
use crate::error::{BinaryIndexError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tern_db_core::{PermutationId, Quad};

/// Current manifest format version.
pub const FORMAT_VERSION: u32 = 1;

/// Block table of one permutation file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationMeta {
    pub permutation: PermutationId,
    pub target_block_rows: usize,
    pub total_rows: u64,
    pub blocks: Vec<BlockMeta>,
}

impl PermutationMeta {
    pub fn empty(permutation: PermutationId, target_block_rows: usize) -> Self {
        Self {
            permutation,
            target_block_rows,
            total_rows: 0,
            blocks: Vec::new(),
        }
    }

    /// Inclusive key range covered by the whole permutation.
    pub fn key_range(&self) -> Option<(Quad, Quad)> {
        match (self.blocks.first(), self.blocks.last()) {
            (Some(f), Some(l)) => Some((f.first, l.last)),
            _ => None,
        }
    }
}

/// Per-permutation entry of the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationSummary {
    pub permutation: PermutationId,
    pub blocks: usize,
    pub rows: u64,
    pub first: Option<Quad>,
    pub last: Option<Quad>,
}

impl From<&PermutationMeta> for PermutationSummary {
    fn from(meta: &PermutationMeta) -> Self {
        let range = meta.key_range();
        Self {
            permutation: meta.permutation,
            blocks: meta.blocks.len(),
            rows: meta.total_rows,
            first: range.map(|(f, _)| f),
            last: range.map(|(_, l)| l),
        }
    }
}

/// Top-level record of a published index. Its presence marks the index as complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub generation: u64,
    pub permutations: Vec<PermutationSummary>,
    pub vocabulary_size: u64,
    /// Rows in the regular SPO permutation.
    pub triple_count: u64,
    /// Rows in the internal PSO permutation.
    pub internal_triple_count: u64,
}

impl IndexManifest {
    pub fn summary(&self, id: PermutationId) -> Option<&PermutationSummary> {
        self.permutations.iter().find(|s| s.permutation == id)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| BinaryIndexError::Corrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn read_permutation_meta(path: &Path) -> Result<PermutationMeta> {
    read_json(path)
}

pub fn read_manifest(path: &Path) -> Result<IndexManifest> {
    let manifest: IndexManifest = read_json(path)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(BinaryIndexError::Corrupt {
            path: path.to_path_buf(),
            detail: format!("unsupported format version {}", manifest.format_version),
        });
    }
    Ok(manifest)
}
