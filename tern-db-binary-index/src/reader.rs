//! Read side of a permutation: memory-mapped data file plus block table.
//!
//! The data file may be mapped concurrently by a live process serving
//! queries, so the reader never writes and never assumes exclusive access.

use crate::block::{content_hash, decode_block, Block, BlockMeta, EncodedBlock};
use crate::error::{BinaryIndexError, Result};
use crate::layout::IndexLayout;
use crate::meta::{read_permutation_meta, PermutationMeta};
use crate::storage::DATA_MAGIC;
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;
use tern_db_core::{PermutationId, Quad};

pub struct PermutationReader {
    path: PathBuf,
    mmap: Mmap,
    meta: PermutationMeta,
}

impl PermutationReader {
    pub fn open(layout: &IndexLayout, id: PermutationId) -> Result<Self> {
        let meta = read_permutation_meta(&layout.meta_path(id))?;
        let path = layout.data_path(id);
        if meta.permutation != id {
            return Err(BinaryIndexError::Corrupt {
                path,
                detail: format!("block table describes {}, expected {}", meta.permutation, id),
            });
        }
        let file = File::open(&path)?;
        // SAFETY: the file is only read; writers never modify a published data file.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < DATA_MAGIC.len() || mmap[..DATA_MAGIC.len()] != DATA_MAGIC {
            return Err(BinaryIndexError::Corrupt {
                path,
                detail: "bad magic".into(),
            });
        }
        Ok(Self { path, mmap, meta })
    }

    pub fn id(&self) -> PermutationId {
        self.meta.permutation
    }

    pub fn meta(&self) -> &PermutationMeta {
        &self.meta
    }

    pub fn num_blocks(&self) -> usize {
        self.meta.blocks.len()
    }

    pub fn block_meta(&self, index: usize) -> Result<&BlockMeta> {
        self.meta
            .blocks
            .get(index)
            .ok_or(BinaryIndexError::BlockOutOfRange {
                permutation: self.meta.permutation,
                index,
                len: self.meta.blocks.len(),
            })
    }

    fn block_bytes(&self, index: usize) -> Result<(&BlockMeta, &[u8])> {
        let bm = self.block_meta(index)?;
        let start = bm.offset as usize;
        let end = start.saturating_add(bm.compressed_len as usize);
        if start < DATA_MAGIC.len() || end > self.mmap.len() {
            return Err(BinaryIndexError::Corrupt {
                path: self.path.clone(),
                detail: format!(
                    "block {} spans {}..{} beyond file length {}",
                    index,
                    start,
                    end,
                    self.mmap.len()
                ),
            });
        }
        let bytes = &self.mmap[start..end];
        if content_hash(bytes) != bm.content_hash {
            return Err(BinaryIndexError::Corrupt {
                path: self.path.clone(),
                detail: format!("block {} content hash mismatch", index),
            });
        }
        Ok((bm, bytes))
    }

    /// Read, verify and decode block `index`.
    pub fn read_block(&self, index: usize) -> Result<Block> {
        let (bm, bytes) = self.block_bytes(index)?;
        let rows = decode_block(bytes, bm.row_count)?;
        Ok(Block { index, rows })
    }

    /// Read and verify block `index` without decompressing it.
    pub fn read_encoded(&self, index: usize) -> Result<EncodedBlock> {
        let (bm, bytes) = self.block_bytes(index)?;
        Ok(EncodedBlock {
            bytes: bytes.to_vec(),
            row_count: bm.row_count,
            first: bm.first,
            last: bm.last,
            content_hash: bm.content_hash.clone(),
        })
    }
}

/// Decode every row of a permutation in order.
pub fn read_permutation_rows(layout: &IndexLayout, id: PermutationId) -> Result<Vec<Quad>> {
    let reader = PermutationReader::open(layout, id)?;
    let mut rows = Vec::with_capacity(reader.meta().total_rows as usize);
    for i in 0..reader.num_blocks() {
        rows.extend(reader.read_block(i)?.rows);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::encode_block;
    use crate::meta::write_json;
    use crate::storage::{FsStorage, PermutationWriter};
    use tern_db_core::{Permutation, TermId};

    fn write_fixture(layout: &IndexLayout, id: PermutationId) -> Vec<Quad> {
        let rows: Vec<Quad> = (0..10)
            .map(|i| Quad::triple(TermId::vocab(i), TermId::vocab(1), TermId::vocab(2)))
            .collect();
        let mut w = PermutationWriter::create(&FsStorage, &layout.data_path(id), id, 4).unwrap();
        for chunk in rows.chunks(4) {
            w.append(&encode_block(chunk, 1).unwrap()).unwrap();
        }
        let meta = w.finish().unwrap();
        write_json(&layout.meta_path(id), &meta).unwrap();
        rows
    }

    #[test]
    fn test_read_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::from_base(dir.path().join("kb"));
        let id = PermutationId::regular(Permutation::Spo);
        let rows = write_fixture(&layout, id);

        let reader = PermutationReader::open(&layout, id).unwrap();
        assert_eq!(reader.num_blocks(), 3);
        assert_eq!(reader.read_block(2).unwrap().rows, rows[8..].to_vec());
        assert_eq!(read_permutation_rows(&layout, id).unwrap(), rows);
        assert!(matches!(
            reader.read_block(3),
            Err(BinaryIndexError::BlockOutOfRange { .. })
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::from_base(dir.path().join("kb"));
        let id = PermutationId::regular(Permutation::Spo);
        write_fixture(&layout, id);

        let path = layout.data_path(id);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let reader = PermutationReader::open(&layout, id).unwrap();
        assert!(reader.read_block(0).is_ok());
        assert!(matches!(
            reader.read_block(2),
            Err(BinaryIndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_wrong_permutation_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::from_base(dir.path().join("kb"));
        let spo = PermutationId::regular(Permutation::Spo);
        let sop = PermutationId::regular(Permutation::Sop);
        write_fixture(&layout, spo);
        std::fs::copy(layout.meta_path(spo), layout.meta_path(sop)).unwrap();
        std::fs::copy(layout.data_path(spo), layout.data_path(sop)).unwrap();
        assert!(PermutationReader::open(&layout, sop).is_err());
    }
}
