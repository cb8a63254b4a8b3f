//! Sequential append-side storage for permutation data files.
//!
//! [`BlockStorage`] is the seam between the rebuild pipeline and the file
//! system: the pipeline only ever asks for "a sink at this path" and then
//! appends compressed blocks in order. [`FsStorage`] is the production
//! implementation; tests wrap it to inject faults.

use crate::block::{BlockMeta, EncodedBlock};
use crate::error::{BinaryIndexError, Result};
use crate::meta::PermutationMeta;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tern_db_core::PermutationId;

/// Magic bytes at the start of every permutation data file.
pub const DATA_MAGIC: [u8; 8] = *b"TRNPRM01";

/// Sequential writer of compressed blocks.
pub trait BlockSink: Send {
    /// Append one block and return the file offset it was written at.
    fn append(&mut self, block: &EncodedBlock) -> io::Result<u64>;

    /// Flush and durably close the file.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Factory of [`BlockSink`]s.
pub trait BlockStorage: Send + Sync {
    fn create_sink(&self, path: &Path) -> io::Result<Box<dyn BlockSink>>;
}

/// Plain-file storage.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStorage;

impl BlockStorage for FsStorage {
    fn create_sink(&self, path: &Path) -> io::Result<Box<dyn BlockSink>> {
        Ok(Box::new(FileSink::create(path)?))
    }
}

pub struct FileSink {
    writer: BufWriter<File>,
    offset: u64,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&DATA_MAGIC)?;
        Ok(Self {
            writer,
            offset: DATA_MAGIC.len() as u64,
        })
    }
}

impl BlockSink for FileSink {
    fn append(&mut self, block: &EncodedBlock) -> io::Result<u64> {
        let at = self.offset;
        self.writer.write_all(&block.bytes)?;
        self.offset += block.bytes.len() as u64;
        Ok(at)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// Appends blocks to a sink while building the permutation's block table.
///
/// Rejects any block whose first row does not sort strictly after the
/// previous block's last row.
pub struct PermutationWriter {
    sink: Box<dyn BlockSink>,
    meta: PermutationMeta,
}

impl PermutationWriter {
    pub fn new(
        sink: Box<dyn BlockSink>,
        permutation: PermutationId,
        target_block_rows: usize,
    ) -> Self {
        Self {
            sink,
            meta: PermutationMeta::empty(permutation, target_block_rows),
        }
    }

    pub fn create(
        storage: &dyn BlockStorage,
        path: &Path,
        permutation: PermutationId,
        target_block_rows: usize,
    ) -> Result<Self> {
        let sink = storage.create_sink(path)?;
        Ok(Self::new(sink, permutation, target_block_rows))
    }

    pub fn permutation(&self) -> PermutationId {
        self.meta.permutation
    }

    pub fn blocks_written(&self) -> usize {
        self.meta.blocks.len()
    }

    pub fn append(&mut self, block: &EncodedBlock) -> Result<&BlockMeta> {
        let perm = self.meta.permutation.permutation;
        if perm.compare(&block.first, &block.last).is_gt() {
            return Err(BinaryIndexError::OutOfOrder {
                permutation: self.meta.permutation,
                detail: format!("block first {:?} > last {:?}", block.first, block.last),
            });
        }
        if let Some(prev) = self.meta.blocks.last() {
            if !perm.compare(&prev.last, &block.first).is_lt() {
                return Err(BinaryIndexError::OutOfOrder {
                    permutation: self.meta.permutation,
                    detail: format!(
                        "block {} starts at {:?}, previous block ends at {:?}",
                        self.meta.blocks.len(),
                        block.first,
                        prev.last
                    ),
                });
            }
        }
        let offset = self.sink.append(block)?;
        self.meta.total_rows += block.row_count as u64;
        self.meta.blocks.push(block.meta_at(offset));
        Ok(&self.meta.blocks[self.meta.blocks.len() - 1])
    }

    /// Close the data file and hand back the block table.
    pub fn finish(self) -> Result<PermutationMeta> {
        self.sink.finish()?;
        Ok(self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::encode_block;
    use tern_db_core::{Permutation, Quad, TermId};

    fn block(range: std::ops::Range<u64>) -> EncodedBlock {
        let rows: Vec<Quad> = range
            .map(|i| Quad::triple(TermId::vocab(i), TermId::vocab(0), TermId::vocab(0)))
            .collect();
        encode_block(&rows, 1).unwrap()
    }

    #[test]
    fn test_offsets_follow_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.index.spo");
        let id = PermutationId::regular(Permutation::Spo);
        let mut w = PermutationWriter::create(&FsStorage, &path, id, 4).unwrap();
        let b0 = block(0..4);
        let b1 = block(4..6);
        assert_eq!(w.append(&b0).unwrap().offset, DATA_MAGIC.len() as u64);
        assert_eq!(
            w.append(&b1).unwrap().offset,
            (DATA_MAGIC.len() + b0.bytes.len()) as u64
        );
        let meta = w.finish().unwrap();
        assert_eq!(meta.total_rows, 6);
        assert_eq!(meta.blocks.len(), 2);

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[..8], &DATA_MAGIC);
        assert_eq!(on_disk.len(), 8 + b0.bytes.len() + b1.bytes.len());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let id = PermutationId::regular(Permutation::Spo);
        let mut w =
            PermutationWriter::create(&FsStorage, &dir.path().join("y"), id, 4).unwrap();
        w.append(&block(4..8)).unwrap();
        let err = w.append(&block(2..5)).unwrap_err();
        assert!(matches!(err, BinaryIndexError::OutOfOrder { .. }));
        assert_eq!(w.blocks_written(), 1);
    }
}
