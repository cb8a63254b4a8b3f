//! Block codec.
//!
//! A block is a sorted run of quads, serialized as consecutive 32-byte
//! little-endian rows and compressed as one zstd frame. The SHA-256 of the
//! compressed bytes is recorded in the permutation metadata and verified
//! on every read, so a torn or overwritten file fails loudly.

use crate::error::{BinaryIndexError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tern_db_core::quad::QUAD_BYTES;
use tern_db_core::Quad;

/// Rows per block when a permutation has no existing blocks to copy the size from.
pub const DEFAULT_BLOCK_ROWS: usize = 16_384;

/// Location and summary of one block inside a permutation data file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub offset: u64,
    pub compressed_len: u64,
    pub row_count: u32,
    pub first: Quad,
    pub last: Quad,
    pub content_hash: String,
}

/// A compressed block ready to append, or read back still compressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedBlock {
    pub bytes: Vec<u8>,
    pub row_count: u32,
    pub first: Quad,
    pub last: Quad,
    pub content_hash: String,
}

impl EncodedBlock {
    pub fn meta_at(&self, offset: u64) -> BlockMeta {
        BlockMeta {
            offset,
            compressed_len: self.bytes.len() as u64,
            row_count: self.row_count,
            first: self.first,
            last: self.last,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// A decoded block: its position in the permutation plus its rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub rows: Vec<Quad>,
}

impl Block {
    pub fn first(&self) -> Option<&Quad> {
        self.rows.first()
    }

    pub fn last(&self) -> Option<&Quad> {
        self.rows.last()
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize and compress a non-empty, already sorted run of rows.
pub fn encode_block(rows: &[Quad], zstd_level: i32) -> Result<EncodedBlock> {
    let (first, last) = match (rows.first(), rows.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return Err(BinaryIndexError::Decode("cannot encode an empty block".into())),
    };
    let row_count = u32::try_from(rows.len())
        .map_err(|_| BinaryIndexError::Decode(format!("block too large: {} rows", rows.len())))?;

    let mut raw = vec![0u8; rows.len() * QUAD_BYTES];
    for (row, chunk) in rows.iter().zip(raw.chunks_exact_mut(QUAD_BYTES)) {
        row.write_le(chunk);
    }
    let bytes = zstd::bulk::compress(&raw, zstd_level)?;
    let content_hash = content_hash(&bytes);

    Ok(EncodedBlock {
        bytes,
        row_count,
        first,
        last,
        content_hash,
    })
}

/// Decompress and deserialize a block whose metadata says it holds `row_count` rows.
pub fn decode_block(bytes: &[u8], row_count: u32) -> Result<Vec<Quad>> {
    let expected = row_count as usize * QUAD_BYTES;
    let raw = zstd::bulk::decompress(bytes, expected)?;
    if raw.len() != expected {
        return Err(BinaryIndexError::Decode(format!(
            "block decompressed to {} bytes, expected {}",
            raw.len(),
            expected
        )));
    }
    let rows = raw
        .chunks_exact(QUAD_BYTES)
        .map(|chunk| {
            let mut buf = [0u8; QUAD_BYTES];
            buf.copy_from_slice(chunk);
            Quad::read_le(&buf)
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_core::TermId;

    fn rows(n: u64) -> Vec<Quad> {
        (0..n)
            .map(|i| Quad::triple(TermId::vocab(i), TermId::vocab(1), TermId::vocab(i * 2)))
            .collect()
    }

    #[test]
    fn test_encode_decode() {
        let input = rows(100);
        let enc = encode_block(&input, 1).unwrap();
        assert_eq!(enc.row_count, 100);
        assert_eq!(enc.first, input[0]);
        assert_eq!(enc.last, input[99]);
        assert_eq!(enc.content_hash, content_hash(&enc.bytes));
        assert_eq!(decode_block(&enc.bytes, enc.row_count).unwrap(), input);
    }

    #[test]
    fn test_empty_block_rejected() {
        assert!(encode_block(&[], 1).is_err());
    }

    #[test]
    fn test_wrong_row_count_rejected() {
        let enc = encode_block(&rows(10), 1).unwrap();
        assert!(decode_block(&enc.bytes, 11).is_err());
    }

    #[test]
    fn test_meta_at() {
        let enc = encode_block(&rows(3), 1).unwrap();
        let meta = enc.meta_at(8);
        assert_eq!(meta.offset, 8);
        assert_eq!(meta.compressed_len, enc.bytes.len() as u64);
        assert_eq!(meta.row_count, 3);
    }
}
