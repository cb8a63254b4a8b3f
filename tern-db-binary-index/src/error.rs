//! Error types for binary index operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tern_db_core::PermutationId;

#[derive(Error, Debug)]
pub enum BinaryIndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("corrupt file {path:?}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("block {index} out of range for {permutation} ({len} blocks)")]
    BlockOutOfRange {
        permutation: PermutationId,
        index: usize,
        len: usize,
    },

    #[error("out-of-order append to {permutation}: {detail}")]
    OutOfOrder {
        permutation: PermutationId,
        detail: String,
    },

    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BinaryIndexError>;
