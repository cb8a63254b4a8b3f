//! On-disk index primitives for tern-db.
//!
//! This crate owns the file formats the rebuild pipeline consumes and
//! produces: compressed permutation block files and their block tables,
//! the permanent vocabulary, and the manifest that marks a published
//! index. The pipeline only needs "open for sequential sorted read"
//! ([`PermutationReader`]) and "open for sequential sorted append"
//! ([`BlockStorage`] / [`PermutationWriter`]).

pub mod block;
pub mod build;
pub mod error;
pub mod layout;
pub mod meta;
pub mod reader;
pub mod storage;
pub mod vocab;

pub use block::{decode_block, encode_block, Block, BlockMeta, EncodedBlock, DEFAULT_BLOCK_ROWS};
pub use build::{write_index, WriteOptions};
pub use error::{BinaryIndexError, Result};
pub use layout::IndexLayout;
pub use meta::{
    read_manifest, read_permutation_meta, IndexManifest, PermutationMeta, PermutationSummary,
    FORMAT_VERSION,
};
pub use reader::{read_permutation_rows, PermutationReader};
pub use storage::{BlockSink, BlockStorage, FileSink, FsStorage, PermutationWriter, DATA_MAGIC};
pub use vocab::Vocabulary;
