//! Shared test harness for tern-db-rebuild integration tests.
//!
//! Builds small on-disk indexes, overlays with known edits, and the
//! expected post-rebuild rows to compare against.

// Each integration test crate uses a different subset of these helpers.
#![allow(dead_code)]

pub mod span_capture;

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_db_binary_index::{
    read_permutation_rows, write_index, BlockSink, BlockStorage, EncodedBlock, FileSink,
    IndexLayout, Vocabulary, WriteOptions,
};
use tern_db_core::{PermutationId, Quad, TermId, TripleScope};
use tern_db_delta::{DeltaEdit, DeltaTriples, DeltaTriplesManager, EditOp};
use tern_db_rebuild::RebuildConfig;

// =============================================================================
// Fixture data
// =============================================================================

/// Permanent words in every fixture vocabulary.
pub const VOCAB_WORDS: u64 = 256;

pub fn v(i: u64) -> TermId {
    TermId::vocab(i)
}

/// The `i`-th regular fixture triple. Distinct for `i < 1850`.
pub fn regular_quad(i: u64) -> Quad {
    Quad::triple(v(i % 50), v(200 + i % 5), v(100 + i % 37))
}

/// The `i`-th internal fixture triple. Distinct for `i < 1740`.
pub fn internal_quad(i: u64) -> Quad {
    Quad::triple(v(60 + i % 20), v(210 + i % 3), v(120 + i % 29))
}

/// Write an index with `regular` and `internal` fixture rows at `dir/kb`.
pub fn build_fixture(dir: &Path, regular: u64, internal: u64, block_rows: usize) -> PathBuf {
    let base = dir.join("kb");
    let vocab = Vocabulary::from_words((0..VOCAB_WORDS).map(|i| format!("<w{i}>")))
        .expect("fixture vocabulary");
    let mut quads: Vec<(Quad, TripleScope)> = (0..regular)
        .map(|i| (regular_quad(i), TripleScope::Regular))
        .collect();
    quads.extend((0..internal).map(|i| (internal_quad(i), TripleScope::Internal)));
    let opts = WriteOptions {
        target_block_rows: block_rows,
        zstd_level: 1,
    };
    write_index(&base, &vocab, &quads, &opts).expect("write fixture index");
    base
}

/// An overlay holding `edits` as one batch.
pub fn overlay_with(edits: Vec<DeltaEdit>) -> Arc<DeltaTriplesManager> {
    let mut delta = DeltaTriples::new();
    delta.apply(edits);
    Arc::new(DeltaTriplesManager::from_delta(delta))
}

/// A mixed batch touching every permutation pair: deletes of existing rows,
/// inserts of new rows (some past the end of the old key range).
pub fn mixed_edits(regular: u64, internal: u64) -> Vec<DeltaEdit> {
    let mut edits = Vec::new();
    for i in (0..regular).step_by(7) {
        edits.push(DeltaEdit::delete(regular_quad(i), TripleScope::Regular));
    }
    for i in 0..12 {
        edits.push(DeltaEdit::insert(
            Quad::triple(v(150 + i), v(200 + i % 5), v(10 + i)),
            TripleScope::Regular,
        ));
    }
    for i in (0..internal).step_by(5) {
        edits.push(DeltaEdit::delete(internal_quad(i), TripleScope::Internal));
    }
    for i in 0..6 {
        edits.push(DeltaEdit::insert(
            Quad::triple(v(90 + i), v(211), v(240 + i)),
            TripleScope::Internal,
        ));
    }
    edits
}

/// Rows `id` should hold after applying `edits` to the index at `base`.
pub fn expected_rows(base: &Path, id: PermutationId, edits: &[DeltaEdit]) -> Vec<Quad> {
    let layout = IndexLayout::current(base).expect("resolve live generation");
    let mut rows: BTreeSet<Quad> = read_permutation_rows(&layout, id)
        .expect("read old permutation")
        .into_iter()
        .collect();
    for edit in edits.iter().filter(|e| e.scope == id.scope()) {
        match edit.op {
            EditOp::Insert => rows.insert(edit.quad),
            EditOp::Delete => rows.remove(&edit.quad),
        };
    }
    let mut rows: Vec<Quad> = rows.into_iter().collect();
    rows.sort_by(|a, b| id.permutation.compare(a, b));
    rows
}

// =============================================================================
// Config and file helpers
// =============================================================================

/// Short waits so a stalled test fails quickly instead of hanging CI.
pub fn test_config() -> RebuildConfig {
    RebuildConfig::default()
        .with_watchdog(Duration::from_secs(30))
        .with_stall_timeout(Duration::from_secs(10))
}

/// Contents of every file in `dir`, keyed by path.
pub fn dir_contents(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    std::fs::read_dir(dir)
        .expect("read fixture dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .map(|p| {
            let bytes = std::fs::read(&p).expect("read fixture file");
            (p, bytes)
        })
        .collect()
}

/// Files named after `base` that its published manifest does not reference:
/// unpublished generations, retired generations and staged manifests.
pub fn unpublished_files(base: &Path) -> Vec<PathBuf> {
    let layout = IndexLayout::current(base).expect("resolve live generation");
    let live = layout.all_files();
    let prefix = format!("{}.", layout.name());
    dir_contents(layout.dir())
        .into_keys()
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().starts_with(&prefix)))
        .filter(|p| !live.contains(p))
        .collect()
}

// =============================================================================
// Fault injection
// =============================================================================

/// Filesystem storage that fails the append of one chosen block.
///
/// The failing block is the one whose last row is `fail_at`, written to a
/// data file whose name ends in `file_suffix`.
#[derive(Clone)]
pub struct FaultyStorage {
    file_suffix: String,
    fail_at: Quad,
    pub faults: Arc<AtomicUsize>,
}

impl FaultyStorage {
    pub fn new(file_suffix: impl Into<String>, fail_at: Quad) -> Self {
        Self {
            file_suffix: file_suffix.into(),
            fail_at,
            faults: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BlockStorage for FaultyStorage {
    fn create_sink(&self, path: &Path) -> io::Result<Box<dyn BlockSink>> {
        let inner = FileSink::create(path)?;
        let armed = path.to_string_lossy().ends_with(&self.file_suffix);
        Ok(Box::new(FaultySink {
            inner,
            fail_at: armed.then_some(self.fail_at),
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultySink {
    inner: FileSink,
    fail_at: Option<Quad>,
    faults: Arc<AtomicUsize>,
}

impl BlockSink for FaultySink {
    fn append(&mut self, block: &EncodedBlock) -> io::Result<u64> {
        if self.fail_at == Some(block.last) {
            self.faults.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.inner.append(block)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        Box::new(self.inner).finish()
    }
}

/// Filesystem storage that applies one overlay batch when the first data
/// file is created, after the rebuild has taken its snapshot.
pub struct ConcurrentEditStorage {
    overlay: Arc<DeltaTriplesManager>,
    batch: Mutex<Option<Vec<DeltaEdit>>>,
}

impl ConcurrentEditStorage {
    pub fn new(overlay: Arc<DeltaTriplesManager>, batch: Vec<DeltaEdit>) -> Self {
        Self {
            overlay,
            batch: Mutex::new(Some(batch)),
        }
    }
}

impl BlockStorage for ConcurrentEditStorage {
    fn create_sink(&self, path: &Path) -> io::Result<Box<dyn BlockSink>> {
        if let Some(batch) = self.batch.lock().take() {
            self.overlay.modify(|d| d.apply(batch));
        }
        Ok(Box::new(FileSink::create(path)?))
    }
}
