//! One permutation pair's rebuild.
//!
//! The two permutations of a pair are rebuilt one after the other on the
//! task's own thread. For each permutation the task wires up, in order:
//!
//! 1. a finalize queue that persists the finished block table,
//! 2. a write queue whose workers compress merged chunks and hand them to
//!    an [`OrderedAppender`],
//! 3. an [`OrderedBlockScanner`] over the old permutation.
//!
//! Then it merges scanned blocks with the pair's edits, pushes every output
//! chunk to the write queue, and drains the queues back to front. All pool
//! sizes come from the [`ThreadBudget`]; the task never picks its own.

use crate::error::{RebuildError, Result};
use crate::governor::ThreadBudget;
use crate::merge::{BlockMerger, MergeCounts, MergedChunk};
use crate::remap::PreparedEdits;
use crate::scanner::OrderedBlockScanner;
use crate::threads::ThreadRegistry;
use crate::watchdog::{CancellationToken, ProgressBoard, ProgressEvent};
use crate::work_queue::BoundedWorkQueue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_db_binary_index::meta::write_json;
use tern_db_binary_index::{
    encode_block, BlockStorage, EncodedBlock, IndexLayout, PermutationMeta, PermutationReader,
    PermutationWriter,
};
use tern_db_core::{PermutationId, PermutationPair, Quad};

/// Everything a task shares with the coordinator and its sibling tasks.
pub struct TaskContext {
    pub old: IndexLayout,
    /// Generation the task writes. Never the live one.
    pub next: IndexLayout,
    pub edits: Arc<PreparedEdits>,
    pub budget: ThreadBudget,
    pub registry: ThreadRegistry,
    pub storage: Arc<dyn BlockStorage>,
    pub board: Arc<ProgressBoard>,
    pub cancel: CancellationToken,
    pub stall_timeout: Duration,
    pub fallback_block_rows: usize,
    pub zstd_level: i32,
}

impl TaskContext {
    /// Stop sibling tasks and release every thread still parked for admission,
    /// before the failing pipeline is dropped and joined.
    ///
    /// Only the error that starts the abort is kept. Anything a task hits
    /// after a sibling aborted (released helpers, closed channels) is
    /// reported as [`RebuildError::Cancelled`].
    fn fail(&self, err: RebuildError) -> RebuildError {
        let first = self.cancel.cancel();
        self.registry.shutdown();
        if first {
            err
        } else {
            RebuildError::Cancelled
        }
    }

    /// Abort without reclassifying `err`.
    fn abort(&self, err: RebuildError) -> RebuildError {
        self.cancel.cancel();
        self.registry.shutdown();
        err
    }
}

/// Result of a finished pair.
#[derive(Clone, Debug)]
pub struct PairOutcome {
    pub pair: PermutationPair,
    pub metas: Vec<PermutationMeta>,
    pub counts: Vec<(PermutationId, MergeCounts)>,
}

impl PairOutcome {
    /// Counts of the pair's first permutation. Both permutations hold the
    /// same rows, so they agree on inserted and deleted.
    pub fn primary_counts(&self) -> MergeCounts {
        self.counts.first().map(|(_, c)| *c).unwrap_or_default()
    }
}

// ============================================================================
// OrderedAppender
// ============================================================================

/// Appends blocks to the writer in sequence order, whatever order they
/// were compressed in.
pub struct OrderedAppender {
    writer: Option<PermutationWriter>,
    pending: BTreeMap<u64, EncodedBlock>,
    next: u64,
}

impl OrderedAppender {
    pub fn new(writer: PermutationWriter) -> Self {
        Self {
            writer: Some(writer),
            pending: BTreeMap::new(),
            next: 0,
        }
    }

    /// Buffer `block` and append every block that is now next in line.
    /// Returns how many blocks were appended.
    pub fn submit(&mut self, seq: u64, block: EncodedBlock) -> Result<usize> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            RebuildError::InvalidConfig("block submitted after the writer was taken".into())
        })?;
        let id = writer.permutation();
        if seq < self.next || self.pending.contains_key(&seq) {
            return Err(RebuildError::OrderingViolation {
                permutation: id,
                detail: format!("block sequence {} submitted twice", seq),
            });
        }
        self.pending.insert(seq, block);
        let mut appended = 0;
        while let Some(block) = self.pending.remove(&self.next) {
            writer.append(&block).map_err(RebuildError::write(id))?;
            self.next += 1;
            appended += 1;
        }
        Ok(appended)
    }

    /// Hand back the writer once exactly `expected` blocks were appended.
    pub fn take_writer(&mut self, expected: u64) -> Result<PermutationWriter> {
        let writer = self.writer.take().ok_or_else(|| {
            RebuildError::InvalidConfig("writer already taken".into())
        })?;
        if self.next != expected || !self.pending.is_empty() {
            return Err(RebuildError::OrderingViolation {
                permutation: writer.permutation(),
                detail: format!(
                    "{} of {} blocks appended, {} still waiting for a gap",
                    self.next,
                    expected,
                    self.pending.len()
                ),
            });
        }
        Ok(writer)
    }
}

/// Work item of the write queue.
enum WriteItem {
    Rows(Vec<Quad>),
    Encoded(EncodedBlock),
}

// ============================================================================
// PermutationRebuildTask
// ============================================================================

pub struct PermutationRebuildTask {
    pair: PermutationPair,
    ctx: Arc<TaskContext>,
}

impl PermutationRebuildTask {
    pub fn new(pair: PermutationPair, ctx: Arc<TaskContext>) -> Self {
        Self { pair, ctx }
    }

    pub fn pair(&self) -> PermutationPair {
        self.pair
    }

    pub fn run(self) -> Result<PairOutcome> {
        let span = tracing::info_span!("rebuild_pair", pair = %self.pair);
        let _g = span.enter();
        let started = Instant::now();
        self.ctx
            .board
            .beat(self.pair, "start", ProgressEvent::Started);

        let mut metas = Vec::with_capacity(2);
        let mut counts = Vec::with_capacity(2);
        for id in self.pair.permutations() {
            let (meta, c) = self
                .rebuild_permutation(id)
                .map_err(|e| self.ctx.abort(e))?;
            metas.push(meta);
            counts.push((id, c));
        }

        self.ctx
            .board
            .beat(self.pair, "done", ProgressEvent::Completed);
        tracing::info!(
            pair = %self.pair,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pair rebuilt"
        );
        Ok(PairOutcome {
            pair: self.pair,
            metas,
            counts,
        })
    }

    fn rebuild_permutation(&self, id: PermutationId) -> Result<(PermutationMeta, MergeCounts)> {
        let ctx = &self.ctx;
        let span = tracing::debug_span!("rebuild_permutation", permutation = %id);
        let _g = span.enter();
        let started = Instant::now();
        ctx.cancel.check()?;

        let reader = Arc::new(
            PermutationReader::open(&ctx.old, id).map_err(RebuildError::scan(id, None))?,
        );
        let target_rows = match reader.meta().target_block_rows {
            0 => ctx.fallback_block_rows,
            n => n,
        };

        let mut finalize_q = self.finalize_queue(id)?;
        let writer = PermutationWriter::create(
            ctx.storage.as_ref(),
            &ctx.next.data_path(id),
            id,
            target_rows,
        )
        .map_err(RebuildError::write(id))?;
        let appender = Arc::new(Mutex::new(OrderedAppender::new(writer)));
        let mut write_q = self.write_queue(id, Arc::clone(&appender))?;
        let mut scanner = OrderedBlockScanner::open(
            Arc::clone(&reader),
            ctx.budget.scan_workers,
            &ctx.registry,
            ctx.stall_timeout,
            ctx.cancel.clone(),
        )?;

        let (counts, blocks) = self
            .pump(id, &reader, &mut scanner, &mut write_q, target_rows)
            .map_err(|e| ctx.fail(e))?;
        scanner.finish().map_err(|e| ctx.fail(e))?;
        write_q.finish().map_err(|e| ctx.fail(e))?;
        // Workers refused admission after an abort leave gaps; report the abort instead.
        ctx.cancel.check()?;
        let writer = appender
            .lock()
            .take_writer(blocks)
            .map_err(|e| ctx.fail(e))?;
        let meta = writer
            .finish()
            .map_err(|e| ctx.fail(RebuildError::write(id)(e)))?;
        finalize_q
            .push(meta.clone())
            .map_err(|e| ctx.fail(e))?;
        finalize_q.finish().map_err(|e| ctx.fail(e))?;

        tracing::debug!(
            permutation = %id,
            rows = meta.total_rows,
            blocks = meta.blocks.len(),
            inserted = counts.inserted,
            deleted = counts.deleted,
            passed_through = counts.passed_through_blocks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "permutation rebuilt"
        );
        Ok((meta, counts))
    }

    /// Merge every scanned block and feed the write queue.
    /// Returns the merge counts and the number of blocks pushed.
    fn pump(
        &self,
        id: PermutationId,
        reader: &PermutationReader,
        scanner: &mut OrderedBlockScanner,
        write_q: &mut BoundedWorkQueue<(u64, WriteItem)>,
        target_rows: usize,
    ) -> Result<(MergeCounts, u64)> {
        let ctx = &self.ctx;
        let scan_component = format!("scan {}", id);
        let mut merger = BlockMerger::new(
            id.permutation,
            ctx.edits.for_permutation(id),
            target_rows,
        );
        let mut seq = 0u64;
        let mut sink = |chunk: MergedChunk| -> Result<()> {
            let item = match chunk {
                MergedChunk::Rows(rows) => WriteItem::Rows(rows),
                MergedChunk::PassThrough(index) => WriteItem::Encoded(
                    reader
                        .read_encoded(index)
                        .map_err(RebuildError::scan(id, Some(index)))?,
                ),
            };
            write_q.push((seq, item))?;
            seq += 1;
            Ok(())
        };

        while let Some(block) = scanner.next() {
            let block = block?;
            ctx.cancel.check()?;
            merger.push_block(&block, &mut sink)?;
            ctx.board
                .beat(self.pair, &scan_component, ProgressEvent::BlockScanned);
        }
        let counts = merger.finish(&mut sink)?;
        Ok((counts, seq))
    }

    fn write_queue(
        &self,
        id: PermutationId,
        appender: Arc<Mutex<OrderedAppender>>,
    ) -> Result<BoundedWorkQueue<(u64, WriteItem)>> {
        let ctx = &self.ctx;
        let board = Arc::clone(&ctx.board);
        let pair = self.pair;
        let level = ctx.zstd_level;
        let component = format!("write {}", id);
        BoundedWorkQueue::new(
            &ctx.registry,
            format!("write-{}", id),
            ctx.budget.write_workers,
            ctx.budget.write_queue_depth,
            ctx.stall_timeout,
            move |(seq, item): (u64, WriteItem)| {
                let block = match item {
                    WriteItem::Rows(rows) => {
                        encode_block(&rows, level).map_err(|source| RebuildError::WriteIo {
                            permutation: id,
                            source,
                        })?
                    }
                    WriteItem::Encoded(block) => block,
                };
                let appended = appender.lock().submit(seq, block)?;
                for _ in 0..appended {
                    board.beat(pair, &component, ProgressEvent::BlockWritten);
                }
                Ok(())
            },
        )
    }

    fn finalize_queue(&self, id: PermutationId) -> Result<BoundedWorkQueue<PermutationMeta>> {
        let ctx = &self.ctx;
        let board = Arc::clone(&ctx.board);
        let pair = self.pair;
        let path = ctx.next.meta_path(id);
        let component = format!("finalize {}", id);
        BoundedWorkQueue::new(
            &ctx.registry,
            format!("finalize-{}", id),
            ctx.budget.finalize_workers,
            ctx.budget.finalize_queue_depth,
            ctx.stall_timeout,
            move |meta: PermutationMeta| {
                write_json(&path, &meta).map_err(RebuildError::write(id))?;
                board.beat(pair, &component, ProgressEvent::Finalized);
                Ok(())
            },
        )
    }
}
