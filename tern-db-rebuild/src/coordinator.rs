//! Rebuild coordinator: materializes the delta-triple overlay into a new
//! generation of the permutation files.
//!
//! ## Phases
//!
//! 1. Skip guard: an empty overlay returns at once, before any pool exists.
//! 2. Snapshot the overlay, merge its local vocabulary into the permanent
//!    one and sort the remapped edits per permutation.
//! 3. Collect statistics from the old index (read-only).
//! 4. Size every pool from one [`ThreadBudget`].
//! 5. Dispatch one [`PermutationRebuildTask`] per pair onto the outer pool,
//!    never more than the pool has workers for.
//! 6. Collect a completion token per pair, then publish or discard.
//!
//! Every file of the new generation gets a generation-unique name, so the
//! live generation is never opened for writing. The manifest is staged
//! under a session name and renamed over the live one as the last step;
//! that rename is the only point where readers switch generations. A
//! failure before it leaves the old index exactly as it was.

use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result};
use crate::governor::{compute_budget, ThreadBudget};
use crate::logging::with_suppressed_diagnostics;
use crate::remap::{prepare_edits, remap_vocabulary};
use crate::stats::{collect_statistics, IndexStatistics};
use crate::task::{PairOutcome, PermutationRebuildTask, TaskContext};
use crate::threads::ThreadRegistry;
use crate::watchdog::{CancellationToken, ProgressBoard, ProgressEvent};
use crate::work_queue::BoundedWorkQueue;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_db_binary_index::meta::write_json;
use tern_db_binary_index::{
    BlockStorage, FsStorage, IndexLayout, IndexManifest, PermutationMeta, PermutationSummary,
    Vocabulary, FORMAT_VERSION,
};
use tern_db_core::{PermutationId, PermutationPair};
use tern_db_delta::DeltaTriplesManager;

/// Upper bound on how long the dispatcher waits between watchdog checks.
const WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// What a rebuild did.
#[derive(Clone, Debug, Default)]
pub struct RebuildSummary {
    /// The overlay was empty; nothing was read or written.
    pub skipped: bool,
    pub pairs_rebuilt: usize,
    /// Regular plus internal rows added.
    pub inserted: u64,
    /// Regular plus internal rows removed.
    pub deleted: u64,
    pub triple_count: u64,
    pub threads_spawned: usize,
    pub peak_live_threads: usize,
    pub budget: Option<ThreadBudget>,
    pub elapsed: Duration,
    /// Generation of the published index.
    pub generation: Option<u64>,
    /// Base path of the published index.
    pub target: Option<PathBuf>,
}

impl RebuildSummary {
    fn skipped(elapsed: Duration) -> Self {
        Self {
            skipped: true,
            elapsed,
            ..Default::default()
        }
    }
}

// ============================================================================
// Staging
// ============================================================================

/// Removes the files of an unpublished generation on drop.
struct StagingGuard {
    layout: IndexLayout,
    manifest: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(layout: IndexLayout, session: &str) -> Self {
        Self {
            manifest: layout.staged_manifest_path(session),
            layout,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut files = self.layout.generation_files();
        files.push(self.manifest.clone());
        let removed = remove_files(&files);
        tracing::debug!(
            generation = self.layout.generation(),
            removed,
            "unpublished generation discarded"
        );
    }
}

/// Best-effort removal; returns how many files were deleted.
fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0usize;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove index file")
            }
        }
    }
    removed
}

/// Switch readers to `next` by renaming its staged manifest over the live one.
fn publish(staged_manifest: &Path, next: &IndexLayout) -> Result<()> {
    let to = next.manifest_path();
    std::fs::rename(staged_manifest, &to).map_err(|e| {
        RebuildError::Publish(format!(
            "{} -> {}: {}",
            staged_manifest.display(),
            to.display(),
            e
        ))
    })
}

// ============================================================================
// Completion tokens
// ============================================================================

type Completion = (PermutationPair, Result<PairOutcome>);

/// Resolved exactly once per dispatched pair, even if the task unwinds.
struct CompletionToken {
    pair: PermutationPair,
    tx: Sender<Completion>,
    resolved: bool,
}

impl CompletionToken {
    fn resolve(mut self, result: Result<PairOutcome>) {
        self.resolved = true;
        let _ = self.tx.send((self.pair, result));
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if !self.resolved {
            let _ = self.tx.send((
                self.pair,
                Err(RebuildError::WorkerPanicked {
                    component: format!("task {}", self.pair),
                    detail: "task ended without reporting completion".into(),
                }),
            ));
        }
    }
}

/// Keep the most informative error: a root cause beats the cancellations it triggered.
fn record(slot: &mut Option<RebuildError>, err: RebuildError) {
    match slot {
        Some(existing) if !matches!(existing, RebuildError::Cancelled) => {}
        _ => *slot = Some(err),
    }
}

// ============================================================================
// RebuildCoordinator
// ============================================================================

pub struct RebuildCoordinator<S: BlockStorage = FsStorage> {
    overlay: Arc<DeltaTriplesManager>,
    config: RebuildConfig,
    storage: Arc<S>,
}

impl RebuildCoordinator<FsStorage> {
    pub fn new(overlay: Arc<DeltaTriplesManager>, config: RebuildConfig) -> Self {
        Self::with_storage(overlay, config, FsStorage)
    }
}

impl<S: BlockStorage + 'static> RebuildCoordinator<S> {
    /// Write new permutation data through `storage` instead of the filesystem default.
    pub fn with_storage(
        overlay: Arc<DeltaTriplesManager>,
        config: RebuildConfig,
        storage: S,
    ) -> Self {
        Self {
            overlay,
            config,
            storage: Arc::new(storage),
        }
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    /// The budget this coordinator will run with.
    pub fn budget(&self) -> Result<ThreadBudget> {
        match &self.config.budget_override {
            Some(budget) => {
                budget.validate()?;
                tracing::warn!(
                    ?budget,
                    product = budget.product(),
                    ceiling = self.config.concurrency_ceiling,
                    "thread budget override in effect; governor bypassed"
                );
                Ok(*budget)
            }
            None => compute_budget(self.config.concurrency_ceiling, PermutationPair::all().len()),
        }
    }

    /// Materialize the overlay into the index at `old_base`.
    ///
    /// With `new_base` unset (or equal to `old_base`) the next generation is
    /// published at the same base, the previous generation's files are
    /// removed and the snapshot's edits leave the overlay. Otherwise
    /// the result is published at `new_base`, which must not hold an index
    /// yet, and the old index and the overlay stay as they are.
    pub fn rebuild(&self, old_base: &Path, new_base: Option<&Path>) -> Result<RebuildSummary> {
        let started = Instant::now();
        let pending = self.overlay.counts();
        if pending.is_empty() {
            tracing::info!(
                old_base = %old_base.display(),
                "no pending delta triples; rebuild skipped"
            );
            return Ok(RebuildSummary::skipped(started.elapsed()));
        }
        self.config.validate()?;

        let span = tracing::info_span!(
            "rebuild",
            old_base = %old_base.display(),
            pending_inserts = pending.inserted,
            pending_deletes = pending.deleted,
        );
        let _g = span.enter();

        let (old, manifest) = IndexLayout::open(old_base).map_err(RebuildError::Metadata)?;
        let generation = manifest.generation + 1;
        let target = match new_base {
            Some(base) => IndexLayout::from_base(base),
            None => old.clone(),
        };
        let in_place = target.same_base(&old);
        if !in_place {
            if target.exists() {
                return Err(RebuildError::Publish(format!(
                    "an index already exists at {}",
                    target.base().display()
                )));
            }
            std::fs::create_dir_all(target.dir()).map_err(|e| {
                RebuildError::Publish(format!("{}: {}", target.dir().display(), e))
            })?;
        }
        let next = target.at_generation(generation);

        let snapshot = self.overlay.snapshot();
        let session = uuid::Uuid::new_v4().simple().to_string();
        let mut staging = StagingGuard::new(next.clone(), &session);
        tracing::debug!(
            epoch = snapshot.epoch,
            edits = snapshot.edits.len(),
            generation,
            staged_manifest = %staging.manifest.display(),
            "overlay snapshot taken"
        );

        // Vocabulary first: every task needs permanent ids.
        let mut vocabulary =
            Vocabulary::load(&old.vocabulary_path()).map_err(RebuildError::Metadata)?;
        let table = remap_vocabulary(&mut vocabulary, &snapshot.local_words);
        vocabulary.save(&next.vocabulary_path()).map_err(|e| {
            RebuildError::VocabRemap(format!("persisting merged vocabulary: {}", e))
        })?;
        let edits = Arc::new(prepare_edits(&snapshot, &table)?);
        tracing::debug!(
            local_words = table.len(),
            added = table.added(),
            vocabulary = vocabulary.len(),
            "vocabulary remapped"
        );

        let mut stats = if self.config.quiet_statistics {
            with_suppressed_diagnostics(|| {
                collect_statistics(&old, &vocabulary, manifest.generation)
            })
        } else {
            collect_statistics(&old, &vocabulary, manifest.generation)
        }?;

        let budget = self.budget()?;
        tracing::info!(
            outer = budget.outer_pool_size,
            write = budget.write_workers,
            scan = budget.scan_workers,
            max_live_threads = budget.max_live_threads(),
            "thread budget"
        );

        let storage: Arc<dyn BlockStorage> = self.storage.clone();
        let registry = ThreadRegistry::new(self.config.thread_slot_limit);
        let ctx = Arc::new(TaskContext {
            old: old.clone(),
            next: next.clone(),
            edits,
            budget,
            registry: registry.clone(),
            storage,
            board: Arc::new(ProgressBoard::new()),
            cancel: CancellationToken::new(),
            stall_timeout: self.config.stall_timeout,
            fallback_block_rows: self.config.fallback_block_rows,
            zstd_level: self.config.zstd_level,
        });

        let mut outcomes = match self.dispatch(&ctx) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                ctx.cancel.cancel();
                registry.shutdown();
                tracing::error!(
                    error = %e,
                    class = ?e.class(),
                    "rebuild failed; old index left untouched"
                );
                return Err(e);
            }
        };
        outcomes.sort_by_key(|o| o.pair);

        let order = PermutationId::all();
        let mut metas: Vec<PermutationMeta> =
            outcomes.iter().flat_map(|o| o.metas.iter().cloned()).collect();
        metas.sort_by_key(|m| order.iter().position(|id| *id == m.permutation));
        stats.complete_with(&metas);
        self.write_index_files(&next, &staging.manifest, &vocabulary, &stats, &metas)?;

        publish(&staging.manifest, &next)?;
        staging.disarm();

        if in_place {
            let retired = remove_files(&old.generation_files());
            tracing::debug!(
                generation = old.generation(),
                retired,
                "previous generation removed"
            );
            let folded = self.overlay.retire_snapshot(&snapshot, table.permanent_ids());
            tracing::debug!(
                folded,
                remaining = self.overlay.counts().total(),
                "overlay retired"
            );
        }

        let threads = registry.stats();
        let (inserted, deleted) = outcomes
            .iter()
            .filter(|o| matches!(o.pair, PermutationPair::PsoPos | PermutationPair::InternalPsoPos))
            .map(|o| o.primary_counts())
            .fold((0, 0), |(i, d), c| (i + c.inserted, d + c.deleted));

        let summary = RebuildSummary {
            skipped: false,
            pairs_rebuilt: outcomes.len(),
            inserted,
            deleted,
            triple_count: stats.triple_count,
            threads_spawned: threads.spawned,
            peak_live_threads: threads.peak_live,
            budget: Some(budget),
            elapsed: started.elapsed(),
            generation: Some(generation),
            target: Some(target.base()),
        };
        tracing::info!(
            generation,
            inserted,
            deleted,
            triples = summary.triple_count,
            threads_spawned = summary.threads_spawned,
            peak_live_threads = summary.peak_live_threads,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "rebuild published"
        );
        Ok(summary)
    }

    /// Run every pair on the outer pool and wait for all completion tokens.
    fn dispatch(&self, ctx: &Arc<TaskContext>) -> Result<Vec<PairOutcome>> {
        let span = tracing::debug_span!("dispatch");
        let _g = span.enter();

        let outer = ctx.budget.outer_pool_size;
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Completion>();
        let task_ctx = Arc::clone(ctx);
        let mut pool = BoundedWorkQueue::new(
            &ctx.registry,
            "rebuild",
            outer,
            outer,
            self.config.stall_timeout,
            move |pair: PermutationPair| {
                let token = CompletionToken {
                    pair,
                    tx: done_tx.clone(),
                    resolved: false,
                };
                token.resolve(PermutationRebuildTask::new(pair, Arc::clone(&task_ctx)).run());
                Ok(())
            },
        )?;

        let watchdog = self.config.watchdog;
        let tick = watchdog.min(WATCHDOG_TICK);
        let mut queued: VecDeque<PermutationPair> =
            PermutationPair::all().iter().copied().collect();
        let mut in_flight = 0usize;
        let mut outcomes = Vec::with_capacity(queued.len());
        let mut failure: Option<RebuildError> = None;

        loop {
            while failure.is_none() && in_flight < outer {
                let Some(pair) = queued.pop_front() else {
                    break;
                };
                ctx.board.beat(pair, "queued", ProgressEvent::Dispatched);
                match pool.push(pair) {
                    Ok(()) => in_flight += 1,
                    Err(e) => {
                        ctx.cancel.cancel();
                        record(&mut failure, e);
                    }
                }
            }
            if in_flight == 0 {
                break;
            }

            match done_rx.recv_timeout(tick) {
                Ok((pair, Ok(outcome))) => {
                    in_flight -= 1;
                    tracing::debug!(%pair, remaining = in_flight + queued.len(), "pair completed");
                    outcomes.push(outcome);
                }
                Ok((pair, Err(e))) => {
                    in_flight -= 1;
                    if !matches!(e, RebuildError::Cancelled) {
                        tracing::warn!(%pair, error = %e, "pair failed; cancelling rebuild");
                    }
                    ctx.cancel.cancel();
                    ctx.registry.shutdown();
                    record(&mut failure, e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.board.idle_for() >= watchdog {
                        let err = ctx.board.stall_error();
                        tracing::error!(error = %err, in_flight, "watchdog fired");
                        ctx.cancel.cancel();
                        ctx.registry.shutdown();
                        record(&mut failure, err);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    record(
                        &mut failure,
                        RebuildError::WorkerPanicked {
                            component: "rebuild".into(),
                            detail: format!("{} tasks never reported completion", in_flight),
                        },
                    );
                    break;
                }
            }
        }

        if let Err(e) = pool.finish() {
            record(&mut failure, e);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    fn write_index_files(
        &self,
        next: &IndexLayout,
        staged_manifest: &Path,
        vocabulary: &Vocabulary,
        stats: &IndexStatistics,
        metas: &[PermutationMeta],
    ) -> Result<()> {
        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            generation: next.generation(),
            permutations: metas.iter().map(PermutationSummary::from).collect(),
            vocabulary_size: vocabulary.len() as u64,
            triple_count: stats.triple_count,
            internal_triple_count: stats.internal_triple_count,
        };
        write_json(&next.stats_path(), stats)
            .and_then(|()| write_json(staged_manifest, &manifest))
            .map_err(|e| RebuildError::Publish(format!("writing staged metadata: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_binary_index::{write_index, WriteOptions};
    use tern_db_core::{Quad, TermId, TripleScope};

    fn fixture(dir: &Path) -> PathBuf {
        let base = dir.join("kb");
        let vocab = Vocabulary::from_words((0..8).map(|i| format!("<w{i}>"))).unwrap();
        let v = TermId::vocab;
        let quads = vec![
            (Quad::triple(v(0), v(5), v(1)), TripleScope::Regular),
            (Quad::triple(v(1), v(5), v(2)), TripleScope::Regular),
        ];
        write_index(&base, &vocab, &quads, &WriteOptions::default()).unwrap();
        base
    }

    #[test]
    fn test_record_prefers_root_cause() {
        let mut slot = None;
        record(&mut slot, RebuildError::Cancelled);
        record(&mut slot, RebuildError::VocabRemap("x".into()));
        record(&mut slot, RebuildError::Cancelled);
        record(&mut slot, RebuildError::Publish("later".into()));
        assert!(matches!(slot, Some(RebuildError::VocabRemap(_))));
    }

    #[test]
    fn test_unresolved_token_reports_panic() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(CompletionToken {
            pair: PermutationPair::OspOps,
            tx,
            resolved: false,
        });
        let (pair, result) = rx.recv().unwrap();
        assert_eq!(pair, PermutationPair::OspOps);
        assert!(matches!(result, Err(RebuildError::WorkerPanicked { .. })));
    }

    #[test]
    fn test_existing_target_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let old = fixture(dir.path());
        let other = dir.path().join("other");
        write_index(&other, &Vocabulary::new(), &[], &WriteOptions::default()).unwrap();

        let overlay = Arc::new(DeltaTriplesManager::new());
        let q = Quad::triple(TermId::vocab(2), TermId::vocab(5), TermId::vocab(3));
        overlay.modify(|d| d.insert(q, TripleScope::Regular));
        let coordinator = RebuildCoordinator::new(Arc::clone(&overlay), RebuildConfig::default());
        let err = coordinator.rebuild(&old, Some(&other)).unwrap_err();
        assert!(matches!(err, RebuildError::Publish(_)));
        assert_eq!(overlay.counts().inserted, 1);
    }

    #[test]
    fn test_ceiling_below_floor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let old = fixture(dir.path());
        let names = |dir: &Path| -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };
        let before = names(dir.path());

        let overlay = Arc::new(DeltaTriplesManager::new());
        let q = Quad::triple(TermId::vocab(0), TermId::vocab(5), TermId::vocab(1));
        overlay.modify(|d| d.delete(q, TripleScope::Regular));
        let config = RebuildConfig::default().with_concurrency_ceiling(0);
        let err = RebuildCoordinator::new(overlay, config).rebuild(&old, None).unwrap_err();
        assert!(matches!(
            err,
            RebuildError::ConcurrencyBudgetExceeded { ceiling: 0, minimum: 1 }
        ));
        // The merged vocabulary of generation 1 was already written; it is gone again.
        assert_eq!(names(dir.path()), before);
    }
}
