//! # Tern DB Rebuild
//!
//! Materializes the delta-triple overlay into a new generation of the
//! permutation files. This crate provides:
//!
//! - The rebuild coordinator (`coordinator` module)
//! - Per-pair rebuild tasks: ordered scan, merge, ordered write
//! - The thread budget governor every pool size is derived from
//! - Bounded queues, worker groups and the stall watchdog
//!
//! ## Design
//!
//! Concurrency is bounded at every layer from one ceiling. The outer pool
//! runs one task per permutation pair; each task owns a write pool, a
//! finalize pool and optionally a scan prefetch pool, all sized by
//! [`compute_budget`]. Every blocking wait is bounded, so a starved worker
//! surfaces as [`RebuildError::RebuildTimeout`] instead of a hang.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod governor;
pub mod logging;
pub mod merge;
pub mod remap;
pub mod scanner;
pub mod stats;
pub mod task;
pub mod threads;
pub mod watchdog;
pub mod work_queue;

// Re-export main types
pub use config::RebuildConfig;
pub use coordinator::{RebuildCoordinator, RebuildSummary};
pub use error::{ErrorClass, RebuildError, Result};
pub use governor::{compute_budget, ThreadBudget};
pub use logging::with_suppressed_diagnostics;
pub use merge::{BlockMerger, MergeCounts, MergedChunk};
pub use remap::{prepare_edits, remap_vocabulary, PreparedEdits, SortedEdit, VocabRemapTable};
pub use scanner::OrderedBlockScanner;
pub use stats::{collect_statistics, IndexStatistics, PredicateCount};
pub use task::{OrderedAppender, PairOutcome, PermutationRebuildTask, TaskContext};
pub use threads::{ThreadRegistry, ThreadStats, WorkerGroup};
pub use watchdog::{CancellationToken, ProgressBoard, ProgressEvent};
pub use work_queue::BoundedWorkQueue;
