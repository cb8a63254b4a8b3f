//! Thread budget governor.
//!
//! Every pool in the pipeline gets its size from here, computed once from
//! a single ceiling before any thread exists:
//!
//! | Layer | Size |
//! |-------|------|
//! | outer dispatch pool | `min(pairs, ceiling)` |
//! | per-task write workers | `1`, or up to [`MAX_INNER_WORKERS`] when the ceiling allows |
//! | per-task scan workers | same rule; `1` means synchronous scanning |
//! | per-task finalize workers | [`FINALIZE_WORKERS`] |
//!
//! The product `outer * write * scan` never exceeds the ceiling. Inner
//! parallelism is only granted once the ceiling is at least
//! [`INNER_PARALLELISM_FACTOR`] times the number of pairs; below that
//! every task runs its inner work sequentially, which keeps the total
//! number of live threads linear in the number of pairs.

use crate::error::{RebuildError, Result};
use serde::{Deserialize, Serialize};

/// Cap on each inner pool, however large the ceiling.
pub const MAX_INNER_WORKERS: usize = 4;
/// Ceiling-to-pairs ratio required before inner pools grow past 1.
pub const INNER_PARALLELISM_FACTOR: usize = 4;
/// Smallest ceiling that still makes progress (one task at a time).
pub const MIN_CEILING: usize = 1;
pub const FINALIZE_WORKERS: usize = 1;
pub const FINALIZE_QUEUE_DEPTH: usize = 2;
/// Write queue capacity per write worker.
pub const WRITE_QUEUE_DEPTH_FACTOR: usize = 2;

/// Pool sizes for one rebuild. Immutable once computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBudget {
    pub outer_pool_size: usize,
    pub write_workers: usize,
    pub write_queue_depth: usize,
    /// 0 or 1 means the scanner reads every block on the task thread.
    pub scan_workers: usize,
    pub finalize_workers: usize,
    pub finalize_queue_depth: usize,
}

impl ThreadBudget {
    /// Fully sequential inner work under `outer` concurrent tasks.
    pub fn sequential(outer: usize) -> Self {
        Self::with_inner(outer, 1, 1)
    }

    pub fn with_inner(outer: usize, write: usize, scan: usize) -> Self {
        Self {
            outer_pool_size: outer,
            write_workers: write,
            write_queue_depth: write * WRITE_QUEUE_DEPTH_FACTOR,
            scan_workers: scan,
            finalize_workers: FINALIZE_WORKERS,
            finalize_queue_depth: FINALIZE_QUEUE_DEPTH,
        }
    }

    /// `outer * write * scan`, the quantity bounded by the ceiling.
    pub fn product(&self) -> usize {
        self.outer_pool_size * self.write_workers * self.scan_workers.max(1)
    }

    /// Helper threads the scanner spawns; synchronous scans spawn none.
    pub fn scan_helper_threads(&self) -> usize {
        if self.scan_workers <= 1 {
            0
        } else {
            self.scan_workers
        }
    }

    /// Threads one task needs alive at once: itself plus its inner pools.
    pub fn threads_per_task(&self) -> usize {
        1 + self.write_workers + self.scan_helper_threads() + self.finalize_workers
    }

    /// Upper bound on pipeline threads alive at any instant.
    pub fn max_live_threads(&self) -> usize {
        self.outer_pool_size * self.threads_per_task()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("outer_pool_size", self.outer_pool_size),
            ("write_workers", self.write_workers),
            ("write_queue_depth", self.write_queue_depth),
            ("finalize_workers", self.finalize_workers),
            ("finalize_queue_depth", self.finalize_queue_depth),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RebuildError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// Integer square root (floor).
fn isqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r > n {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= n {
        r += 1;
    }
    r
}

/// Derive every pool size from `ceiling` for `num_pairs` independent tasks.
pub fn compute_budget(ceiling: usize, num_pairs: usize) -> Result<ThreadBudget> {
    if ceiling < MIN_CEILING {
        return Err(RebuildError::ConcurrencyBudgetExceeded {
            ceiling,
            minimum: MIN_CEILING,
        });
    }
    if num_pairs == 0 {
        return Err(RebuildError::InvalidConfig(
            "at least one permutation pair is required".into(),
        ));
    }

    let outer = num_pairs.min(ceiling);
    if ceiling < INNER_PARALLELISM_FACTOR * num_pairs {
        return Ok(ThreadBudget::sequential(outer));
    }

    let per_task = ceiling / outer;
    let write = isqrt(per_task).clamp(1, MAX_INNER_WORKERS);
    let scan = (per_task / write).clamp(1, MAX_INNER_WORKERS);
    Ok(ThreadBudget::with_inner(outer, write, scan))
}
