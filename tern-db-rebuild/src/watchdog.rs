//! Progress heartbeats, the stall watchdog's data source, and cooperative cancellation.

use crate::error::{RebuildError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_db_core::PermutationPair;

/// Shared stop flag checked by tasks at block boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call is the one that cancelled.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RebuildError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Dispatched,
    Started,
    BlockScanned,
    BlockWritten,
    Finalized,
    Completed,
}

#[derive(Clone, Debug)]
struct PairProgress {
    pair: PermutationPair,
    component: String,
    last_event: ProgressEvent,
    blocks_scanned: u64,
    blocks_written: u64,
    at: Instant,
}

/// Latest heartbeat per permutation pair.
#[derive(Debug)]
pub struct ProgressBoard {
    created: Instant,
    entries: Mutex<Vec<PairProgress>>,
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn beat(&self, pair: PermutationPair, component: &str, event: ProgressEvent) {
        let mut entries = self.entries.lock();
        let idx = match entries.iter().position(|e| e.pair == pair) {
            Some(i) => i,
            None => {
                entries.push(PairProgress {
                    pair,
                    component: String::new(),
                    last_event: event,
                    blocks_scanned: 0,
                    blocks_written: 0,
                    at: Instant::now(),
                });
                entries.len() - 1
            }
        };
        let entry = &mut entries[idx];
        if entry.component != component {
            entry.component = component.to_string();
        }
        entry.last_event = event;
        entry.at = Instant::now();
        match event {
            ProgressEvent::BlockScanned => entry.blocks_scanned += 1,
            ProgressEvent::BlockWritten => entry.blocks_written += 1,
            _ => {}
        }
    }

    /// Time since the most recent heartbeat (or since creation, if none).
    pub fn idle_for(&self) -> Duration {
        let entries = self.entries.lock();
        let last = entries.iter().map(|e| e.at).max().unwrap_or(self.created);
        last.elapsed()
    }

    /// The component with the most recent heartbeat, and a summary of every pair.
    pub fn describe(&self) -> (String, String) {
        let entries = self.entries.lock();
        let component = entries
            .iter()
            .max_by_key(|e| e.at)
            .map(|e| format!("{} {}", e.pair, e.component))
            .unwrap_or_else(|| "dispatcher".to_string());
        let summary = entries
            .iter()
            .map(|e| {
                format!(
                    "{}: {} {:?} ({} scanned, {} written, {:.1}s ago)",
                    e.pair,
                    e.component,
                    e.last_event,
                    e.blocks_scanned,
                    e.blocks_written,
                    e.at.elapsed().as_secs_f64()
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        let summary = if summary.is_empty() {
            "no task reported progress".to_string()
        } else {
            summary
        };
        (component, summary)
    }

    /// The watchdog's verdict once `idle_for()` exceeded the interval.
    pub fn stall_error(&self) -> RebuildError {
        let waited = self.idle_for();
        let (component, last_progress) = self.describe();
        RebuildError::RebuildTimeout {
            component,
            last_progress,
            waited,
        }
    }
}
