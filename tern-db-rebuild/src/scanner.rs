//! Ordered block scanner over an old permutation.
//!
//! The first and last blocks are always read on the calling thread.
//! Interior blocks are either read synchronously as well (`scan_workers`
//! of 0 or 1) or prefetched by a small helper pool:
//!
//! - a helper takes a permit, then claims the next interior index from a
//!   shared counter, reads and decodes that block and sends it back
//! - the consumer keeps out-of-order arrivals in a reorder buffer and only
//!   releases block `i + 1` after block `i`
//! - a permit is returned when the consumer releases a block, so at most
//!   `permits` decoded blocks exist at once
//!
//! Taking the permit before claiming an index keeps the claimed indices a
//! prefix of the unreleased ones, so the block the consumer is waiting for
//! always belongs to a permit holder. Output is identical for every worker
//! count; parallelism only changes when blocks are decoded.
//!
//! Any read error fails the scan. Nothing is retried.

use crate::error::{RebuildError, Result};
use crate::threads::{ThreadRegistry, WorkerGroup};
use crate::watchdog::CancellationToken;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tern_db_binary_index::{Block, PermutationReader};
use tern_db_core::{PermutationId, Quad};

/// Decoded blocks allowed in flight per helper.
const PERMITS_PER_WORKER: usize = 2;

/// How often a blocked reorder wait looks at the cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

type Fetched = (usize, tern_db_binary_index::Result<Block>);

struct Prefetch {
    results: Receiver<Fetched>,
    permits: Sender<()>,
    pending: BTreeMap<usize, Block>,
    claimed: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    group: WorkerGroup,
}

pub struct OrderedBlockScanner {
    reader: Arc<PermutationReader>,
    id: PermutationId,
    next: usize,
    num_blocks: usize,
    prev_last: Option<Quad>,
    prefetch: Option<Prefetch>,
    stall_timeout: Duration,
    cancel: CancellationToken,
    done: bool,
}

impl OrderedBlockScanner {
    pub fn open(
        reader: Arc<PermutationReader>,
        scan_workers: usize,
        registry: &ThreadRegistry,
        stall_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let id = reader.id();
        let num_blocks = reader.num_blocks();
        let interior = num_blocks.saturating_sub(2);
        let prefetch = if scan_workers > 1 && interior > 0 {
            Some(Self::start_helpers(&reader, scan_workers, registry)?)
        } else {
            None
        };
        tracing::debug!(
            permutation = %id,
            blocks = num_blocks,
            helpers = prefetch.as_ref().map_or(0, |p| p.group.len()),
            "scan started"
        );
        Ok(Self {
            reader,
            id,
            next: 0,
            num_blocks,
            prev_last: None,
            prefetch,
            stall_timeout,
            cancel,
            done: false,
        })
    }

    fn start_helpers(
        reader: &Arc<PermutationReader>,
        workers: usize,
        registry: &ThreadRegistry,
    ) -> Result<Prefetch> {
        let id = reader.id();
        let end = reader.num_blocks() - 1;
        let permit_count = workers * PERMITS_PER_WORKER;
        let (permit_tx, permit_rx) = crossbeam_channel::bounded::<()>(permit_count);
        for _ in 0..permit_count {
            let _ = permit_tx.send(());
        }
        let (result_tx, result_rx) = crossbeam_channel::bounded::<Fetched>(permit_count);
        let claimed = Arc::new(AtomicUsize::new(1));
        let stop = Arc::new(AtomicBool::new(false));
        let mut group = WorkerGroup::new(format!("scan-{}", id));

        for _ in 0..workers {
            let reader = Arc::clone(reader);
            let permit_rx = permit_rx.clone();
            let result_tx = result_tx.clone();
            let claimed = Arc::clone(&claimed);
            let stop = Arc::clone(&stop);
            group.spawn(registry, move || loop {
                if stop.load(Ordering::SeqCst) || permit_rx.recv().is_err() {
                    break;
                }
                let idx = claimed.fetch_add(1, Ordering::SeqCst);
                if idx >= end || stop.load(Ordering::SeqCst) {
                    break;
                }
                let fetched = reader.read_block(idx);
                let failed = fetched.is_err();
                if result_tx.send((idx, fetched)).is_err() || failed {
                    break;
                }
            })?;
        }

        Ok(Prefetch {
            results: result_rx,
            permits: permit_tx,
            pending: BTreeMap::new(),
            claimed,
            stop,
            group,
        })
    }

    pub fn permutation(&self) -> PermutationId {
        self.id
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn read_sync(&self, index: usize) -> Result<Block> {
        self.reader
            .read_block(index)
            .map_err(RebuildError::scan(self.id, Some(index)))
    }

    fn wait_prefetched(&mut self, index: usize) -> Result<Block> {
        let id = self.id;
        let stall_timeout = self.stall_timeout;
        let cancel = self.cancel.clone();
        let prefetch = match self.prefetch.as_mut() {
            Some(p) => p,
            None => return self.read_sync(index),
        };
        let deadline = Instant::now() + stall_timeout;
        loop {
            if let Some(block) = prefetch.pending.remove(&index) {
                let _ = prefetch.permits.send(());
                return Ok(block);
            }
            cancel.check()?;
            let tick = deadline
                .saturating_duration_since(Instant::now())
                .min(CANCEL_POLL);
            match prefetch.results.recv_timeout(tick) {
                Ok((i, Ok(block))) => {
                    prefetch.pending.insert(i, block);
                }
                Ok((i, Err(source))) => {
                    return Err(RebuildError::ScanIo {
                        permutation: id,
                        block: Some(i),
                        source,
                    })
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RebuildError::RebuildTimeout {
                        component: format!("scanner {}", id),
                        last_progress: format!(
                            "waiting for block {}; {} buffered, next unclaimed {}",
                            index,
                            prefetch.pending.len(),
                            prefetch.claimed.load(Ordering::SeqCst)
                        ),
                        waited: stall_timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RebuildError::WorkerPanicked {
                        component: format!("scan-{}", id),
                        detail: format!("helpers exited before delivering block {}", index),
                    })
                }
            }
        }
    }

    fn check_order(&mut self, block: &Block, expected: usize) -> Result<()> {
        let id = self.id;
        let perm = id.permutation;
        let violation = |detail: String| RebuildError::OrderingViolation {
            permutation: id,
            detail,
        };
        if block.index != expected {
            return Err(violation(format!(
                "scanner yielded block {} where {} was due",
                block.index, expected
            )));
        }
        if let Some(w) = block
            .rows
            .windows(2)
            .position(|w| !perm.compare(&w[0], &w[1]).is_lt())
        {
            return Err(violation(format!("block {} unsorted at row {}", expected, w + 1)));
        }
        if let (Some(prev), Some(first)) = (self.prev_last, block.first()) {
            if !perm.compare(&prev, first).is_lt() {
                return Err(violation(format!(
                    "block {} starts at {:?}, not after previous last {:?}",
                    expected, first, prev
                )));
            }
        }
        if let Some(last) = block.last() {
            self.prev_last = Some(*last);
        }
        Ok(())
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        if self.next >= self.num_blocks {
            return Ok(None);
        }
        self.cancel.check()?;
        let index = self.next;
        let interior = index != 0 && index + 1 != self.num_blocks;
        let block = if interior {
            self.wait_prefetched(index)?
        } else {
            self.read_sync(index)?
        };
        self.check_order(&block, index)?;
        self.next += 1;
        Ok(Some(block))
    }

    fn stop_helpers(&mut self) -> Result<()> {
        let Some(prefetch) = self.prefetch.take() else {
            return Ok(());
        };
        prefetch.stop.store(true, Ordering::SeqCst);
        let Prefetch {
            results,
            permits,
            mut group,
            ..
        } = prefetch;
        // Closing both channels wakes helpers blocked on a permit or a send.
        drop(permits);
        drop(results);
        group.join(self.stall_timeout)
    }

    /// Join the helper pool. Call after the last block has been taken.
    pub fn finish(mut self) -> Result<()> {
        self.done = true;
        self.stop_helpers()
    }
}

impl Iterator for OrderedBlockScanner {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for OrderedBlockScanner {
    fn drop(&mut self) {
        if let Err(e) = self.stop_helpers() {
            tracing::warn!(permutation = %self.id, error = %e, "scan helpers did not stop cleanly");
        }
    }
}
