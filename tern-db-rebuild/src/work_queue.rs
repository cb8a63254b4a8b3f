//! Bounded producer/consumer queue with a fixed worker pool.
//!
//! `push` blocks while the queue is full (backpressure), but never for
//! longer than the stall timeout. `finish` closes the queue, waits for
//! queued and in-flight items to drain and joins every worker, again with
//! a bounded wait. A starved worker therefore surfaces as a
//! [`RebuildError::RebuildTimeout`] naming the queue instead of a hang.
//!
//! The first handler error is kept; later items are drained without being
//! handled, and the error is returned from the next `push` or from `finish`.

use crate::error::{RebuildError, Result};
use crate::threads::{ThreadRegistry, WorkerGroup};
use crossbeam_channel::{SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct QueueState {
    failed: AtomicBool,
    error: Mutex<Option<RebuildError>>,
    processed: AtomicUsize,
}

impl QueueState {
    fn record(&self, err: RebuildError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn take_error(&self) -> Option<RebuildError> {
        self.error.lock().take()
    }
}

pub struct BoundedWorkQueue<T: Send + 'static> {
    name: String,
    tx: Option<Sender<T>>,
    group: WorkerGroup,
    state: Arc<QueueState>,
    stall_timeout: Duration,
    pushed: usize,
    closed: bool,
}

impl<T: Send + 'static> BoundedWorkQueue<T> {
    /// Start `workers` threads that run `handler` on every pushed item.
    pub fn new<F>(
        registry: &ThreadRegistry,
        name: impl Into<String>,
        workers: usize,
        capacity: usize,
        stall_timeout: Duration,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if workers == 0 || capacity == 0 {
            return Err(RebuildError::InvalidConfig(format!(
                "queue {} needs at least one worker and one slot",
                name
            )));
        }
        let (tx, rx) = crossbeam_channel::bounded::<T>(capacity);
        let state = Arc::new(QueueState {
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            processed: AtomicUsize::new(0),
        });
        let handler = Arc::new(handler);
        let mut group = WorkerGroup::new(name.clone());

        for _ in 0..workers {
            let rx = rx.clone();
            let state = Arc::clone(&state);
            let handler = Arc::clone(&handler);
            group.spawn(registry, move || {
                for item in rx.iter() {
                    if !state.failed.load(Ordering::SeqCst) {
                        if let Err(e) = handler(item) {
                            state.record(e);
                        }
                    }
                    state.processed.fetch_add(1, Ordering::SeqCst);
                }
            })?;
        }

        tracing::trace!(queue = %name, workers, capacity, "work queue started");
        Ok(Self {
            name,
            tx: Some(tx),
            group,
            state,
            stall_timeout,
            pushed: 0,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn progress(&self) -> String {
        format!(
            "{} of {} items processed",
            self.state.processed.load(Ordering::SeqCst),
            self.pushed
        )
    }

    /// Enqueue `item`, waiting at most the stall timeout for a free slot.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.state.failed.load(Ordering::SeqCst) {
            return Err(self.state.take_error().unwrap_or(RebuildError::Cancelled));
        }
        let tx = self.tx.as_ref().ok_or_else(|| {
            RebuildError::InvalidConfig(format!("push to finished queue {}", self.name))
        })?;
        match tx.send_timeout(item, self.stall_timeout) {
            Ok(()) => {
                self.pushed += 1;
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(RebuildError::RebuildTimeout {
                component: format!("queue {}", self.name),
                last_progress: self.progress(),
                waited: self.stall_timeout,
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(RebuildError::WorkerPanicked {
                component: self.name.clone(),
                detail: "all workers exited".into(),
            }),
        }
    }

    fn close_and_join(&mut self) -> Result<()> {
        self.tx = None;
        self.closed = true;
        self.group.join(self.stall_timeout).map_err(|e| match e {
            RebuildError::RebuildTimeout {
                component, waited, ..
            } => RebuildError::RebuildTimeout {
                component: format!("queue {} finish ({})", self.name, component),
                last_progress: self.progress(),
                waited,
            },
            other => other,
        })
    }

    /// Stop accepting items, drain the queue and join the workers.
    pub fn finish(mut self) -> Result<()> {
        self.close_and_join()?;
        match self.state.take_error() {
            Some(e) => Err(e),
            None => {
                tracing::trace!(queue = %self.name, items = self.pushed, "work queue finished");
                Ok(())
            }
        }
    }
}

impl<T: Send + 'static> Drop for BoundedWorkQueue<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_and_join() {
                tracing::warn!(
                    queue = %self.name,
                    error = %e,
                    "queue dropped without a clean finish"
                );
            }
        }
    }
}
