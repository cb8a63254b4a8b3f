//! Thread registry and worker groups.
//!
//! Every thread the pipeline creates goes through [`ThreadRegistry::spawn`].
//! The registry names the thread, re-enters the caller's tracing span inside
//! it, and keeps spawned/live/peak counts for the rebuild summary.
//!
//! With a slot limit the registry also acts as an admission gate: at most
//! `limit` threads run their body at once, and parked threads are admitted
//! strictly in spawn order (the ticket is taken on the spawning thread).
//! This reproduces what an overloaded scheduler does to nested pools: a
//! thread that is needed for progress can sit behind threads that are not.

use crate::error::{RebuildError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Counters reported in the rebuild summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub spawned: usize,
    pub live: usize,
    pub peak_live: usize,
    pub running: usize,
    pub peak_running: usize,
}

struct Admission {
    next_ticket: u64,
    serving: u64,
    abandoned: BTreeSet<u64>,
    running: usize,
    peak_running: usize,
    shutdown: bool,
}

impl Admission {
    fn advance(&mut self) {
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

struct RegistryInner {
    limit: Option<usize>,
    admission: Mutex<Admission>,
    cond: Condvar,
    spawned: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

impl RegistryInner {
    /// Block until `ticket` may run. Returns false if the registry shut down first.
    fn admit(&self, ticket: u64) -> bool {
        let mut st = self.admission.lock();
        loop {
            if st.shutdown {
                return false;
            }
            let has_slot = self.limit.map_or(true, |l| st.running < l);
            let is_next = self.limit.is_none() || st.serving == ticket;
            if has_slot && is_next {
                if self.limit.is_some() {
                    st.serving += 1;
                    st.advance();
                }
                st.running += 1;
                st.peak_running = st.peak_running.max(st.running);
                self.cond.notify_all();
                return true;
            }
            self.cond.wait(&mut st);
        }
    }

    fn release(&self) {
        let mut st = self.admission.lock();
        st.running -= 1;
        self.cond.notify_all();
    }

    fn abandon(&self, ticket: u64) {
        let mut st = self.admission.lock();
        st.abandoned.insert(ticket);
        st.advance();
        self.cond.notify_all();
    }
}

struct LiveGuard(Arc<RegistryInner>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SlotGuard(Arc<RegistryInner>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Spawns and accounts for every pipeline thread of one rebuild.
#[derive(Clone)]
pub struct ThreadRegistry {
    inner: Arc<RegistryInner>,
}

impl ThreadRegistry {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                limit,
                admission: Mutex::new(Admission {
                    next_ticket: 0,
                    serving: 0,
                    abandoned: BTreeSet::new(),
                    running: 0,
                    peak_running: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                spawned: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                peak_live: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.limit
    }

    /// Spawn a named thread that runs `f` once admitted.
    pub fn spawn<F>(&self, name: String, f: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let ticket = {
            let mut st = self.inner.admission.lock();
            let t = st.next_ticket;
            st.next_ticket += 1;
            t
        };
        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_live.fetch_max(live, Ordering::SeqCst);

        let parent = tracing::Span::current();
        let inner = Arc::clone(&self.inner);
        let live_guard = LiveGuard(Arc::clone(&self.inner));
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let _live = live_guard;
            if !inner.admit(ticket) {
                return;
            }
            let _slot = SlotGuard(inner);
            let _entered = parent.enter();
            f();
        });

        match spawned {
            Ok(handle) => Ok(handle),
            Err(source) => {
                // The closure (and its LiveGuard) was dropped by the failed spawn.
                self.inner.abandon(ticket);
                Err(RebuildError::ThreadSpawn { name, source })
            }
        }
    }

    /// Release every thread still waiting for admission; they exit without running.
    pub fn shutdown(&self) {
        let mut st = self.inner.admission.lock();
        st.shutdown = true;
        self.inner.cond.notify_all();
    }

    pub fn stats(&self) -> ThreadStats {
        let st = self.inner.admission.lock();
        ThreadStats {
            spawned: self.inner.spawned.load(Ordering::SeqCst),
            live: self.inner.live.load(Ordering::SeqCst),
            peak_live: self.inner.peak_live.load(Ordering::SeqCst),
            running: st.running,
            peak_running: st.peak_running,
        }
    }
}

/// Sends one exit notice when dropped, whether the body ran, returned or panicked.
struct ExitNotice(Sender<()>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// A set of threads joined together with a bounded wait.
pub struct WorkerGroup {
    name: String,
    handles: Vec<JoinHandle<()>>,
    exit_tx: Sender<()>,
    exit_rx: Receiver<()>,
    exited: usize,
}

impl WorkerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            handles: Vec::new(),
            exit_tx,
            exit_rx,
            exited: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn spawn<F>(&mut self, registry: &ThreadRegistry, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let notice = ExitNotice(self.exit_tx.clone());
        let thread_name = format!("{}-{}", self.name, self.handles.len());
        let handle = registry.spawn(thread_name, move || {
            let _notice = notice;
            f();
        })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Wait up to `timeout` for every worker to exit, then reap them.
    pub fn join(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        while self.exited < self.handles.len() {
            match self.exit_rx.recv_deadline(deadline) {
                Ok(()) => self.exited += 1,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RebuildError::RebuildTimeout {
                        component: self.name.clone(),
                        last_progress: format!(
                            "{} of {} workers exited",
                            self.exited,
                            self.handles.len()
                        ),
                        waited: started.elapsed(),
                    });
                }
                // The group holds a sender itself, so this cannot happen while it lives.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut panicked = None;
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                panicked.get_or_insert(detail);
            }
        }
        self.exited = 0;
        match panicked {
            Some(detail) => Err(RebuildError::WorkerPanicked {
                component: self.name.clone(),
                detail,
            }),
            None => Ok(()),
        }
    }
}
