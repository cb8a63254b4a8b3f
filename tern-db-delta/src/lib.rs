//! Delta-triple overlay for tern-db
//!
//! This crate holds updates (inserts and deletes) that have been accepted
//! but not yet materialized into the on-disk permutations. Queries merge
//! the overlay in front of the base index; a rebuild folds it into new
//! permutation files and then clears it.
//!
//! # Design
//!
//! - **Set semantics**: a quad is either pending-inserted, pending-deleted
//!   or absent. Inserting removes a pending delete and vice versa.
//! - **Scoped**: edits carry a [`TripleScope`]; internal statements are
//!   tracked separately from regular ones.
//! - **Local vocabulary**: words unknown to the permanent vocabulary get
//!   `TermId::local` ids until a rebuild remaps them.
//! - **Epochs**: the epoch bumps once per applied batch, so a rebuild can
//!   tell whether the overlay changed after it took its snapshot.
//! - **Retiring**: after a rebuild only the snapshot's edits leave the
//!   overlay. Edits applied since stay pending, with the local words the
//!   rebuild made permanent rewritten to their permanent ids.
//!
//! # Example
//!
//! ```ignore
//! let overlay = DeltaTriplesManager::new();
//! overlay.modify(|d| {
//!     let c = d.local_vocab_mut().get_or_insert("<c>");
//!     d.insert(Quad::triple(a, p, c), TripleScope::Regular);
//! });
//! let snap = overlay.snapshot();
//! // ... rebuild from `snap` ...
//! overlay.retire_snapshot(&snap, &permanent_ids_of_local_words);
//! ```

mod local_vocab;

pub use local_vocab::LocalVocab;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::Arc;
use tern_db_core::{Quad, TermId, TripleScope};

/// Kind of a pending edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EditOp {
    Insert,
    Delete,
}

/// One pending edit. Terms may still be overlay-local ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeltaEdit {
    pub quad: Quad,
    pub scope: TripleScope,
    pub op: EditOp,
}

impl DeltaEdit {
    pub fn insert(quad: Quad, scope: TripleScope) -> Self {
        Self {
            quad,
            scope,
            op: EditOp::Insert,
        }
    }

    pub fn delete(quad: Quad, scope: TripleScope) -> Self {
        Self {
            quad,
            scope,
            op: EditOp::Delete,
        }
    }
}

/// Number of pending inserts and deletes, across both scopes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverlayCounts {
    pub inserted: u64,
    pub deleted: u64,
}

impl OverlayCounts {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.deleted == 0
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.deleted
    }
}

/// Mutable overlay state. Always accessed through [`DeltaTriplesManager`].
#[derive(Default)]
pub struct DeltaTriples {
    inserted: FxHashSet<(TripleScope, Quad)>,
    deleted: FxHashSet<(TripleScope, Quad)>,
    local_vocab: LocalVocab,
    epoch: u64,
}

impl DeltaTriples {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn local_vocab(&self) -> &LocalVocab {
        &self.local_vocab
    }

    pub fn local_vocab_mut(&mut self) -> &mut LocalVocab {
        &mut self.local_vocab
    }

    pub fn counts(&self) -> OverlayCounts {
        OverlayCounts {
            inserted: self.inserted.len() as u64,
            deleted: self.deleted.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().is_empty()
    }

    fn apply_one(&mut self, edit: DeltaEdit) {
        let key = (edit.scope, edit.quad);
        match edit.op {
            EditOp::Insert => {
                self.deleted.remove(&key);
                self.inserted.insert(key);
            }
            EditOp::Delete => {
                self.inserted.remove(&key);
                self.deleted.insert(key);
            }
        }
    }

    /// Apply a batch of edits in order. The epoch bumps once per non-empty batch.
    pub fn apply(&mut self, edits: impl IntoIterator<Item = DeltaEdit>) -> usize {
        let mut n = 0;
        for edit in edits {
            self.apply_one(edit);
            n += 1;
        }
        if n > 0 {
            self.epoch += 1;
        }
        n
    }

    pub fn insert(&mut self, quad: Quad, scope: TripleScope) {
        self.apply([DeltaEdit::insert(quad, scope)]);
    }

    pub fn delete(&mut self, quad: Quad, scope: TripleScope) {
        self.apply([DeltaEdit::delete(quad, scope)]);
    }

    /// All pending edits in a deterministic order.
    pub fn edits(&self) -> Vec<DeltaEdit> {
        let mut out: Vec<DeltaEdit> = self
            .inserted
            .iter()
            .map(|&(scope, quad)| DeltaEdit::insert(quad, scope))
            .chain(
                self.deleted
                    .iter()
                    .map(|&(scope, quad)| DeltaEdit::delete(quad, scope)),
            )
            .collect();
        out.sort_unstable();
        out
    }

    /// Drop every edit folded in from `snapshot`; returns how many were dropped.
    ///
    /// An edit leaves only if its current op still equals the snapshot's.
    /// `permanent[i]` is the permanent id the rebuild gave snapshot word `i`.
    /// Local words added after the snapshot are renumbered from zero.
    pub fn retire(&mut self, snapshot: &DeltaSnapshot, permanent: &[TermId]) -> usize {
        if self.epoch == snapshot.epoch {
            let n = self.counts().total() as usize;
            self.clear();
            return n;
        }

        let mut retired = 0;
        for edit in &snapshot.edits {
            let key = (edit.scope, edit.quad);
            let set = match edit.op {
                EditOp::Insert => &mut self.inserted,
                EditOp::Delete => &mut self.deleted,
            };
            if set.remove(&key) {
                retired += 1;
            }
        }

        let known = snapshot.local_words.len();
        let remap = |t: TermId| -> TermId {
            if !t.is_local() {
                return t;
            }
            let i = t.index() as usize;
            if i < known {
                permanent.get(i).copied().unwrap_or(t)
            } else {
                TermId::local((i - known) as u64)
            }
        };
        let remap_quad = |q: Quad| Quad::new(remap(q.s), remap(q.p), remap(q.o), remap(q.g));

        let mut local_vocab = LocalVocab::new();
        for word in self.local_vocab.words().iter().skip(known) {
            local_vocab.get_or_insert(word);
        }
        self.local_vocab = local_vocab;

        // Deletes first, so an insert that collapses onto the same quad wins.
        let deleted = std::mem::take(&mut self.deleted);
        let inserted = std::mem::take(&mut self.inserted);
        for (scope, quad) in deleted {
            self.apply_one(DeltaEdit::delete(remap_quad(quad), scope));
        }
        for (scope, quad) in inserted {
            self.apply_one(DeltaEdit::insert(remap_quad(quad), scope));
        }
        self.epoch += 1;
        retired
    }

    pub fn clear(&mut self) {
        self.inserted.clear();
        self.deleted.clear();
        self.local_vocab = LocalVocab::new();
        self.epoch += 1;
    }
}

impl fmt::Debug for DeltaTriples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaTriples")
            .field("inserted", &self.inserted.len())
            .field("deleted", &self.deleted.len())
            .field("local_words", &self.local_vocab.len())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Immutable copy of the overlay taken at one point in time.
#[derive(Clone, Debug)]
pub struct DeltaSnapshot {
    pub epoch: u64,
    pub counts: OverlayCounts,
    pub local_words: Vec<String>,
    pub edits: Vec<DeltaEdit>,
}

/// Shared handle to the overlay: many readers, rare writer.
#[derive(Debug, Default)]
pub struct DeltaTriplesManager {
    inner: RwLock<DeltaTriples>,
}

impl DeltaTriplesManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_delta(delta: DeltaTriples) -> Self {
        Self {
            inner: RwLock::new(delta),
        }
    }

    /// Run `f` under the write lock.
    pub fn modify<R>(&self, f: impl FnOnce(&mut DeltaTriples) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    pub fn counts(&self) -> OverlayCounts {
        self.inner.read().counts()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch()
    }

    /// Copy counts, local vocabulary and edits under a single read lock.
    pub fn snapshot(&self) -> Arc<DeltaSnapshot> {
        let guard = self.inner.read();
        Arc::new(DeltaSnapshot {
            epoch: guard.epoch,
            counts: guard.counts(),
            local_words: guard.local_vocab.words().to_vec(),
            edits: guard.edits(),
        })
    }

    /// Retire the edits a published rebuild folded in from `snapshot`.
    ///
    /// Edits applied after the snapshot stay pending and are folded in by
    /// the next rebuild. See [`DeltaTriples::retire`].
    pub fn retire_snapshot(&self, snapshot: &DeltaSnapshot, permanent: &[TermId]) -> usize {
        let mut guard = self.inner.write();
        let changed = guard.epoch != snapshot.epoch;
        let retired = guard.retire(snapshot, permanent);
        tracing::debug!(
            snapshot_epoch = snapshot.epoch,
            epoch = guard.epoch,
            retired,
            kept = guard.counts().total(),
            changed,
            "overlay retired through snapshot"
        );
        retired
    }
}
