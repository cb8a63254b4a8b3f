//! Scoped suppression of diagnostic output.
//!
//! Instead of redirecting a process-wide stream, the closure runs with a
//! thread-local no-op subscriber. Other threads keep logging, and the
//! previous subscriber is restored on every exit path, including panics.

use tracing::subscriber::NoSubscriber;

/// Run `f` with all tracing output from this thread discarded.
pub fn with_suppressed_diagnostics<T>(f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(NoSubscriber::default(), f)
}
