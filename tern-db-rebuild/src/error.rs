//! Error types for the rebuild pipeline

use std::io;
use std::time::Duration;
use tern_db_binary_index::BinaryIndexError;
use tern_db_core::PermutationId;
use thiserror::Error;

/// Rebuild errors
#[derive(Error, Debug)]
pub enum RebuildError {
    /// Merging the local vocabulary into the permanent one failed
    #[error("Vocabulary remap failed: {0}")]
    VocabRemap(String),

    /// Reading an old permutation failed
    #[error("Scan of {permutation} failed{}: {source}", block_suffix(.block))]
    ScanIo {
        permutation: PermutationId,
        block: Option<usize>,
        #[source]
        source: BinaryIndexError,
    },

    /// Writing a new permutation failed
    #[error("Write of {permutation} failed: {source}")]
    WriteIo {
        permutation: PermutationId,
        #[source]
        source: BinaryIndexError,
    },

    /// Output would not be strictly sorted
    #[error("Ordering violation in {permutation}: {detail}")]
    OrderingViolation {
        permutation: PermutationId,
        detail: String,
    },

    /// The operator-facing concurrency ceiling is below the safety floor
    #[error("Concurrency ceiling {ceiling} is below the minimum of {minimum}")]
    ConcurrencyBudgetExceeded { ceiling: usize, minimum: usize },

    /// A bounded wait expired: some required worker never made progress
    #[error("Rebuild stalled in {component} after {waited:?} (last progress: {last_progress})")]
    RebuildTimeout {
        component: String,
        last_progress: String,
        waited: Duration,
    },

    /// Stopped because another task failed first
    #[error("Rebuild cancelled")]
    Cancelled,

    /// A pipeline worker panicked
    #[error("Worker panicked in {component}: {detail}")]
    WorkerPanicked { component: String, detail: String },

    /// The OS refused to create a pipeline thread
    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The old index's manifest or block tables are unusable
    #[error("Index metadata error: {0}")]
    Metadata(#[source] BinaryIndexError),

    /// Writing the new generation's metadata or swapping in its manifest failed
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn block_suffix(block: &Option<usize>) -> String {
    match block {
        Some(b) => format!(" at block {}", b),
        None => String::new(),
    }
}

/// Coarse classification of a [`RebuildError`] for callers that report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    VocabRemapFailure,
    ScanIoFailure,
    WriteIoFailure,
    OrderingViolation,
    ConcurrencyBudgetExceeded,
    RebuildTimeout,
    Cancelled,
    Internal,
}

impl RebuildError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RebuildError::VocabRemap(_) => ErrorClass::VocabRemapFailure,
            RebuildError::ScanIo { .. } | RebuildError::Metadata(_) => ErrorClass::ScanIoFailure,
            RebuildError::WriteIo { .. } | RebuildError::Publish(_) => ErrorClass::WriteIoFailure,
            RebuildError::OrderingViolation { .. } => ErrorClass::OrderingViolation,
            RebuildError::ConcurrencyBudgetExceeded { .. } => {
                ErrorClass::ConcurrencyBudgetExceeded
            }
            RebuildError::RebuildTimeout { .. } => ErrorClass::RebuildTimeout,
            RebuildError::Cancelled => ErrorClass::Cancelled,
            RebuildError::WorkerPanicked { .. }
            | RebuildError::ThreadSpawn { .. }
            | RebuildError::InvalidConfig(_) => ErrorClass::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RebuildError::RebuildTimeout { .. })
    }

    pub(crate) fn scan(
        permutation: PermutationId,
        block: Option<usize>,
    ) -> impl FnOnce(BinaryIndexError) -> Self {
        move |source| RebuildError::ScanIo {
            permutation,
            block,
            source,
        }
    }

    pub(crate) fn write(permutation: PermutationId) -> impl FnOnce(BinaryIndexError) -> Self {
        move |source| match source {
            BinaryIndexError::OutOfOrder { permutation, detail } => {
                RebuildError::OrderingViolation { permutation, detail }
            }
            source => RebuildError::WriteIo {
                permutation,
                source,
            },
        }
    }
}

/// Result type for rebuild operations
pub type Result<T> = std::result::Result<T, RebuildError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_core::Permutation;

    #[test]
    fn test_out_of_order_append_is_ordering_violation() {
        let id = PermutationId::regular(Permutation::Spo);
        let err = RebuildError::write(id)(BinaryIndexError::OutOfOrder {
            permutation: id,
            detail: "x".into(),
        });
        assert_eq!(err.class(), ErrorClass::OrderingViolation);

        let err = RebuildError::write(id)(BinaryIndexError::Io(io::Error::other("disk full")));
        assert_eq!(err.class(), ErrorClass::WriteIoFailure);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_scan_message_names_block() {
        let id = PermutationId::internal(Permutation::Pos);
        let err = RebuildError::scan(id, Some(7))(BinaryIndexError::Decode("bad".into()));
        assert_eq!(err.to_string(), "Scan of pos.internal failed at block 7: decode error: bad");
        assert_eq!(err.class(), ErrorClass::ScanIoFailure);
    }

    #[test]
    fn test_timeout_class() {
        let err = RebuildError::RebuildTimeout {
            component: "scanner pso".into(),
            last_progress: "block 3".into(),
            waited: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert_eq!(err.class(), ErrorClass::RebuildTimeout);
    }
}
