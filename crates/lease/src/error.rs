//! Lease queue error model.

use thiserror::Error;

use docq_core::{DomainError, JobId};
use docq_infra::StoreError;

use crate::config::ConfigError;

/// Result type returned by queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Lease queue error.
///
/// An empty queue and completing an already-deleted job are *not* errors.
/// Store failures are surfaced as-is; the queue never retries on its own.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Domain(#[from] DomainError),

    /// The store broke its contract: a claimed document came back unleased.
    #[error("store returned claimed job {0} without a reservation")]
    UnreservedClaim(JobId),
}

impl QueueError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
