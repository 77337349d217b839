//! Persisted job document shape.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::state::{self, JobState};

/// Opaque job body.
///
/// The queue never looks inside; encoding is the producer's and the worker's
/// business. The JSON helpers exist for callers that happen to use JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialize `value` as JSON into a payload.
    pub fn json<T: Serialize>(value: &T) -> DomainResult<Self> {
        serde_json::to_vec(value)
            .map(Self)
            .map_err(|e| DomainError::payload(format!("json encode failed: {e}")))
    }

    /// Decode a payload previously produced by [`Payload::json`].
    pub fn decode_json<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_slice(&self.0)
            .map_err(|e| DomainError::payload(format!("json decode failed: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Insert request for a new job.
///
/// The store assigns `id`, `sequence` and all timestamps from its own clock;
/// `available_at` becomes `created_at + delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue: String,
    pub payload: Payload,
    pub delay: Duration,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One unit of work as persisted by the document store.
///
/// There is no status field: whether a job is available, leased or expired is
/// derived from `reserved_at`, `available_at` and the caller's lease duration
/// (see [`JobState::derive`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDocument {
    pub id: JobId,

    /// Insertion position within the collection (strictly increasing).
    pub sequence: u64,

    pub queue: String,
    pub payload: Payload,

    /// Number of claims (and expiry releases) this job has seen.
    pub attempts: u32,

    /// Lease start; `None` while the job is not leased.
    pub reserved_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobDocument {
    /// Effective state at `now` for a lease of length `lease`.
    pub fn state(&self, now: DateTime<Utc>, lease: Duration) -> JobState {
        JobState::derive(self.reserved_at, self.available_at, now, lease)
    }

    /// Instant at which the current lease lapses, if the job is leased.
    pub fn lease_expires_at(&self, lease: Duration) -> Option<DateTime<Utc>> {
        self.reserved_at.map(|at| state::lease_end(at, lease))
    }
}
