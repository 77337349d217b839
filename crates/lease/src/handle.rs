//! Handle for a job the caller currently holds a lease on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use docq_core::state::lease_end;
use docq_core::{JobDocument, JobId, Payload};

use crate::error::{QueueError, QueueResult};

/// A job returned by a successful claim.
///
/// Holds the document exactly as the claim wrote it, so `attempts` and
/// `reserved_at` reflect this lease. The lease is identified by
/// `(id, reserved_at)`; [`LeaseQueue::release`](crate::LeaseQueue::release)
/// uses that pair to make sure it only gives back a lease the caller still
/// holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    document: JobDocument,
    reserved_at: DateTime<Utc>,
    lease: Duration,
}

impl ClaimedJob {
    pub(crate) fn from_claim(document: JobDocument, lease: Duration) -> Result<Self, QueueError> {
        let reserved_at = document
            .reserved_at
            .ok_or(QueueError::UnreservedClaim(document.id))?;
        Ok(Self {
            document,
            reserved_at,
            lease,
        })
    }

    pub fn id(&self) -> JobId {
        self.document.id
    }

    pub fn queue(&self) -> &str {
        &self.document.queue
    }

    pub fn payload(&self) -> &Payload {
        &self.document.payload
    }

    /// Decode a JSON payload; a malformed payload is `QueueError::Domain`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(self.document.payload.decode_json()?)
    }

    /// Claims so far, including this one.
    pub fn attempts(&self) -> u32 {
        self.document.attempts
    }

    /// When this lease was granted (store clock).
    pub fn reserved_at(&self) -> DateTime<Utc> {
        self.reserved_at
    }

    /// When this lease lapses and the job becomes claimable by others.
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        lease_end(self.reserved_at, self.lease)
    }

    pub fn document(&self) -> &JobDocument {
        &self.document
    }

    pub fn into_document(self) -> JobDocument {
        self.document
    }
}
