use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use docq_core::{JobDocument, JobId, NewJob};

use super::collection::{CollectionName, WriteConcern};
use super::query::{Filter, SortOrder, Update};

/// Document store operation error.
///
/// These are **infrastructure errors**. "Nothing matched" and "already
/// deleted" are not errors; they are `None` / `false` results.
///
/// ## Error Categories
///
/// - **Transient** (`Unavailable`, `Timeout`, `WriteConcern`): the call may
///   succeed if retried; the caller owns the retry policy
/// - **Permanent** (`Decode`, `InvalidQuery`, `LockPoisoned`): retrying the
///   same call will not help
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),

    #[error("write concern not satisfied: {0}")]
    WriteConcern(String),

    #[error("failed to decode document: {0}")]
    Decode(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::WriteConcern(_)
        )
    }
}

/// Collection-oriented job document store.
///
/// The lease protocol needs exactly one strong guarantee from a backend:
/// `find_and_update` must select, mutate and return a document as a single
/// atomic step. Two concurrent calls with overlapping filters must never both
/// observe the same pre-update document. A backend that can only read and then
/// write separately must not implement this trait.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - resolve every [`TimeRef`](super::TimeRef) against the store's own clock,
///   the same clock `server_time` reports
/// - assign `id` and a strictly increasing per-collection `sequence` on insert
/// - treat deleting a missing id as success
/// - return `find_many` results in ascending `sequence` order
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; the store assigns id, sequence and timestamps.
    fn insert(&self, collection: &CollectionName, job: NewJob) -> Result<JobDocument, StoreError>;

    /// Atomically pick the first document matching `filter` in `sort` order,
    /// apply `update` to it, and return the updated document.
    fn find_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError>;

    /// All documents matching `filter`. No snapshot guarantee across the set.
    fn find_many(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError>;

    /// Number of documents matching `filter`, without loading them.
    fn count(&self, collection: &CollectionName, filter: &Filter) -> Result<usize, StoreError>;

    /// Remove a document by id. Returns whether a document was removed.
    fn delete_by_id(&self, collection: &CollectionName, id: JobId) -> Result<bool, StoreError>;

    /// The store's current time.
    fn server_time(&self) -> Result<DateTime<Utc>, StoreError>;

    /// Durability every mutation is committed with, for stores that have
    /// one. `None` means the store is not durable at all.
    fn durability(&self) -> Option<WriteConcern> {
        None
    }
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn insert(&self, collection: &CollectionName, job: NewJob) -> Result<JobDocument, StoreError> {
        (**self).insert(collection, job)
    }

    fn find_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError> {
        (**self).find_and_update(collection, filter, update, sort)
    }

    fn find_many(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError> {
        (**self).find_many(collection, filter)
    }

    fn count(&self, collection: &CollectionName, filter: &Filter) -> Result<usize, StoreError> {
        (**self).count(collection, filter)
    }

    fn delete_by_id(&self, collection: &CollectionName, id: JobId) -> Result<bool, StoreError> {
        (**self).delete_by_id(collection, id)
    }

    fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        (**self).server_time()
    }

    fn durability(&self) -> Option<WriteConcern> {
        (**self).durability()
    }
}
