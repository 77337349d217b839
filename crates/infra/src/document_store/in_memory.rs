use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::trace;

use docq_core::state::delayed_until;
use docq_core::{JobDocument, JobId, NewJob};

use crate::clock::{Clock, SystemClock};

use super::collection::CollectionName;
use super::query::{Filter, SortOrder, Update};
use super::r#trait::{DocumentStore, StoreError};

#[derive(Debug, Default)]
struct Collection {
    last_sequence: u64,
    documents: HashMap<JobId, JobDocument>,
}

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance: selections scan
/// the whole collection. Every mutation runs under one write lock, which is
/// what makes `find_and_update` atomic.
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<CollectionName, Collection>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("collections", &"<RwLock<HashMap<CollectionName, Collection>>>")
            .field("clock", &"<dyn Clock>")
            .finish()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    /// Store driven by the host's wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose "server time" comes from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert(&self, collection: &CollectionName, job: NewJob) -> Result<JobDocument, StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = self.clock.now();

        let coll = collections.entry(collection.clone()).or_default();
        coll.last_sequence += 1;

        let doc = JobDocument {
            id: JobId::new(),
            sequence: coll.last_sequence,
            queue: job.queue,
            payload: job.payload,
            attempts: 0,
            reserved_at: None,
            available_at: delayed_until(now, job.delay),
            created_at: now,
        };
        coll.documents.insert(doc.id, doc.clone());

        trace!(collection = %collection, job_id = %doc.id, sequence = doc.sequence, "inserted");
        Ok(doc)
    }

    fn find_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = self.clock.now();

        let Some(coll) = collections.get_mut(collection) else {
            return Ok(None);
        };

        let selected = coll
            .documents
            .values_mut()
            .filter(|doc| filter.matches(doc, now))
            .min_by(|a, b| sort.compare(a, b));

        Ok(selected.map(|doc| {
            update.apply(doc, now);
            doc.clone()
        }))
    }

    fn find_many(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = self.clock.now();

        let mut found: Vec<_> = collections
            .get(collection)
            .map(|coll| {
                coll.documents
                    .values()
                    .filter(|doc| filter.matches(doc, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        found.sort_by(|a, b| SortOrder::SequenceAscending.compare(a, b));
        Ok(found)
    }

    fn count(&self, collection: &CollectionName, filter: &Filter) -> Result<usize, StoreError> {
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        let now = self.clock.now();

        Ok(collections
            .get(collection)
            .map(|coll| {
                coll.documents
                    .values()
                    .filter(|doc| filter.matches(doc, now))
                    .count()
            })
            .unwrap_or(0))
    }

    fn delete_by_id(&self, collection: &CollectionName, id: JobId) -> Result<bool, StoreError> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        Ok(collections
            .get_mut(collection)
            .and_then(|coll| coll.documents.remove(&id))
            .is_some())
    }

    fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.clock.now())
    }
}
