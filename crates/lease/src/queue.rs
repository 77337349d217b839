//! Lease-based work queue over a [`DocumentStore`].
//!
//! Workers claim jobs with a time-limited lease. A job whose lease lapses
//! without being completed becomes claimable again, either directly by the
//! next `claim_next` or in bulk through `reclaim_expired`.
//!
//! Every time comparison is expressed as a [`TimeRef`] and resolved by the
//! store, so workers with skewed clocks still agree on lease expiry.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use docq_core::{JobDocument, JobId, JobState, NewJob, Payload};
use docq_infra::{DocumentStore, Filter, PostgresDocumentStore, SortOrder, TimeRef, Update};

use crate::config::{ConfigError, QueueConfig};
use crate::error::QueueResult;
use crate::handle::ClaimedJob;

/// Lease queue bound to one collection of a document store.
///
/// Cheap operations, no internal state beyond configuration: share it
/// across worker threads behind an `Arc`.
#[derive(Debug)]
pub struct LeaseQueue<S> {
    store: S,
    config: QueueConfig,
}

impl LeaseQueue<PostgresDocumentStore> {
    /// Connect to `config.database_url` with the configured write concern
    /// and create the job table if it does not exist yet.
    pub fn connect(config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let url = config.database_url.as_deref().ok_or_else(|| ConfigError {
            key: "database_url",
            message: "required to connect to Postgres".to_string(),
        })?;

        let store = PostgresDocumentStore::connect(url, config.write_concern)?;
        store.ensure_collection(&config.table)?;
        info!(table = %config.table, write_concern = %config.write_concern, "lease queue connected");
        Self::new(store, config)
    }
}

impl<S: DocumentStore> LeaseQueue<S> {
    /// Wrap `store`. A durable store must commit with the configured write
    /// concern; a mismatch is a configuration error.
    pub fn new(store: S, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        if let Some(durability) = store.durability() {
            if durability != config.write_concern {
                return Err(ConfigError {
                    key: "write_concern",
                    message: format!(
                        "store commits with '{durability}' but the queue is configured for '{}'",
                        config.write_concern
                    ),
                }
                .into());
            }
        }
        Ok(Self { store, config })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn lease(&self) -> Duration {
        self.config.lease()
    }

    /// Queue name to operate on; `None` selects the configured default.
    pub fn resolve<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.config.default_queue)
    }

    /// Enqueue an immediately available job.
    pub fn push(&self, queue: Option<&str>, payload: impl Into<Payload>) -> QueueResult<JobId> {
        self.insert(NewJob::new(self.resolve(queue), payload))
    }

    /// Enqueue a job that becomes claimable after `delay`.
    pub fn later(
        &self,
        queue: Option<&str>,
        delay: Duration,
        payload: impl Into<Payload>,
    ) -> QueueResult<JobId> {
        self.insert(NewJob::new(self.resolve(queue), payload).with_delay(delay))
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, delay_ms = job.delay.as_millis() as u64), err)]
    fn insert(&self, job: NewJob) -> QueueResult<JobId> {
        let document = self.store.insert(&self.config.table, job)?;
        debug!(job_id = %document.id, sequence = document.sequence, "job enqueued");
        Ok(document.id)
    }

    /// Lease the oldest eligible job in `queue`.
    ///
    /// Eligible means unreserved and past its `available_at`, or reserved
    /// with a lapsed lease. Selection and reservation happen in one atomic
    /// store call, so two workers never receive the same lease. Returns
    /// `Ok(None)` when nothing is eligible.
    #[instrument(skip(self), fields(queue = self.resolve(queue)), err)]
    pub fn claim_next(&self, queue: Option<&str>) -> QueueResult<Option<ClaimedJob>> {
        let queue = self.resolve(queue);
        let update = Update::new().reserve(TimeRef::Now).inc_attempts(1);

        let claimed = self.store.find_and_update(
            &self.config.table,
            &self.eligible_filter(queue),
            &update,
            SortOrder::SequenceAscending,
        )?;

        match claimed {
            Some(document) => {
                let job = ClaimedJob::from_claim(document, self.lease())?;
                debug!(
                    job_id = %job.id(),
                    attempts = job.attempts(),
                    lease_expires_at = %job.lease_expires_at(),
                    "job claimed"
                );
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Delete a job. Completing a job that is already gone succeeds.
    ///
    /// Deletion is keyed by id alone: a worker whose lease lapsed and whose
    /// job was re-claimed elsewhere still removes it.
    #[instrument(skip(self), fields(queue = self.resolve(queue), job_id = %id), err)]
    pub fn complete(&self, queue: Option<&str>, id: JobId) -> QueueResult<()> {
        let removed = self.store.delete_by_id(&self.config.table, id)?;
        if removed {
            debug!("job completed");
        } else {
            debug!("job already removed");
        }
        Ok(())
    }

    /// Give a lease back before it expires.
    ///
    /// The job becomes claimable again after `delay`. Returns `false` if the
    /// caller no longer holds this lease: the job was reclaimed, claimed by
    /// another worker, or deleted.
    #[instrument(skip(self, job), fields(queue = job.queue(), job_id = %job.id()), err)]
    pub fn release(&self, job: &ClaimedJob, delay: Duration) -> QueueResult<bool> {
        let filter = Filter::all([Filter::id(job.id()), Filter::ReservedAt(job.reserved_at())]);
        let update = Update::new()
            .clear_reservation()
            .available_at(TimeRef::NowPlus(delay));

        let released = self
            .store
            .find_and_update(&self.config.table, &filter, &update, SortOrder::default())?
            .is_some();

        if released {
            debug!(delay_ms = delay.as_millis() as u64, "job released");
        } else {
            debug!("lease no longer held; nothing released");
        }
        Ok(released)
    }

    /// Return every job with a lapsed lease in `queue` to the unreserved state.
    ///
    /// One scan, then one guarded update per job. A job re-claimed or
    /// completed between the scan and its update is skipped. A failing
    /// per-job update is logged and skipped; only a failing scan is an error.
    /// Returns the number of jobs released.
    #[instrument(skip(self), fields(queue = self.resolve(queue)), err)]
    pub fn reclaim_expired(&self, queue: Option<&str>) -> QueueResult<usize> {
        let queue = self.resolve(queue);
        let expired = self
            .store
            .find_many(&self.config.table, &self.expired_filter(queue))?;

        if expired.is_empty() {
            return Ok(0);
        }

        let update = Update::new().clear_reservation().inc_attempts(1);
        let mut released = 0usize;

        for document in &expired {
            let filter = Filter::all([
                Filter::id(document.id),
                Filter::ReservedAtOrBefore(TimeRef::NowMinus(self.lease())),
            ]);

            match self
                .store
                .find_and_update(&self.config.table, &filter, &update, SortOrder::default())
            {
                Ok(Some(_)) => released += 1,
                Ok(None) => {
                    debug!(job_id = %document.id, "job changed since scan; skipped");
                }
                Err(e) => {
                    warn!(job_id = %document.id, error = %e, "failed to release expired job");
                }
            }
        }

        info!(
            scanned = expired.len(),
            released,
            "expired leases reclaimed"
        );
        Ok(released)
    }

    /// Number of jobs in `queue`, in any state.
    #[instrument(skip(self), fields(queue = self.resolve(queue)), err)]
    pub fn size(&self, queue: Option<&str>) -> QueueResult<usize> {
        let queue = self.resolve(queue);
        Ok(self.store.count(&self.config.table, &Filter::queue(queue))?)
    }

    /// A job and its state as of the store's clock.
    #[instrument(skip(self), fields(queue = self.resolve(queue), job_id = %id), err)]
    pub fn inspect(
        &self,
        queue: Option<&str>,
        id: JobId,
    ) -> QueueResult<Option<(JobDocument, JobState)>> {
        let queue = self.resolve(queue);
        let filter = Filter::all([Filter::queue(queue), Filter::id(id)]);
        let Some(document) = self
            .store
            .find_many(&self.config.table, &filter)?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let now = self.store.server_time()?;
        let state = document.state(now, self.lease());
        Ok(Some((document, state)))
    }

    fn eligible_filter(&self, queue: &str) -> Filter {
        Filter::all([
            Filter::queue(queue),
            Filter::any([
                Filter::all([Filter::Unreserved, Filter::AvailableAtOrBefore(TimeRef::Now)]),
                Filter::ReservedAtOrBefore(TimeRef::NowMinus(self.lease())),
            ]),
        ])
    }

    fn expired_filter(&self, queue: &str) -> Filter {
        Filter::all([
            Filter::queue(queue),
            Filter::ReservedAtOrBefore(TimeRef::NowMinus(self.lease())),
        ])
    }
}
