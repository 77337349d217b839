//! End-to-end lease scenarios against the in-memory document store.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use proptest::prelude::*;

use docq_core::{JobDocument, JobId, JobState, NewJob};
use docq_infra::{
    CollectionName, DocumentStore, Filter, InMemoryDocumentStore, ManualClock, Reservation,
    SortOrder, StoreError, TimeRef, Update,
};
use docq_lease::{LeaseQueue, QueueConfig, QueueError};

const LEASE: Duration = Duration::from_secs(60);

fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn lease_queue() -> (LeaseQueue<Arc<InMemoryDocumentStore>>, Arc<ManualClock>) {
    docq_observability::init();
    let clock = ManualClock::arc(start_time());
    let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
    let config = QueueConfig::default()
        .with_default_queue("default")
        .with_lease(LEASE);
    (LeaseQueue::new(store, config).unwrap(), clock)
}

#[test]
fn concurrent_claims_grant_a_single_lease() {
    let (queue, _) = lease_queue();
    let queue = Arc::new(queue);
    let id = queue.push(None, "only").unwrap();

    let workers = 16;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue.claim_next(None).unwrap()
            })
        })
        .collect();

    let winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id(), id);
    assert_eq!(winners[0].attempts(), 1);
}

#[test]
fn concurrent_workers_drain_without_duplicates() {
    let (queue, _) = lease_queue();
    let queue = Arc::new(queue);
    let jobs: HashSet<_> = (0..200)
        .map(|i| queue.push(None, format!("job-{i}").as_str()).unwrap())
        .collect();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(job) = queue.claim_next(None).unwrap() {
                    seen.push(job.id());
                    queue.complete(None, job.id()).unwrap();
                }
                seen
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.join().unwrap());
    }

    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), jobs.len());
    assert_eq!(unique, jobs);
    assert_eq!(queue.size(None).unwrap(), 0);
}

proptest! {
    #[test]
    fn sequential_claims_follow_insertion_order(count in 1usize..40) {
        let (queue, clock) = lease_queue();
        let mut pushed = Vec::with_capacity(count);
        for i in 0..count {
            pushed.push(queue.push(None, format!("{i}").as_str()).unwrap());
            // Same-instant inserts must still keep their order.
            if i % 3 == 0 {
                clock.advance(Duration::from_millis(1));
            }
        }

        let mut claimed = Vec::with_capacity(count);
        while let Some(job) = queue.claim_next(None).unwrap() {
            claimed.push(job.id());
        }

        prop_assert_eq!(claimed, pushed);
    }
}

#[test]
fn expired_lease_is_claimable_again_with_attempt_counted() {
    let (queue, clock) = lease_queue();
    let id = queue.push(None, "work").unwrap();

    let first = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(first.reserved_at(), start_time());

    clock.advance(LEASE - Duration::from_secs(1));
    assert!(queue.claim_next(None).unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let second = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.attempts(), 2);
    assert_eq!(second.reserved_at(), start_time() + TimeDelta::seconds(60));
}

#[test]
fn worker_a_then_b_then_a_after_lease_lapses() {
    let (queue, clock) = lease_queue();
    let first = queue.push(None, "A").unwrap();
    let second = queue.push(None, "B").unwrap();

    let a = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(a.id(), first);
    assert_eq!(a.payload().as_bytes(), b"A");

    let b = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(b.id(), second);

    assert!(queue.claim_next(None).unwrap().is_none());

    clock.advance(Duration::from_secs(61));
    queue.complete(None, b.id()).unwrap();

    let a_again = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(a_again.id(), first);
    assert_eq!(a_again.attempts(), 2);
}

#[test]
fn completing_twice_succeeds() {
    let (queue, _) = lease_queue();
    let id = queue.push(None, "x").unwrap();
    let job = queue.claim_next(None).unwrap().unwrap();

    queue.complete(None, job.id()).unwrap();
    queue.complete(None, id).unwrap();

    assert!(queue.inspect(None, id).unwrap().is_none());
    assert!(queue.claim_next(None).unwrap().is_none());
}

#[test]
fn stale_worker_completion_removes_reclaimed_job() {
    let (queue, clock) = lease_queue();
    queue.push(None, "x").unwrap();

    let stale = queue.claim_next(None).unwrap().unwrap();
    clock.advance(LEASE);
    let fresh = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(stale.id(), fresh.id());

    queue.complete(None, stale.id()).unwrap();
    assert_eq!(queue.size(None).unwrap(), 0);
}

#[test]
fn delayed_job_is_invisible_until_due() {
    let (queue, clock) = lease_queue();
    let id = queue
        .later(None, Duration::from_secs(30), "later")
        .unwrap();

    assert!(queue.claim_next(None).unwrap().is_none());
    let (_, state) = queue.inspect(None, id).unwrap().unwrap();
    assert_eq!(state, JobState::Delayed);

    clock.advance(Duration::from_secs(29));
    assert!(queue.claim_next(None).unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let job = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(job.id(), id);
}

#[test]
fn delayed_job_does_not_block_later_ready_jobs() {
    let (queue, _) = lease_queue();
    queue.later(None, Duration::from_secs(300), "slow").unwrap();
    let ready = queue.push(None, "ready").unwrap();

    assert_eq!(queue.claim_next(None).unwrap().unwrap().id(), ready);
}

#[test]
fn reclaim_releases_only_lapsed_leases() {
    let (queue, clock) = lease_queue();
    let id = queue.push(None, "x").unwrap();
    queue.claim_next(None).unwrap().unwrap();

    assert_eq!(queue.reclaim_expired(None).unwrap(), 0);

    clock.advance(LEASE + Duration::from_secs(1));
    assert_eq!(queue.reclaim_expired(None).unwrap(), 1);

    let (doc, state) = queue.inspect(None, id).unwrap().unwrap();
    assert_eq!(doc.reserved_at, None);
    assert_eq!(doc.attempts, 2);
    assert_eq!(state, JobState::Available);

    assert_eq!(queue.reclaim_expired(None).unwrap(), 0);

    let job = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(job.attempts(), 3);
}

#[test]
fn reclaim_ignores_other_queues_and_live_leases() {
    let (queue, clock) = lease_queue();
    queue.push(Some("mail"), "m").unwrap();
    queue.push(None, "old").unwrap();

    queue.claim_next(Some("mail")).unwrap().unwrap();
    queue.claim_next(None).unwrap().unwrap();
    clock.advance(LEASE / 2);

    queue.push(None, "new").unwrap();
    queue.claim_next(None).unwrap().unwrap();
    clock.advance(LEASE / 2);

    assert_eq!(queue.reclaim_expired(None).unwrap(), 1);
    assert_eq!(queue.reclaim_expired(Some("mail")).unwrap(), 1);
}

#[test]
fn release_returns_job_after_delay() {
    let (queue, clock) = lease_queue();
    let id = queue.push(None, "x").unwrap();
    let job = queue.claim_next(None).unwrap().unwrap();

    assert!(queue.release(&job, Duration::from_secs(10)).unwrap());
    let (doc, state) = queue.inspect(None, id).unwrap().unwrap();
    assert_eq!(state, JobState::Delayed);
    assert_eq!(doc.attempts, 1);

    assert!(queue.claim_next(None).unwrap().is_none());
    clock.advance(Duration::from_secs(10));
    assert_eq!(queue.claim_next(None).unwrap().unwrap().id(), id);
}

#[test]
fn release_with_stale_handle_is_refused() {
    let (queue, clock) = lease_queue();
    queue.push(None, "x").unwrap();

    let stale = queue.claim_next(None).unwrap().unwrap();
    clock.advance(LEASE);
    let current = queue.claim_next(None).unwrap().unwrap();

    assert!(!queue.release(&stale, Duration::ZERO).unwrap());
    let (_, state) = queue.inspect(None, current.id()).unwrap().unwrap();
    assert_eq!(state, JobState::Reserved);

    assert!(queue.release(&current, Duration::ZERO).unwrap());
    assert!(!queue.release(&current, Duration::ZERO).unwrap());

    queue.complete(None, current.id()).unwrap();
    let again = queue.claim_next(None);
    assert!(again.unwrap().is_none());
}

#[test]
fn size_counts_every_state() {
    let (queue, _) = lease_queue();
    assert_eq!(queue.size(None).unwrap(), 0);

    queue.push(None, "a").unwrap();
    queue.push(None, "b").unwrap();
    queue.later(None, Duration::from_secs(60), "c").unwrap();
    queue.push(Some("other"), "d").unwrap();
    queue.claim_next(None).unwrap().unwrap();

    assert_eq!(queue.size(None).unwrap(), 3);
    assert_eq!(queue.size(Some("other")).unwrap(), 1);
}

#[test]
fn json_payloads_survive_the_queue() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct SendEmail {
        to: String,
        retries: u8,
    }

    let (queue, _) = lease_queue();
    let message = SendEmail {
        to: "ops@example.com".to_string(),
        retries: 3,
    };
    queue
        .push(None, docq_core::Payload::json(&message).unwrap())
        .unwrap();

    let job = queue.claim_next(None).unwrap().unwrap();
    assert_eq!(job.decode_payload::<SendEmail>().unwrap(), message);
}

#[test]
fn config_from_environment_lookup_drives_the_queue() {
    let config = QueueConfig::from_lookup(|key| match key {
        "DOCQ_QUEUE" => Some("reports".to_string()),
        "DOCQ_LEASE_SECS" => Some("5".to_string()),
        _ => None,
    })
    .unwrap();

    let clock = ManualClock::arc(start_time());
    let store = InMemoryDocumentStore::with_clock(clock.clone());
    let queue = LeaseQueue::new(store, config).unwrap();

    queue.push(None, "r").unwrap();
    assert_eq!(queue.size(Some("reports")).unwrap(), 1);

    queue.claim_next(None).unwrap().unwrap();
    clock.advance(Duration::from_secs(5));
    assert_eq!(queue.claim_next(None).unwrap().unwrap().attempts(), 2);
}

/// What happens to the next expiry release a sweep attempts.
#[derive(Debug, Clone, Copy)]
enum Interference {
    /// Let it through.
    Pass,
    /// Another worker claims the job just before the release runs.
    ClaimFirst,
    /// The store fails the release.
    Fail,
}

/// Store that interferes with `reclaim_expired`'s per-job releases in a
/// scripted order. Scans and every other call pass straight through.
struct InterferingStore {
    inner: Arc<InMemoryDocumentStore>,
    script: Mutex<VecDeque<Interference>>,
}

impl InterferingStore {
    fn new(inner: Arc<InMemoryDocumentStore>, script: &[Interference]) -> Self {
        Self {
            inner,
            script: Mutex::new(script.iter().copied().collect()),
        }
    }

    fn released_job(filter: &Filter, update: &Update) -> Option<JobId> {
        let is_expiry_release =
            update.reserved_at == Some(Reservation::Clear) && update.inc_attempts == 1;
        match filter {
            Filter::And(children) if is_expiry_release => match children.first() {
                Some(Filter::Id(id)) => Some(*id),
                _ => None,
            },
            _ => None,
        }
    }
}

impl DocumentStore for InterferingStore {
    fn insert(&self, collection: &CollectionName, job: NewJob) -> Result<JobDocument, StoreError> {
        self.inner.insert(collection, job)
    }

    fn find_and_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        update: &Update,
        sort: SortOrder,
    ) -> Result<Option<JobDocument>, StoreError> {
        if let Some(id) = Self::released_job(filter, update) {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Interference::Pass);
            match step {
                Interference::Pass => {}
                Interference::ClaimFirst => {
                    let claim = Update::new().reserve(TimeRef::Now).inc_attempts(1);
                    self.inner
                        .find_and_update(collection, &Filter::id(id), &claim, sort)
                        .unwrap()
                        .unwrap();
                }
                Interference::Fail => {
                    return Err(StoreError::Timeout(format!("release of {id}")));
                }
            }
        }
        self.inner.find_and_update(collection, filter, update, sort)
    }

    fn find_many(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> Result<Vec<JobDocument>, StoreError> {
        self.inner.find_many(collection, filter)
    }

    fn count(&self, collection: &CollectionName, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.count(collection, filter)
    }

    fn delete_by_id(&self, collection: &CollectionName, id: JobId) -> Result<bool, StoreError> {
        self.inner.delete_by_id(collection, id)
    }

    fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        self.inner.server_time()
    }
}

#[test]
fn reclaim_skips_reclaimed_jobs_and_survives_failed_releases() {
    docq_observability::init();
    let clock = ManualClock::arc(start_time());
    let inner = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
    let store = InterferingStore::new(
        Arc::clone(&inner),
        &[
            Interference::ClaimFirst,
            Interference::Fail,
            Interference::Pass,
        ],
    );
    let config = QueueConfig::default().with_lease(LEASE);
    let queue = LeaseQueue::new(store, config).unwrap();

    let raced = queue.push(None, "raced").unwrap();
    let failed = queue.push(None, "failed").unwrap();
    let freed = queue.push(None, "freed").unwrap();
    for _ in 0..3 {
        queue.claim_next(None).unwrap().unwrap();
    }
    clock.advance(LEASE);

    assert_eq!(queue.reclaim_expired(None).unwrap(), 1);

    // Claimed by another worker between scan and release: left leased.
    let (doc, state) = queue.inspect(None, raced).unwrap().unwrap();
    assert_eq!(state, JobState::Reserved);
    assert_eq!(doc.reserved_at, Some(start_time() + TimeDelta::seconds(60)));
    assert_eq!(doc.attempts, 2);

    // Release failed: still holding its lapsed lease.
    let (doc, state) = queue.inspect(None, failed).unwrap().unwrap();
    assert_eq!(state, JobState::Expired);
    assert_eq!(doc.attempts, 1);

    let (doc, state) = queue.inspect(None, freed).unwrap().unwrap();
    assert_eq!(state, JobState::Available);
    assert_eq!(doc.reserved_at, None);
    assert_eq!(doc.attempts, 2);

    // The next sweep picks up the job whose release failed.
    assert_eq!(queue.reclaim_expired(None).unwrap(), 1);
    let (doc, _) = queue.inspect(None, failed).unwrap().unwrap();
    assert_eq!(doc.reserved_at, None);
}

#[test]
fn reclaim_where_every_release_fails_still_succeeds() {
    let clock = ManualClock::arc(start_time());
    let inner = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
    let store = InterferingStore::new(Arc::clone(&inner), &[Interference::Fail; 2]);
    let queue = LeaseQueue::new(store, QueueConfig::default().with_lease(LEASE)).unwrap();

    queue.push(None, "a").unwrap();
    queue.push(None, "b").unwrap();
    queue.claim_next(None).unwrap().unwrap();
    queue.claim_next(None).unwrap().unwrap();
    clock.advance(LEASE);

    assert_eq!(queue.reclaim_expired(None).unwrap(), 0);
    assert_eq!(queue.reclaim_expired(None).unwrap(), 2);
}

#[test]
fn malformed_json_payload_is_a_domain_error() {
    let (queue, _) = lease_queue();
    queue.push(None, "not json").unwrap();

    let job = queue.claim_next(None).unwrap().unwrap();
    let err = job.decode_payload::<serde_json::Value>().unwrap_err();
    assert!(matches!(err, QueueError::Domain(_)));
    assert!(!err.is_retryable());
}
