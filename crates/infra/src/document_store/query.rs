//! Store-agnostic query model for job documents.
//!
//! Filters and updates are small typed trees rather than raw driver queries so
//! that every backend can evaluate them: the in-memory store interprets them
//! directly, the Postgres store compiles them to SQL.
//!
//! Timestamps inside a query are [`TimeRef`]s. Relative references (`Now`,
//! `NowMinus`, `NowPlus`) are resolved by the store against its own clock
//! *inside* the atomic operation, so callers never compare against a local
//! clock that may be skewed from the store's.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use docq_core::state::{delayed_until, lease_cutoff};
use docq_core::{JobDocument, JobId};

/// Point in time referenced by a filter or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRef {
    /// The store's current time.
    Now,
    /// The store's current time minus a duration.
    NowMinus(Duration),
    /// The store's current time plus a duration.
    NowPlus(Duration),
    /// A fixed instant.
    At(DateTime<Utc>),
}

impl TimeRef {
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            TimeRef::Now => now,
            TimeRef::NowMinus(d) => lease_cutoff(now, d),
            TimeRef::NowPlus(d) => delayed_until(now, d),
            TimeRef::At(at) => at,
        }
    }
}

/// Predicate over a job document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `queue = name`
    Queue(String),
    /// `id = id`
    Id(JobId),
    /// `reserved_at IS NULL`
    Unreserved,
    /// `reserved_at = at` (a specific lease)
    ReservedAt(DateTime<Utc>),
    /// `reserved_at <= t`; never matches an unreserved document.
    ReservedAtOrBefore(TimeRef),
    /// `available_at <= t`
    AvailableAtOrBefore(TimeRef),
    /// Every child matches (an empty list matches everything).
    And(Vec<Filter>),
    /// Some child matches (an empty list matches nothing).
    Or(Vec<Filter>),
}

impl Filter {
    pub fn queue(name: impl Into<String>) -> Self {
        Filter::Queue(name.into())
    }

    pub fn id(id: JobId) -> Self {
        Filter::Id(id)
    }

    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn any(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Evaluate against `doc` with relative times resolved at `now`.
    pub fn matches(&self, doc: &JobDocument, now: DateTime<Utc>) -> bool {
        match self {
            Filter::Queue(name) => doc.queue == *name,
            Filter::Id(id) => doc.id == *id,
            Filter::Unreserved => doc.reserved_at.is_none(),
            Filter::ReservedAt(at) => doc.reserved_at == Some(*at),
            Filter::ReservedAtOrBefore(t) => doc
                .reserved_at
                .is_some_and(|reserved| reserved <= t.resolve(now)),
            Filter::AvailableAtOrBefore(t) => doc.available_at <= t.resolve(now),
            Filter::And(children) => children.iter().all(|f| f.matches(doc, now)),
            Filter::Or(children) => children.iter().any(|f| f.matches(doc, now)),
        }
    }
}

/// New value for `reserved_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Set(TimeRef),
    Clear,
}

/// Mutation applied to the single document a `find_and_update` selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub reserved_at: Option<Reservation>,
    pub available_at: Option<TimeRef>,
    pub inc_attempts: u32,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(mut self, at: TimeRef) -> Self {
        self.reserved_at = Some(Reservation::Set(at));
        self
    }

    pub fn clear_reservation(mut self) -> Self {
        self.reserved_at = Some(Reservation::Clear);
        self
    }

    pub fn available_at(mut self, at: TimeRef) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn inc_attempts(mut self, by: u32) -> Self {
        self.inc_attempts = by;
        self
    }

    pub fn apply(&self, doc: &mut JobDocument, now: DateTime<Utc>) {
        match self.reserved_at {
            Some(Reservation::Set(t)) => doc.reserved_at = Some(t.resolve(now)),
            Some(Reservation::Clear) => doc.reserved_at = None,
            None => {}
        }
        if let Some(t) = self.available_at {
            doc.available_at = t.resolve(now);
        }
        doc.attempts = doc.attempts.saturating_add(self.inc_attempts);
    }
}

/// Order in which `find_and_update` picks among matching documents.
///
/// Only oldest-first is offered: newest-first starves old jobs while
/// producers keep the queue non-empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest insertion first.
    #[default]
    SequenceAscending,
}

impl SortOrder {
    pub fn compare(self, a: &JobDocument, b: &JobDocument) -> Ordering {
        match self {
            SortOrder::SequenceAscending => a.sequence.cmp(&b.sequence),
        }
    }

    /// SQL `ORDER BY` direction for the sequence column.
    pub fn sql_direction(self) -> &'static str {
        match self {
            SortOrder::SequenceAscending => "ASC",
        }
    }
}
