//! Lease state derived from a job's timestamps.
//!
//! The state is never stored. It is a pure function of `reserved_at`,
//! `available_at`, the observed `now` and the caller's lease duration, so it
//! cannot drift from the timestamps it is computed from.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Effective state of a job at a given instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Not leased, but `available_at` is still in the future.
    Delayed,
    /// Not leased and due.
    Available,
    /// Leased and within the lease window.
    Reserved,
    /// Leased, but the lease has lapsed; claimable again.
    Expired,
}

impl JobState {
    /// Derive the state of a job.
    ///
    /// A lease granted at `t` is expired once `t <= now - lease`, i.e. exactly
    /// `lease` after it was granted.
    pub fn derive(
        reserved_at: Option<DateTime<Utc>>,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        match reserved_at {
            Some(at) if at <= lease_cutoff(now, lease) => JobState::Expired,
            Some(_) => JobState::Reserved,
            None if available_at > now => JobState::Delayed,
            None => JobState::Available,
        }
    }

    /// Whether a claim at this instant may take the job.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Available | JobState::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Available => "available",
            JobState::Reserved => "reserved",
            JobState::Expired => "expired",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leases granted at or before the returned instant have expired at `now`.
pub fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Instant at which a lease granted at `reserved_at` lapses.
pub fn lease_end(reserved_at: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    reserved_at
        .checked_add_signed(to_delta(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now + delay`, saturating at the representable maximum.
pub fn delayed_until(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
