//! Lease-based job queue.
//!
//! Producers `push` jobs; workers `claim_next` one at a time, holding a lease
//! for the configured duration, and `complete` the job when done. Leases that
//! lapse without completion make the job claimable again.

pub mod config;
pub mod error;
pub mod handle;
pub mod queue;

pub use config::{ConfigError, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use handle::ClaimedJob;
pub use queue::LeaseQueue;
