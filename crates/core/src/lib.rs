//! Job document model shared by every queue layer.
//!
//! This crate contains **pure** primitives (no storage or IO concerns): the
//! job identifier, the persisted document shape, and the lease state derived
//! from its timestamps.

pub mod error;
pub mod id;
pub mod job;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{JobDocument, NewJob, Payload};
pub use state::JobState;
