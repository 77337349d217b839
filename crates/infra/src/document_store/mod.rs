//! Job document store boundary.
//!
//! This module defines the storage abstraction the lease protocol runs on,
//! a store-agnostic query model, and two backends: an in-memory store for
//! tests/dev and a Postgres store for production.

pub mod collection;
pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use collection::{CollectionName, WriteConcern};
pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use query::{Filter, Reservation, SortOrder, TimeRef, Update};
pub use r#trait::{DocumentStore, StoreError};
