//! Infrastructure layer: clocks and job document store backends.

pub mod clock;
pub mod document_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use document_store::{
    CollectionName, DocumentStore, Filter, InMemoryDocumentStore, PostgresDocumentStore,
    Reservation, SortOrder, StoreError, TimeRef, Update, WriteConcern,
};
