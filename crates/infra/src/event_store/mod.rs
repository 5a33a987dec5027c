//! Append-only event store boundary.
//!
//! [`EventStore`] is the single source of truth: an ordered log per
//! `(aggregate_type, aggregate_id)` plus the latest snapshot for each stream.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    EventStore, EventStoreError, StoredEvent, StoredSnapshot, UncommittedEvent, to_store_precision,
};
