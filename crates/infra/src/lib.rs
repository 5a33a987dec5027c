//! Infrastructure layer: event stores, the event-sourcing service and its
//! configuration.

pub mod config;
pub mod event_store;
pub mod service;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, EngineConfig, PostgresConfig, SnapshotMode};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore, StoredEvent,
    StoredSnapshot, UncommittedEvent,
};
pub use service::{DispatchError, EventSourcingService};
