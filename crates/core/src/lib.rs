//! `sourcekit-core`: event-sourcing building blocks.
//!
//! This crate contains **pure** primitives (no IO): identities, versions,
//! agents, event metadata and the aggregate contract.

pub mod agent;
pub mod aggregate;
pub mod error;
pub mod id;
pub mod metadata;
pub mod version;

pub use agent::Agent;
pub use aggregate::{Aggregate, AggregateRoot, VersionedAggregate};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, AggregateType, EventId, UserId};
pub use metadata::EventMetadata;
pub use version::Version;
