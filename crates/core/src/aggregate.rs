//! Aggregate contracts for event-sourced domain models.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::agent::Agent;
use crate::id::{AggregateId, AggregateType};
use crate::metadata::EventMetadata;
use crate::version::Version;

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events folded into the current state.
    fn version(&self) -> Version;
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd, agent)` returns events or a named error.
/// - **State mutation**: `apply(&mut self, event, metadata)` evolves state.
///
/// The implementing type is the aggregate *body*: everything that goes into a
/// snapshot. Identity and version are kept outside of it (see
/// [`VersionedAggregate`]) and supplied from [`EventMetadata`] on replay.
/// `Default` is the zero value an aggregate has before its first event.
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate:
    Default + Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Namespace tag for streams of this aggregate (e.g. `"FABRIC"`).
    const AGGREGATE_TYPE: &'static str;

    /// Typed identity; may be a wrapper around the raw [`AggregateId`].
    type Id: From<AggregateId>
        + Into<AggregateId>
        + Clone
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + Send
        + Sync;
    type Command: core::fmt::Debug + Send + Sync;
    type Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide which events to emit given the current state, a command and the
    /// acting agent. Must not mutate state.
    fn handle(&self, command: &Self::Command, agent: &Agent)
    -> Result<Vec<Self::Event>, Self::Error>;

    /// Evolve in-memory state from a single event.
    ///
    /// Must be total over `Self::Event`; version tracking is done by the caller.
    fn apply(&mut self, event: &Self::Event, metadata: &EventMetadata);

    /// Events after which the engine should write a snapshot (0 disables).
    fn snapshot_threshold() -> u64 {
        0
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::from_static(Self::AGGREGATE_TYPE)
    }
}

/// An aggregate body together with the identity and version it was loaded at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedAggregate<A: Aggregate> {
    id: A::Id,
    version: Version,
    state: A,
}

impl<A: Aggregate> VersionedAggregate<A> {
    /// A not-yet-existing aggregate (version 0, zero value).
    pub fn empty(id: impl Into<A::Id>) -> Self {
        Self {
            id: id.into(),
            version: Version::INITIAL,
            state: A::default(),
        }
    }

    /// Wrap a restored body; identity and version come from stored metadata.
    pub fn restore(id: impl Into<A::Id>, version: Version, state: A) -> Self {
        Self {
            id: id.into(),
            version,
            state,
        }
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    pub fn into_parts(self) -> (A::Id, Version, A) {
        (self.id, self.version, self.state)
    }

    pub fn exists(&self) -> bool {
        self.version.exists()
    }

    /// Apply an event whose metadata carries the version it produces.
    ///
    /// Snapshot records are ignored here; they carry full state instead of a delta.
    pub fn apply(&mut self, event: &A::Event, metadata: &EventMetadata) {
        if metadata.snapshot {
            return;
        }
        self.state.apply(event, metadata);
        self.version = metadata.version;
    }
}

impl<A: Aggregate> AggregateRoot for VersionedAggregate<A> {
    type Id = A::Id;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }
}
