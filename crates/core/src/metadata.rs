//! Per-event stream metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::id::{AggregateId, AggregateType, EventId};
use crate::version::Version;

/// Metadata wrapped around every stored event (and snapshot).
///
/// Aggregate identity and version live here, never in application payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    /// Version of the aggregate once this event is applied.
    pub version: Version,
    pub agent: Agent,
    pub timestamp: DateTime<Utc>,
    /// `true` when the record is a full-state snapshot rather than a domain event.
    pub snapshot: bool,
}

impl EventMetadata {
    pub fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        version: Version,
        agent: Agent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_id,
            aggregate_type,
            version,
            agent,
            timestamp,
            snapshot: false,
        }
    }

    /// Same stream coordinates, flagged as a snapshot record.
    pub fn into_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }
}
