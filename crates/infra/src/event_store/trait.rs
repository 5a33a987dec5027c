use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use sourcekit_codec::StateMap;
use sourcekit_core::{Agent, AggregateId, AggregateType, EventId, EventMetadata, Version};
use sourcekit_events::{Event, EventEnvelope, JsonEventEnvelope};

/// An event ready to be appended to a stream (no version assigned yet).
///
/// Lifecycle:
///
/// 1. **Domain event**: returned by `Aggregate::handle`
/// 2. **UncommittedEvent**: payload rendered to JSON, event name captured
/// 3. **StoredEvent**: persisted with its [`EventMetadata`] (version, agent, ...)
/// 4. **EventEnvelope**: handed to the bus after commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Render a typed domain event, stamping it with a fresh id and the current time.
    pub fn from_typed<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::Serialization(format!(
                "payload of `{}` could not be serialized: {e}",
                event.event_type()
            ))
        })?;

        Ok(Self {
            event_id: EventId::new(),
            event_type: event.event_type().to_string(),
            timestamp: store_now(),
            payload,
        })
    }
}

/// A persisted event together with its stream metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub metadata: EventMetadata,
    pub event_type: String,
    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn version(&self) -> Version {
        self.metadata.version
    }

    /// Envelope handed to the bus once the append is durable.
    pub fn to_envelope(&self) -> JsonEventEnvelope {
        EventEnvelope::new(
            self.metadata.clone(),
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

/// Full aggregate state at a given version.
///
/// Stored alongside the event log; its metadata is flagged `snapshot = true`
/// and carries the version of the last event folded into `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub metadata: EventMetadata,
    pub state: StateMap,
}

impl StoredSnapshot {
    pub fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        version: Version,
        agent: Agent,
        state: StateMap,
    ) -> Self {
        let metadata =
            EventMetadata::new(aggregate_type, aggregate_id, version, agent, store_now())
                .into_snapshot();
        Self { metadata, state }
    }

    pub fn version(&self) -> Version {
        self.metadata.version
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors raised by aggregates.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved on since the caller read it.
    #[error(
        "version conflict on {aggregate_type}/{aggregate_id}: expected {expected}, current {current}"
    )]
    VersionConflict {
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        expected: Version,
        current: Version,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// IO, driver or lock failure in the backing store.
    #[error("event store backend failure: {0}")]
    Backend(String),
}

/// Append-only event store keyed by `(aggregate_type, aggregate_id)`.
///
/// Within a stream, events carry contiguous versions `1, 2, 3, ...`.
///
/// Implementations must:
/// - check `expected` against the stream's current version and reject the whole
///   batch with [`EventStoreError::VersionConflict`] on mismatch
/// - persist a batch atomically (all events or none)
/// - serialise writers per stream so the version check is race-free
/// - return events from `read_from` in ascending version order
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` at `expected + 1 ..`. An empty batch only checks the version.
    async fn append(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        expected: Version,
        events: Vec<UncommittedEvent>,
        agent: &Agent,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Lazily stream events with `version >= from`, ascending.
    fn read_from<'a>(
        &'a self,
        aggregate_type: &'a AggregateType,
        aggregate_id: &'a AggregateId,
        from: Version,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>>;

    /// Version of the last event in the stream (`Version::INITIAL` if empty).
    async fn current_version(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError>;

    /// Persist a snapshot. Its version must lie within the stream and be newer
    /// than the latest stored snapshot.
    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), EventStoreError>;

    async fn read_latest_snapshot(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredSnapshot>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        expected: Version,
        events: Vec<UncommittedEvent>,
        agent: &Agent,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .append(aggregate_type, aggregate_id, expected, events, agent)
            .await
    }

    fn read_from<'a>(
        &'a self,
        aggregate_type: &'a AggregateType,
        aggregate_id: &'a AggregateId,
        from: Version,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>> {
        (**self).read_from(aggregate_type, aggregate_id, from)
    }

    async fn current_version(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError> {
        (**self).current_version(aggregate_type, aggregate_id).await
    }

    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), EventStoreError> {
        (**self).store_snapshot(snapshot).await
    }

    async fn read_latest_snapshot(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredSnapshot>, EventStoreError> {
        (**self).read_latest_snapshot(aggregate_type, aggregate_id).await
    }
}

/// Timestamps are kept at microsecond precision, the finest `TIMESTAMPTZ` holds.
///
/// Every backend stores this form, so metadata folded right after an append
/// matches what a later replay reads back.
pub fn to_store_precision(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(6)
}

fn store_now() -> DateTime<Utc> {
    to_store_precision(Utc::now())
}

/// Validation shared by backends before a snapshot is written.
pub(crate) fn check_snapshot(
    snapshot: &StoredSnapshot,
    current: Version,
    latest: Option<Version>,
) -> Result<(), EventStoreError> {
    let version = snapshot.version();
    if !snapshot.metadata.snapshot {
        return Err(EventStoreError::InvalidSnapshot(
            "metadata is not flagged as a snapshot".to_string(),
        ));
    }
    if !version.exists() || version > current {
        return Err(EventStoreError::InvalidSnapshot(format!(
            "version {version} outside of stream (current {current})"
        )));
    }
    if let Some(latest) = latest {
        if version <= latest {
            return Err(EventStoreError::InvalidSnapshot(format!(
                "version {version} is not newer than stored snapshot {latest}"
            )));
        }
    }
    Ok(())
}

/// Validation shared by backends before events are written.
pub(crate) fn check_batch(events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    for (idx, e) in events.iter().enumerate() {
        if e.event_type.trim().is_empty() {
            return Err(EventStoreError::InvalidAppend(format!(
                "event at index {idx} has no event type"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Renamed {
        name: String,
    }

    impl Event for Renamed {
        fn event_type(&self) -> &'static str {
            "fabric.renamed"
        }
    }

    fn snapshot_at(version: u64) -> StoredSnapshot {
        StoredSnapshot::new(
            AggregateType::from_static("FABRIC"),
            AggregateId::new("fab-1").unwrap(),
            Version::new(version),
            Agent::System,
            StateMap::new(),
        )
    }

    #[test]
    fn from_typed_captures_name_and_payload() {
        let event = UncommittedEvent::from_typed(&Renamed {
            name: "Denim".to_string(),
        })
        .unwrap();

        assert_eq!(event.event_type, "fabric.renamed");
        assert_eq!(event.payload, serde_json::json!({ "name": "Denim" }));
    }

    #[test]
    fn fresh_timestamps_are_at_store_precision() {
        let event = UncommittedEvent::from_typed(&Renamed {
            name: "Denim".to_string(),
        })
        .unwrap();
        assert_eq!(event.timestamp, to_store_precision(event.timestamp));
        assert_eq!(event.timestamp.timestamp_subsec_nanos() % 1_000, 0);

        let snapshot = snapshot_at(1);
        assert_eq!(
            snapshot.metadata.timestamp,
            to_store_precision(snapshot.metadata.timestamp)
        );
    }

    #[test]
    fn store_precision_drops_sub_microsecond_digits() {
        let precise = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let stored = to_store_precision(precise);
        assert_eq!(stored.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(to_store_precision(stored), stored);
    }

    #[test]
    fn snapshot_must_lie_within_stream() {
        assert!(check_snapshot(&snapshot_at(3), Version::new(3), None).is_ok());
        assert!(matches!(
            check_snapshot(&snapshot_at(4), Version::new(3), None),
            Err(EventStoreError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            check_snapshot(&snapshot_at(0), Version::new(3), None),
            Err(EventStoreError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn snapshot_must_be_newer_than_latest() {
        assert!(check_snapshot(&snapshot_at(3), Version::new(5), Some(Version::new(2))).is_ok());
        assert!(matches!(
            check_snapshot(&snapshot_at(2), Version::new(5), Some(Version::new(2))),
            Err(EventStoreError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn unflagged_metadata_is_not_a_snapshot() {
        let mut snapshot = snapshot_at(1);
        snapshot.metadata.snapshot = false;
        assert!(matches!(
            check_snapshot(&snapshot, Version::new(1), None),
            Err(EventStoreError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn blank_event_types_are_rejected() {
        let mut event = UncommittedEvent::from_typed(&Renamed {
            name: "x".to_string(),
        })
        .unwrap();
        event.event_type = " ".to_string();
        assert!(matches!(
            check_batch(&[event]),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }
}
