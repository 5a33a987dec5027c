use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use sourcekit_core::{Agent, AggregateId, AggregateType, EventMetadata, Version};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, StoredSnapshot, UncommittedEvent, check_batch,
    check_snapshot, to_store_precision,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    aggregate_type: AggregateType,
    aggregate_id: AggregateId,
}

impl StreamKey {
    fn new(aggregate_type: &AggregateType, aggregate_id: &AggregateId) -> Self {
        Self {
            aggregate_type: aggregate_type.clone(),
            aggregate_id: aggregate_id.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Stream {
    events: Vec<StoredEvent>,
    snapshot: Option<StoredSnapshot>,
}

impl Stream {
    fn current_version(&self) -> Version {
        self.events
            .last()
            .map(StoredEvent::version)
            .unwrap_or(Version::INITIAL)
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. One `RwLock` guards every stream, so appends are
/// serialised and the version check cannot race.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Stream>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored across all streams.
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .map(|streams| streams.values().map(|s| s.events.len()).sum())
            .unwrap_or(0)
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Backend("in-memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        expected: Version,
        events: Vec<UncommittedEvent>,
        agent: &Agent,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        check_batch(&events)?;

        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;

        let key = StreamKey::new(aggregate_type, aggregate_id);
        let current = streams
            .get(&key)
            .map(Stream::current_version)
            .unwrap_or(Version::INITIAL);

        if current != expected {
            return Err(EventStoreError::VersionConflict {
                aggregate_type: aggregate_type.clone(),
                aggregate_id: aggregate_id.clone(),
                expected,
                current,
            });
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        let stream = streams.entry(key).or_default();
        let mut version = current;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            version = version.next();
            let mut metadata = EventMetadata::new(
                aggregate_type.clone(),
                aggregate_id.clone(),
                version,
                *agent,
                to_store_precision(e.timestamp),
            );
            metadata.event_id = e.event_id;
            committed.push(StoredEvent {
                metadata,
                event_type: e.event_type,
                payload: e.payload,
            });
        }
        stream.events.extend(committed.iter().cloned());

        Ok(committed)
    }

    fn read_from<'a>(
        &'a self,
        aggregate_type: &'a AggregateType,
        aggregate_id: &'a AggregateId,
        from: Version,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>> {
        let streams = match self.streams.read() {
            Ok(streams) => streams,
            Err(_) => return stream::once(async { Err(Self::poisoned()) }).boxed(),
        };

        // Copy out under the lock; the guard must not live across the stream.
        let events: Vec<StoredEvent> = streams
            .get(&StreamKey::new(aggregate_type, aggregate_id))
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.version() >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn current_version(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get(&StreamKey::new(aggregate_type, aggregate_id))
            .map(Stream::current_version)
            .unwrap_or(Version::INITIAL))
    }

    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), EventStoreError> {
        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;

        let key = StreamKey::new(
            &snapshot.metadata.aggregate_type,
            &snapshot.metadata.aggregate_id,
        );
        let Some(stream) = streams.get_mut(&key) else {
            return Err(EventStoreError::InvalidSnapshot(format!(
                "no stream {}/{}",
                key.aggregate_type, key.aggregate_id
            )));
        };

        check_snapshot(
            &snapshot,
            stream.current_version(),
            stream.snapshot.as_ref().map(StoredSnapshot::version),
        )?;
        stream.snapshot = Some(snapshot);

        Ok(())
    }

    async fn read_latest_snapshot(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredSnapshot>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams
            .get(&StreamKey::new(aggregate_type, aggregate_id))
            .and_then(|s| s.snapshot.clone()))
    }
}
