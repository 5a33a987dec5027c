//! Event-sourcing orchestrator.
//!
//! [`EventSourcingService`] is the single entry point for commands and reads:
//!
//! ```text
//! dispatch(id, expected, command, agent)
//!   → rehydrate (latest snapshot + tail events, or full replay)
//!   → Aggregate::handle
//!   → EventStore::append at `expected`   (conflict → VersionOutdated)
//!   → fold committed events
//!   → EventBus::publish per event        (best-effort, after commit)
//!   → snapshot if the threshold is reached
//!   → new version
//! ```
//!
//! The engine never retries. A version conflict is the caller's signal to
//! reload and resubmit.

use std::sync::Arc;

use futures::TryStreamExt;
use thiserror::Error;
use tracing::instrument;

use sourcekit_codec::CodecError;
use sourcekit_core::{
    Agent, Aggregate, AggregateId, AggregateRoot, AggregateType, Version, VersionedAggregate,
};
use sourcekit_events::{Event, EventBus, JsonEventEnvelope};

use crate::config::{EngineConfig, SnapshotMode};
use crate::event_store::{
    EventStore, EventStoreError, StoredEvent, StoredSnapshot, UncommittedEvent,
};

/// Failure of a dispatch or load, generic over the aggregate's own error.
#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// The caller's expected version is not the stream's current version.
    #[error("{aggregate_type}/{aggregate_id} is at version {current_version}; reload and retry")]
    VersionOutdated {
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        current_version: Version,
    },

    #[error("{aggregate_type}/{aggregate_id} not found")]
    AggregateNotFound {
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
    },

    /// A historic read asked for a version the stream does not have.
    #[error(
        "{aggregate_type}/{aggregate_id} has no version {requested} (current {current_version})"
    )]
    VersionNotFound {
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        requested: Version,
        current_version: Version,
    },

    /// The aggregate refused the command.
    #[error("command rejected: {0}")]
    Rejected(#[source] E),

    /// Stored snapshot state could not be decoded.
    #[error("snapshot decode failed: {0}")]
    Codec(#[from] CodecError),

    /// A stored event payload does not match the aggregate's event type.
    #[error("event at version {version} could not be decoded: {message}")]
    EventPayload { version: Version, message: String },

    /// The backend returned versions out of order or with gaps.
    #[error("corrupt event stream: {0}")]
    CorruptStream(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl<E> DispatchError<E> {
    pub fn is_version_outdated(&self) -> bool {
        matches!(self, DispatchError::VersionOutdated { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::AggregateNotFound { .. })
    }

    fn from_append(err: EventStoreError) -> Self {
        match err {
            EventStoreError::VersionConflict {
                aggregate_type,
                aggregate_id,
                current,
                ..
            } => DispatchError::VersionOutdated {
                aggregate_type,
                aggregate_id,
                current_version: current,
            },
            other => DispatchError::Store(other),
        }
    }
}

/// Result of rehydration: the folded value and where its snapshot came from.
struct Loaded<A: Aggregate> {
    aggregate: VersionedAggregate<A>,
    snapshot_version: Version,
}

/// Orchestrates load → decide → append → publish → snapshot.
///
/// Stateless apart from its collaborators; share one instance (or clones of
/// the `Arc`ed store) across tasks freely.
#[derive(Debug)]
pub struct EventSourcingService<S, B> {
    store: Arc<S>,
    bus: B,
    config: EngineConfig,
}

impl<S, B> EventSourcingService<S, B>
where
    S: EventStore + 'static,
    B: EventBus<JsonEventEnvelope>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self::from_shared(Arc::new(store), bus)
    }

    /// Build around a store that is also used elsewhere.
    pub fn from_shared(store: Arc<S>, bus: B) -> Self {
        Self {
            store,
            bus,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Run `command` against the aggregate, which must currently be at `expected`.
    ///
    /// Dispatching at `Version::INITIAL` against a fresh id is how aggregates
    /// are created. Returns the version after the new events; if the command
    /// produced no events the version is returned unchanged.
    #[instrument(
        skip_all,
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = ?id, expected = %expected)
    )]
    pub async fn dispatch<A>(
        &self,
        id: &A::Id,
        expected: Version,
        command: A::Command,
        agent: &Agent,
    ) -> Result<Version, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: Event,
    {
        let aggregate_type = A::aggregate_type();
        let aggregate_id: AggregateId = id.clone().into();

        let Loaded {
            mut aggregate,
            snapshot_version,
        } = self.rehydrate::<A>(&aggregate_id).await?;

        let current = aggregate.version();
        if current != expected {
            return Err(DispatchError::VersionOutdated {
                aggregate_type,
                aggregate_id,
                current_version: current,
            });
        }

        let events = aggregate
            .state()
            .handle(&command, agent)
            .map_err(DispatchError::Rejected)?;
        if events.is_empty() {
            tracing::debug!("command produced no events");
            return Ok(current);
        }

        let uncommitted = events
            .iter()
            .map(UncommittedEvent::from_typed)
            .collect::<Result<Vec<_>, _>>()?;
        let committed = self
            .store
            .append(&aggregate_type, &aggregate_id, expected, uncommitted, agent)
            .await
            .map_err(DispatchError::from_append)?;

        for (event, stored) in events.iter().zip(&committed) {
            aggregate.apply(event, &stored.metadata);
        }
        let new_version = aggregate.version();
        tracing::info!(
            version = %new_version,
            event_count = committed.len(),
            "events committed"
        );

        self.publish(&committed);
        self.maybe_snapshot(&aggregate_type, &aggregate_id, &aggregate, snapshot_version)
            .await;

        Ok(new_version)
    }

    /// Like [`dispatch`](Self::dispatch), expecting whatever version the store holds now.
    pub async fn dispatch_to_latest<A>(
        &self,
        id: &A::Id,
        command: A::Command,
        agent: &Agent,
    ) -> Result<Version, DispatchError<A::Error>>
    where
        A: Aggregate,
        A::Event: Event,
    {
        let aggregate_id: AggregateId = id.clone().into();
        let current = self
            .store
            .current_version(&A::aggregate_type(), &aggregate_id)
            .await?;
        self.dispatch::<A>(id, current, command, agent).await
    }

    /// Current state. Fails with `AggregateNotFound` when the stream is empty.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = ?id))]
    pub async fn load_latest<A>(
        &self,
        id: &A::Id,
    ) -> Result<VersionedAggregate<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let aggregate_id: AggregateId = id.clone().into();
        let loaded = self.rehydrate::<A>(&aggregate_id).await?;
        if !loaded.aggregate.exists() {
            return Err(DispatchError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id,
            });
        }
        Ok(loaded.aggregate)
    }

    /// State as of `version`, replayed from the first event (snapshots are
    /// not consulted for historic reads).
    #[instrument(
        skip_all,
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = ?id, version = %version)
    )]
    pub async fn load_at<A>(
        &self,
        id: &A::Id,
        version: Version,
    ) -> Result<VersionedAggregate<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let aggregate_type = A::aggregate_type();
        let aggregate_id: AggregateId = id.clone().into();

        let mut aggregate = VersionedAggregate::<A>::empty(aggregate_id.clone());
        self.fold(&aggregate_type, &aggregate_id, &mut aggregate, Some(version))
            .await?;

        if !aggregate.exists() {
            return Err(DispatchError::AggregateNotFound {
                aggregate_type,
                aggregate_id,
            });
        }
        if aggregate.version() != version {
            let current_version = self
                .store
                .current_version(&aggregate_type, &aggregate_id)
                .await?;
            return Err(DispatchError::VersionNotFound {
                aggregate_type,
                aggregate_id,
                requested: version,
                current_version,
            });
        }
        Ok(aggregate)
    }

    /// Write a snapshot of the current state regardless of thresholds.
    ///
    /// Returns the snapshot's version. A no-op when the latest snapshot is
    /// already current.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = ?id))]
    pub async fn snapshot_now<A>(&self, id: &A::Id) -> Result<Version, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let aggregate_type = A::aggregate_type();
        let aggregate_id: AggregateId = id.clone().into();

        let loaded = self.rehydrate::<A>(&aggregate_id).await?;
        let version = loaded.aggregate.version();
        if !version.exists() {
            return Err(DispatchError::AggregateNotFound {
                aggregate_type,
                aggregate_id,
            });
        }
        if loaded.snapshot_version == version {
            return Ok(version);
        }

        let snapshot = build_snapshot(&aggregate_type, &aggregate_id, &loaded.aggregate)?;
        self.store.store_snapshot(snapshot).await?;
        tracing::info!(version = %version, "snapshot written");
        Ok(version)
    }

    /// Latest snapshot (if any) plus every later event, folded in order.
    async fn rehydrate<A>(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Loaded<A>, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let aggregate_type = A::aggregate_type();

        let (mut aggregate, snapshot_version) = match self
            .store
            .read_latest_snapshot(&aggregate_type, aggregate_id)
            .await?
        {
            Some(snapshot) => {
                let version = snapshot.version();
                let state: A = sourcekit_codec::decode(&snapshot.state)?;
                tracing::debug!(snapshot_version = %version, "restored from snapshot");
                (
                    VersionedAggregate::<A>::restore(aggregate_id.clone(), version, state),
                    version,
                )
            }
            None => {
                tracing::debug!("no snapshot, replaying from the first event");
                (VersionedAggregate::<A>::empty(aggregate_id.clone()), Version::INITIAL)
            }
        };

        let folded = self
            .fold(&aggregate_type, aggregate_id, &mut aggregate, None)
            .await?;
        tracing::debug!(folded, version = %aggregate.version(), "rehydrated");

        Ok(Loaded {
            aggregate,
            snapshot_version,
        })
    }

    /// Apply every stored event after the aggregate's version, stopping after
    /// `until` when given. Returns the number of events folded.
    async fn fold<A>(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        aggregate: &mut VersionedAggregate<A>,
        until: Option<Version>,
    ) -> Result<u64, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let mut stream = self
            .store
            .read_from(aggregate_type, aggregate_id, aggregate.version().next());

        let mut folded = 0;
        while let Some(stored) = stream.try_next().await? {
            if until.is_some_and(|until| stored.version() > until) {
                break;
            }
            apply_stored(aggregate, &stored)?;
            folded += 1;
        }
        Ok(folded)
    }

    fn publish(&self, committed: &[StoredEvent]) {
        if !self.config.publish_events {
            return;
        }
        for stored in committed {
            if let Err(error) = self.bus.publish(stored.to_envelope()) {
                tracing::warn!(
                    %error,
                    version = %stored.version(),
                    event_type = %stored.event_type,
                    "publish failed; event stays committed"
                );
            }
        }
    }

    async fn maybe_snapshot<A>(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        aggregate: &VersionedAggregate<A>,
        last_snapshot: Version,
    ) where
        A: Aggregate,
    {
        let mode = self.config.snapshot_mode;
        let threshold = self.config.snapshot_threshold(A::snapshot_threshold());
        if mode == SnapshotMode::Disabled
            || !snapshot_due(threshold, aggregate.version(), last_snapshot)
        {
            return;
        }

        // Encoding is pure CPU work; only the store write may be deferred.
        let snapshot = match build_snapshot(aggregate_type, aggregate_id, aggregate) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, "snapshot encoding failed; skipped");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        match (mode, tokio::runtime::Handle::try_current()) {
            (SnapshotMode::Background, Ok(handle)) => {
                handle.spawn(write_snapshot(store, snapshot));
            }
            _ => write_snapshot(store, snapshot).await,
        }
    }
}

/// Whether `version` is `threshold` or more events past `last_snapshot`.
fn snapshot_due(threshold: u64, version: Version, last_snapshot: Version) -> bool {
    threshold > 0 && version.since(last_snapshot) >= threshold
}

fn build_snapshot<A: Aggregate>(
    aggregate_type: &AggregateType,
    aggregate_id: &AggregateId,
    aggregate: &VersionedAggregate<A>,
) -> Result<StoredSnapshot, CodecError> {
    let state = sourcekit_codec::encode(aggregate.state())?;
    Ok(StoredSnapshot::new(
        aggregate_type.clone(),
        aggregate_id.clone(),
        aggregate.version(),
        Agent::System,
        state,
    ))
}

async fn write_snapshot<S: EventStore>(store: Arc<S>, snapshot: StoredSnapshot) {
    let version = snapshot.version();
    match store.store_snapshot(snapshot).await {
        Ok(()) => tracing::info!(version = %version, "snapshot written"),
        Err(EventStoreError::InvalidSnapshot(reason)) => {
            tracing::warn!(version = %version, %reason, "snapshot skipped")
        }
        Err(error) => tracing::warn!(version = %version, %error, "snapshot write failed"),
    }
}

/// Decode one stored event and fold it, enforcing contiguous versions.
fn apply_stored<A: Aggregate>(
    aggregate: &mut VersionedAggregate<A>,
    stored: &StoredEvent,
) -> Result<(), DispatchError<A::Error>> {
    let expected = aggregate.version().next();
    if stored.version() != expected {
        return Err(DispatchError::CorruptStream(format!(
            "expected version {expected}, store returned {}",
            stored.version()
        )));
    }
    if stored.metadata.snapshot {
        return Err(DispatchError::CorruptStream(format!(
            "snapshot record at version {} inside the event log",
            stored.version()
        )));
    }

    let event: A::Event =
        serde_json::from_value(stored.payload.clone()).map_err(|e| DispatchError::EventPayload {
            version: stored.version(),
            message: e.to_string(),
        })?;
    aggregate.apply(&event, &stored.metadata);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sourcekit_core::EventMetadata;
    use sourcekit_events::NoopBus;

    use crate::event_store::InMemoryEventStore;
    use crate::fixtures::{Fabric, FabricError, FabricEvent, FabricId, create, rename};

    fn fabric_id() -> FabricId {
        FabricId::new("fab-1").unwrap()
    }

    fn service() -> EventSourcingService<InMemoryEventStore, NoopBus> {
        EventSourcingService::new(InMemoryEventStore::new(), NoopBus)
    }

    fn stored(version: u64, payload: serde_json::Value) -> StoredEvent {
        let metadata = EventMetadata::new(
            Fabric::aggregate_type(),
            fabric_id().into(),
            Version::new(version),
            Agent::System,
            Utc::now(),
        );
        StoredEvent {
            metadata,
            event_type: "fabric.renamed".to_string(),
            payload,
        }
    }

    #[test]
    fn snapshot_due_respects_threshold() {
        assert!(!snapshot_due(0, Version::new(100), Version::INITIAL));
        assert!(!snapshot_due(3, Version::new(2), Version::INITIAL));
        assert!(snapshot_due(3, Version::new(3), Version::INITIAL));
        assert!(!snapshot_due(3, Version::new(5), Version::new(3)));
        assert!(snapshot_due(3, Version::new(6), Version::new(3)));
    }

    #[test]
    fn apply_stored_rejects_gaps() {
        let mut aggregate = VersionedAggregate::<Fabric>::empty(fabric_id());
        let event = serde_json::to_value(FabricEvent::Renamed {
            name: "x".to_string(),
        })
        .unwrap();

        let err = apply_stored(&mut aggregate, &stored(2, event)).unwrap_err();
        assert!(matches!(err, DispatchError::CorruptStream(_)));
    }

    #[test]
    fn apply_stored_reports_undecodable_payloads() {
        let mut aggregate = VersionedAggregate::<Fabric>::empty(fabric_id());
        let payload = serde_json::json!({ "Exploded": 1 });
        let err = apply_stored(&mut aggregate, &stored(1, payload)).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::EventPayload { version, .. } if version == Version::new(1)
        ));
    }

    #[test]
    fn conflicts_map_to_version_outdated() {
        let err = DispatchError::<FabricError>::from_append(EventStoreError::VersionConflict {
            aggregate_type: Fabric::aggregate_type(),
            aggregate_id: fabric_id().into(),
            expected: Version::new(1),
            current: Version::new(2),
        });
        assert!(matches!(
            err,
            DispatchError::VersionOutdated { current_version, .. }
                if current_version == Version::new(2)
        ));
    }

    #[tokio::test]
    async fn creation_starts_at_version_one() {
        let service = service();
        let version = service
            .dispatch::<Fabric>(&fabric_id(), Version::INITIAL, create("Linen"), &Agent::System)
            .await
            .unwrap();
        assert_eq!(version, Version::new(1));
    }

    #[tokio::test]
    async fn no_op_commands_keep_the_version() {
        let service = service();
        let id = fabric_id();
        service
            .dispatch::<Fabric>(&id, Version::INITIAL, create("Linen"), &Agent::System)
            .await
            .unwrap();

        let version = service
            .dispatch::<Fabric>(&id, Version::new(1), rename("Linen"), &Agent::System)
            .await
            .unwrap();

        assert_eq!(version, Version::new(1));
        assert_eq!(service.store().event_count(), 1);
    }

    #[tokio::test]
    async fn rejected_commands_surface_the_domain_error() {
        let service = service();
        let err = service
            .dispatch::<Fabric>(&fabric_id(), Version::INITIAL, rename("Wool"), &Agent::System)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(FabricError::NotCreated)));
        assert_eq!(service.store().event_count(), 0);
    }

    #[tokio::test]
    async fn stale_expected_version_is_rejected_before_handling() {
        let service = service();
        let id = fabric_id();
        service
            .dispatch::<Fabric>(&id, Version::INITIAL, create("Linen"), &Agent::System)
            .await
            .unwrap();

        let err = service
            .dispatch::<Fabric>(&id, Version::INITIAL, create("Linen"), &Agent::System)
            .await
            .unwrap_err();

        assert!(err.is_version_outdated());
        assert_eq!(service.store().event_count(), 1);
    }
}
