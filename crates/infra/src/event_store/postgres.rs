//! Postgres-backed event store implementation.
//!
//! Streams live in one `events` table keyed by
//! `(aggregate_type, aggregate_id, version)`; snapshots live in a `snapshots`
//! table with the same key. [`PostgresEventStore::migrate`] creates both.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | EventStoreError | Scenario |
//! |------------|------|-----------------|----------|
//! | unique violation on `events` | `23505` | `VersionConflict` | Concurrent append won |
//! | unique violation on `snapshots` | `23505` | `InvalidSnapshot` | Same snapshot version |
//! | check constraint violation | `23514` | `InvalidAppend` | Non-positive version |
//! | Anything else | any | `Backend` | Network errors, pool closed, ... |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use sourcekit_codec::StateMap;
use sourcekit_core::{Agent, AggregateId, AggregateType, EventId, EventMetadata, Version};

use crate::config::PostgresConfig;

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, StoredSnapshot, UncommittedEvent, check_batch,
    check_snapshot, to_store_precision,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_type  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    version         BIGINT NOT NULL CHECK (version > 0),
    event_type      TEXT NOT NULL,
    agent           JSONB NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (aggregate_type, aggregate_id, version)
);

CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_type  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    version         BIGINT NOT NULL CHECK (version > 0),
    event_id        UUID NOT NULL,
    agent           JSONB NOT NULL,
    taken_at        TIMESTAMPTZ NOT NULL,
    state           JSONB NOT NULL,
    PRIMARY KEY (aggregate_type, aggregate_id, version)
);
"#;

/// Postgres-backed append-only event store.
///
/// `append` runs in a transaction that reads the stream's current version,
/// checks it against `expected` and inserts the batch. If another transaction
/// commits between the check and the insert, the unique constraint on
/// `(aggregate_type, aggregate_id, version)` rejects the insert and the whole
/// batch is rolled back as a [`EventStoreError::VersionConflict`].
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `events` and `snapshots` tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, events, agent),
        fields(
            aggregate_type = %aggregate_type,
            aggregate_id = %aggregate_id,
            expected = %expected,
            event_count = events.len()
        ),
        err
    )]
    pub async fn append_events(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        expected: Version,
        events: Vec<UncommittedEvent>,
        agent: &Agent,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        check_batch(&events)?;
        let agent_json = serde_json::to_value(agent)
            .map_err(|e| EventStoreError::Serialization(format!("agent: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = stream_version_in(&mut tx, aggregate_type, aggregate_id).await?;
        if current != expected {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::VersionConflict {
                aggregate_type: aggregate_type.clone(),
                aggregate_id: aggregate_id.clone(),
                expected,
                current,
            });
        }
        if events.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(vec![]);
        }

        let mut version = current;
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let occurred_at = to_store_precision(event.timestamp);

            let inserted = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_type,
                    aggregate_id,
                    version,
                    event_type,
                    agent,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(*event.event_id.as_uuid())
            .bind(aggregate_type.as_str())
            .bind(aggregate_id.as_str())
            .bind(to_db_version(version)?)
            .bind(&event.event_type)
            .bind(&agent_json)
            .bind(occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                if !is_unique_violation(&e) {
                    return Err(map_sqlx_error("insert_event", e));
                }
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                let current = self.stream_version(aggregate_type, aggregate_id).await?;
                return Err(EventStoreError::VersionConflict {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                    expected,
                    current,
                });
            }

            let mut metadata = EventMetadata::new(
                aggregate_type.clone(),
                aggregate_id.clone(),
                version,
                *agent,
                occurred_at,
            );
            metadata.event_id = event.event_id;
            committed.push(StoredEvent {
                metadata,
                event_type: event.event_type,
                payload: event.payload,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        tracing::debug!(version = %version, "events inserted");
        Ok(committed)
    }

    #[instrument(
        skip(self),
        fields(aggregate_type = %aggregate_type, aggregate_id = %aggregate_id),
        err
    )]
    pub async fn stream_version(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) AS current_version
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        let current: i64 = row
            .try_get("current_version")
            .map_err(|e| map_sqlx_error("stream_version", e))?;
        from_db_version(current)
    }

    #[instrument(
        skip(self, snapshot),
        fields(
            aggregate_type = %snapshot.metadata.aggregate_type,
            aggregate_id = %snapshot.metadata.aggregate_id,
            version = %snapshot.metadata.version
        ),
        err
    )]
    pub async fn save_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), EventStoreError> {
        let meta = &snapshot.metadata;
        let agent_json = serde_json::to_value(&meta.agent)
            .map_err(|e| EventStoreError::Serialization(format!("agent: {e}")))?;
        let state_json = serde_json::to_value(&snapshot.state)
            .map_err(|e| EventStoreError::Serialization(format!("snapshot state: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = stream_version_in(&mut tx, &meta.aggregate_type, &meta.aggregate_id).await?;
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(version)
            FROM snapshots
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(meta.aggregate_type.as_str())
        .bind(meta.aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshot_version", e))?;
        let latest = latest.map(from_db_version).transpose()?;

        if let Err(e) = check_snapshot(&snapshot, current, latest) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e);
        }

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                aggregate_type,
                aggregate_id,
                version,
                event_id,
                agent,
                taken_at,
                state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(meta.aggregate_type.as_str())
        .bind(meta.aggregate_id.as_str())
        .bind(to_db_version(meta.version)?)
        .bind(*meta.event_id.as_uuid())
        .bind(&agent_json)
        .bind(to_store_precision(meta.timestamp))
        .bind(&state_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::InvalidSnapshot(format!(
                    "a snapshot at version {} already exists",
                    meta.version
                ))
            } else {
                map_sqlx_error("insert_snapshot", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(aggregate_type = %aggregate_type, aggregate_id = %aggregate_id),
        err
    )]
    pub async fn load_snapshot(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredSnapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                aggregate_type,
                aggregate_id,
                version,
                event_id,
                agent,
                taken_at,
                state
            FROM snapshots
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        match row {
            Some(row) => {
                let row =
                    SnapshotRow::from_row(&row).map_err(|e| map_sqlx_error("load_snapshot", e))?;
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
        expected: Version,
        events: Vec<UncommittedEvent>,
        agent: &Agent,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_events(aggregate_type, aggregate_id, expected, events, agent)
            .await
    }

    fn read_from<'a>(
        &'a self,
        aggregate_type: &'a AggregateType,
        aggregate_id: &'a AggregateId,
        from: Version,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>> {
        let from = i64::try_from(from.value()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            SELECT
                event_id,
                aggregate_type,
                aggregate_id,
                version,
                event_type,
                agent,
                occurred_at,
                payload
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND version >= $3
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_type.as_str())
        .bind(aggregate_id.as_str())
        .bind(from)
        .fetch(&self.pool)
        .map(|row| {
            let row = row.map_err(|e| map_sqlx_error("read_from", e))?;
            let row = EventRow::from_row(&row).map_err(|e| map_sqlx_error("read_from", e))?;
            StoredEvent::try_from(row)
        })
        .boxed()
    }

    async fn current_version(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Version, EventStoreError> {
        self.stream_version(aggregate_type, aggregate_id).await
    }

    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), EventStoreError> {
        self.save_snapshot(snapshot).await
    }

    async fn read_latest_snapshot(
        &self,
        aggregate_type: &AggregateType,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredSnapshot>, EventStoreError> {
        self.load_snapshot(aggregate_type, aggregate_id).await
    }
}

/// Current stream version, read inside an open transaction.
async fn stream_version_in(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_type: &AggregateType,
    aggregate_id: &AggregateId,
) -> Result<Version, EventStoreError> {
    let current: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(version), 0)
        FROM events
        WHERE aggregate_type = $1 AND aggregate_id = $2
        "#,
    )
    .bind(aggregate_type.as_str())
    .bind(aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_version", e))?;

    from_db_version(current)
}

fn to_db_version(version: Version) -> Result<i64, EventStoreError> {
    i64::try_from(version.value())
        .map_err(|_| EventStoreError::InvalidAppend(format!("version {version} exceeds BIGINT")))
}

fn from_db_version(raw: i64) -> Result<Version, EventStoreError> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| EventStoreError::Backend(format!("negative version {raw} in store")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

fn parse_agent(raw: JsonValue) -> Result<Agent, EventStoreError> {
    serde_json::from_value(raw).map_err(|e| EventStoreError::Serialization(format!("agent: {e}")))
}

fn parse_id(raw: String) -> Result<AggregateId, EventStoreError> {
    AggregateId::new(raw).map_err(|e| EventStoreError::Serialization(e.to_string()))
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    event_id: uuid::Uuid,
    aggregate_type: String,
    aggregate_id: String,
    version: i64,
    event_type: String,
    agent: JsonValue,
    occurred_at: DateTime<Utc>,
    payload: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            event_id: row.try_get("event_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            agent: row.try_get("agent")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let mut metadata = EventMetadata::new(
            AggregateType::from(row.aggregate_type),
            parse_id(row.aggregate_id)?,
            from_db_version(row.version)?,
            parse_agent(row.agent)?,
            row.occurred_at,
        );
        metadata.event_id = EventId::from_uuid(row.event_id);
        Ok(StoredEvent {
            metadata,
            event_type: row.event_type,
            payload: row.payload,
        })
    }
}

#[derive(Debug)]
struct SnapshotRow {
    aggregate_type: String,
    aggregate_id: String,
    version: i64,
    event_id: uuid::Uuid,
    agent: JsonValue,
    taken_at: DateTime<Utc>,
    state: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            event_id: row.try_get("event_id")?,
            agent: row.try_get("agent")?,
            taken_at: row.try_get("taken_at")?,
            state: row.try_get("state")?,
        })
    }
}

impl TryFrom<SnapshotRow> for StoredSnapshot {
    type Error = EventStoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let state: StateMap = serde_json::from_value(row.state)
            .map_err(|e| EventStoreError::Serialization(format!("snapshot state: {e}")))?;
        let mut metadata = EventMetadata::new(
            AggregateType::from(row.aggregate_type),
            parse_id(row.aggregate_id)?,
            from_db_version(row.version)?,
            parse_agent(row.agent)?,
            row.taken_at,
        )
        .into_snapshot();
        metadata.event_id = EventId::from_uuid(row.event_id);
        Ok(StoredSnapshot { metadata, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const FABRIC: AggregateType = AggregateType::from_static("FABRIC");

    /// Store on the scratch database named by `SOURCEKIT_DATABASE_URL`.
    async fn live_store() -> PostgresEventStore {
        let config = PostgresConfig::from_env().expect("SOURCEKIT_DATABASE_URL must be set");
        let store = PostgresEventStore::connect(&config).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn event(name: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: EventId::new(),
            event_type: name.to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap(),
            payload: serde_json::json!({ "name": name }),
        }
    }

    #[test]
    fn versions_round_trip_through_bigint() {
        assert_eq!(to_db_version(Version::new(42)).unwrap(), 42);
        assert_eq!(from_db_version(42).unwrap(), Version::new(42));
        assert!(matches!(
            to_db_version(Version::new(u64::MAX)),
            Err(EventStoreError::InvalidAppend(_))
        ));
        assert!(matches!(
            from_db_version(-1),
            Err(EventStoreError::Backend(_))
        ));
    }

    #[test]
    fn event_rows_become_stored_events() {
        let event_id = uuid::Uuid::now_v7();
        let row = EventRow {
            event_id,
            aggregate_type: "FABRIC".to_string(),
            aggregate_id: "fab-1".to_string(),
            version: 3,
            event_type: "fabric.renamed".to_string(),
            agent: serde_json::json!({ "kind": "system" }),
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "name": "Denim" }),
        };

        let stored = StoredEvent::try_from(row).unwrap();

        assert_eq!(stored.version(), Version::new(3));
        assert_eq!(stored.metadata.event_id, EventId::from_uuid(event_id));
        assert_eq!(stored.metadata.agent, Agent::System);
        assert!(!stored.metadata.snapshot);
    }

    #[test]
    fn snapshot_rows_are_flagged_and_decoded() {
        let row = SnapshotRow {
            aggregate_type: "FABRIC".to_string(),
            aggregate_id: "fab-1".to_string(),
            version: 2,
            event_id: uuid::Uuid::now_v7(),
            agent: serde_json::json!({ "kind": "anonymous" }),
            taken_at: Utc::now(),
            state: serde_json::json!({ "name": "Denim", "stock": 4, "retired_at": null }),
        };

        let snapshot = StoredSnapshot::try_from(row).unwrap();

        assert!(snapshot.metadata.snapshot);
        assert_eq!(snapshot.version(), Version::new(2));
        assert_eq!(snapshot.state.len(), 3);
    }

    #[test]
    fn corrupt_agent_is_a_serialization_error() {
        let row = EventRow {
            event_id: uuid::Uuid::now_v7(),
            aggregate_type: "FABRIC".to_string(),
            aggregate_id: "fab-1".to_string(),
            version: 1,
            event_type: "fabric.created".to_string(),
            agent: serde_json::json!("robot"),
            occurred_at: Utc::now(),
            payload: JsonValue::Null,
        };
        assert!(matches!(
            StoredEvent::try_from(row),
            Err(EventStoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database in SOURCEKIT_DATABASE_URL"]
    async fn appends_read_back_exactly_as_committed() {
        let store = live_store().await;
        // Already migrated once; the schema is idempotent.
        store.migrate().await.unwrap();
        let fab = AggregateId::generate();

        let committed = store
            .append(&FABRIC, &fab, Version::INITIAL, vec![event("a"), event("b")], &Agent::System)
            .await
            .unwrap();
        let replayed: Vec<StoredEvent> = store
            .read_from(&FABRIC, &fab, Version::new(1))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(committed, replayed);
        assert_eq!(committed[0].metadata.timestamp.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(store.current_version(&FABRIC, &fab).await.unwrap(), Version::new(2));
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database in SOURCEKIT_DATABASE_URL"]
    async fn racing_appends_leave_one_winner() {
        let store = live_store().await;
        let fab = AggregateId::generate();

        let (fabric, agent) = (FABRIC, Agent::System);
        let (left, right) = tokio::join!(
            store.append(&fabric, &fab, Version::INITIAL, vec![event("left")], &agent),
            store.append(&fabric, &fab, Version::INITIAL, vec![event("right")], &agent),
        );

        let outcomes = [left, right];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(EventStoreError::VersionConflict { current, .. }) if *current == Version::new(1)
        )));
        assert_eq!(store.current_version(&FABRIC, &fab).await.unwrap(), Version::new(1));
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database in SOURCEKIT_DATABASE_URL"]
    async fn duplicate_versions_are_unique_violations() {
        let store = live_store().await;
        let fab = AggregateId::generate();
        store
            .append(&FABRIC, &fab, Version::INITIAL, vec![event("a")], &Agent::System)
            .await
            .unwrap();

        let err = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, aggregate_type, aggregate_id, version, event_type, agent,
                occurred_at, payload
            )
            VALUES ($1, $2, $3, 1, 'dup', '{"kind": "system"}', NOW(), '{}')
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(FABRIC.as_str())
        .bind(fab.as_str())
        .execute(&store.pool)
        .await
        .unwrap_err();

        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database in SOURCEKIT_DATABASE_URL"]
    async fn snapshots_must_advance() {
        let store = live_store().await;
        let fab = AggregateId::generate();
        store
            .append(&FABRIC, &fab, Version::INITIAL, vec![event("a"), event("b")], &Agent::System)
            .await
            .unwrap();

        let snapshot = |version| {
            let mut state = StateMap::new();
            state.insert("name".into(), "Denim".into());
            StoredSnapshot::new(FABRIC, fab.clone(), Version::new(version), Agent::System, state)
        };

        assert!(store.read_latest_snapshot(&FABRIC, &fab).await.unwrap().is_none());
        store.store_snapshot(snapshot(2)).await.unwrap();
        assert!(matches!(
            store.store_snapshot(snapshot(1)).await,
            Err(EventStoreError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            store.store_snapshot(snapshot(3)).await,
            Err(EventStoreError::InvalidSnapshot(_))
        ));

        let latest = store.read_latest_snapshot(&FABRIC, &fab).await.unwrap().unwrap();
        assert!(latest.metadata.snapshot);
        assert_eq!(latest.version(), Version::new(2));
        assert_eq!(latest.state, snapshot(2).state);
    }
}
