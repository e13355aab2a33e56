//! Postgres-backed event store.
//!
//! Same contract as [`InMemoryEventStore`](super::InMemoryEventStore): one
//! append-only stream per `(tenant_id, aggregate_id)`, optimistic concurrency
//! on the stream version, whole batch or nothing.
//!
//! ## Locking
//!
//! `append` runs in one transaction that first takes a transaction-scoped
//! advisory lock on the stream, so two writers racing on the same invoice are
//! serialized and the loser fails the version check. The unique constraint on
//! `(tenant_id, aggregate_id, sequence_number)` backs this up.
//!
//! ## Error mapping
//!
//! | sqlx error | SQLSTATE | `EventStoreError` |
//! |------------|----------|-------------------|
//! | Database, unique violation | `23505` | `Concurrency` |
//! | Database, connection or shutdown | `08xxx`, `57Pxx` | `Unavailable` |
//! | Database, any other code | | `InvalidAppend` |
//! | Pool timeout, closed pool, I/O, TLS, protocol | | `Unavailable` |
//! | Row decoding | | `InvalidAppend` |
//!
//! ## Runtime
//!
//! The [`EventStore`] trait is synchronous and is called from axum handlers
//! and worker threads alike. The store owns a small tokio runtime, spawns each
//! query on it and waits on a channel, so callers never nest `block_on`
//! inside another runtime.

use std::future::Future;
use std::sync::mpsc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, instrument};

use finflow_core::{AggregateId, ExpectedVersion, TenantId};

use super::query::{EventFilter, EventQuery, EventQueryResult, Pagination};
use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

/// Schema the store expects; applied by [`PostgresEventStore::migrate`].
pub const SCHEMA: &str = include_str!("../../migrations/0001_events.sql");

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "event_id, tenant_id, aggregate_id, aggregate_type, \
     sequence_number, event_type, event_version, occurred_at, payload";

const FILTER_CLAUSE: &str = "tenant_id = $1 \
     AND ($2::uuid IS NULL OR aggregate_id = $2) \
     AND ($3::text IS NULL OR aggregate_type = $3) \
     AND ($4::text IS NULL OR event_type = $4) \
     AND ($5::timestamptz IS NULL OR occurred_at > $5) \
     AND ($6::timestamptz IS NULL OR occurred_at < $6)";

/// Postgres-backed append-only event store.
#[derive(Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl PostgresEventStore {
    /// Connect with a pool of at most `max_connections`.
    pub fn connect(url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("finflow-pg")
            .enable_all()
            .build()
            .map_err(|e| EventStoreError::Unavailable(format!("database runtime: {e}")))?;
        let handle = runtime.handle().clone();

        let options = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT);
        let url = url.to_string();
        let connected = run_on(&handle, async move {
            options
                .connect(&url)
                .await
                .map_err(|e| map_sqlx_error("connect", e))
        });
        let pool = match connected {
            Ok(pool) => pool,
            Err(err) => {
                runtime.shutdown_background();
                return Err(err);
            }
        };

        debug!(max_connections, "postgres event store connected");
        Ok(Self {
            pool,
            handle,
            runtime: Some(runtime),
        })
    }

    /// Create the `events` table and its indexes if they are missing.
    pub fn migrate(&self) -> Result<(), EventStoreError> {
        let pool = self.pool.clone();
        self.run(async move {
            sqlx::raw_sql(SCHEMA)
                .execute(&pool)
                .await
                .map(|_| ())
                .map_err(|e| map_sqlx_error("migrate", e))
        })
    }

    fn run<T, F>(&self, fut: F) -> Result<T, EventStoreError>
    where
        F: Future<Output = Result<T, EventStoreError>> + Send + 'static,
        T: Send + 'static,
    {
        run_on(&self.handle, fut)
    }
}

impl Drop for PostgresEventStore {
    fn drop(&mut self) {
        // Safe to call from inside another runtime, unlike dropping it.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn run_on<T, F>(handle: &Handle, fut: F) -> Result<T, EventStoreError>
where
    F: Future<Output = Result<T, EventStoreError>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .map_err(|_| EventStoreError::Unavailable("database runtime stopped".to_string()))?
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&events)?;
        let pool = self.pool.clone();
        self.run(async move { append_events(pool, events, expected_version).await })
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let pool = self.pool.clone();
        self.run(async move { load_stream(pool, tenant_id, aggregate_id).await })
    }
}

impl EventQuery for PostgresEventStore {
    fn query_events(
        &self,
        tenant_id: TenantId,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        self.run(async move { query_events(pool, tenant_id, filter, pagination).await })
    }
}

#[instrument(
    skip(pool, events),
    fields(
        tenant_id = %events[0].tenant_id,
        aggregate_id = %events[0].aggregate_id,
        event_count = events.len(),
        expected_version = ?expected_version
    ),
    err
)]
async fn append_events(
    pool: PgPool,
    events: Vec<UncommittedEvent>,
    expected_version: ExpectedVersion,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    let (tenant_id, aggregate_id) = (events[0].tenant_id, events[0].aggregate_id);
    let aggregate_type = events[0].aggregate_type.clone();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin", e))?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(stream_lock_key(tenant_id, aggregate_id))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream", e))?;

    let (current_version, existing_type) = stream_head(&mut tx, tenant_id, aggregate_id).await?;

    // Returning early drops `tx`, which rolls it back.
    if let Some(existing) = existing_type {
        if existing != aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
            )));
        }
    }
    if !expected_version.matches(current_version) {
        return Err(EventStoreError::Concurrency(format!(
            "expected {expected_version:?}, found {current_version}"
        )));
    }

    let mut committed = Vec::with_capacity(events.len());
    for (event, sequence_number) in events.into_iter().zip(current_version + 1..) {
        sqlx::query(
            "INSERT INTO events (event_id, tenant_id, aggregate_id, aggregate_type, \
             sequence_number, event_type, event_version, occurred_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event.event_id)
        .bind(*tenant_id.as_uuid())
        .bind(*aggregate_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(to_i64(sequence_number)?)
        .bind(event.event_version as i32)
        .bind(event.occurred_at)
        .bind(&event.payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        committed.push(StoredEvent {
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            sequence_number,
            event_type: event.event_type,
            event_version: event.event_version,
            occurred_at: event.occurred_at,
            payload: event.payload,
        });
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit", e))?;
    Ok(committed)
}

async fn stream_head(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        "SELECT MAX(sequence_number) AS current_version, MAX(aggregate_type) AS aggregate_type \
         FROM events WHERE tenant_id = $1 AND aggregate_id = $2",
    )
    .bind(*tenant_id.as_uuid())
    .bind(*aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("stream_head", e))?;

    let version: Option<i64> = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("stream_head", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("stream_head", e))?;
    Ok((version.unwrap_or(0).max(0) as u64, aggregate_type))
}

#[instrument(skip(pool), err)]
async fn load_stream(
    pool: PgPool,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM events \
         WHERE tenant_id = $1 AND aggregate_id = $2 ORDER BY sequence_number ASC"
    ))
    .bind(*tenant_id.as_uuid())
    .bind(*aggregate_id.as_uuid())
    .fetch_all(&pool)
    .await
    .map_err(|e| map_sqlx_error("load_stream", e))?;

    rows.iter().map(stored_event).collect()
}

#[instrument(skip(pool, filter), err)]
async fn query_events(
    pool: PgPool,
    tenant_id: TenantId,
    filter: EventFilter,
    pagination: Pagination,
) -> Result<EventQueryResult, EventStoreError> {
    let aggregate_id = filter.aggregate_id.map(|id| *id.as_uuid());

    let total: i64 = sqlx::query(&format!(
        "SELECT COUNT(*) AS total FROM events WHERE {FILTER_CLAUSE}"
    ))
    .bind(*tenant_id.as_uuid())
    .bind(aggregate_id)
    .bind(filter.aggregate_type.as_deref())
    .bind(filter.event_type.as_deref())
    .bind(filter.occurred_after)
    .bind(filter.occurred_before)
    .fetch_one(&pool)
    .await
    .and_then(|row| row.try_get("total"))
    .map_err(|e| map_sqlx_error("count_events", e))?;

    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM events WHERE {FILTER_CLAUSE} \
         ORDER BY occurred_at ASC, aggregate_id ASC, sequence_number ASC \
         LIMIT $7 OFFSET $8"
    ))
    .bind(*tenant_id.as_uuid())
    .bind(aggregate_id)
    .bind(filter.aggregate_type.as_deref())
    .bind(filter.event_type.as_deref())
    .bind(filter.occurred_after)
    .bind(filter.occurred_before)
    .bind(i64::from(pagination.limit))
    .bind(i64::from(pagination.offset))
    .fetch_all(&pool)
    .await
    .map_err(|e| map_sqlx_error("query_events", e))?;

    let events = rows
        .iter()
        .map(stored_event)
        .collect::<Result<Vec<_>, _>>()?;
    let total = total.max(0) as u64;
    let has_more = u64::from(pagination.offset) + (events.len() as u64) < total;

    Ok(EventQueryResult {
        events,
        total,
        pagination,
        has_more,
    })
}

fn stored_event(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::InvalidAppend(format!("bad event row: {e}"));
    let sequence_number: i64 = row.try_get("sequence_number").map_err(decode)?;
    let event_version: i32 = row.try_get("event_version").map_err(decode)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode)?;

    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(decode)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        sequence_number: u64::try_from(sequence_number).map_err(|_| {
            EventStoreError::InvalidAppend(format!("negative sequence number {sequence_number}"))
        })?,
        event_type: row.try_get("event_type").map_err(decode)?,
        event_version: u32::try_from(event_version).map_err(|_| {
            EventStoreError::InvalidAppend(format!("negative event version {event_version}"))
        })?,
        occurred_at,
        payload: row.try_get("payload").map_err(decode)?,
    })
}

fn to_i64(sequence_number: u64) -> Result<i64, EventStoreError> {
    i64::try_from(sequence_number).map_err(|_| {
        EventStoreError::InvalidAppend(format!("sequence number {sequence_number} out of range"))
    })
}

/// Advisory lock key of one stream. Collisions only serialize unrelated
/// writers, they never let two writers into the same stream.
fn stream_lock_key(tenant_id: TenantId, aggregate_id: AggregateId) -> i64 {
    let (_, tenant_low) = tenant_id.as_uuid().as_u64_pair();
    let (_, aggregate_low) = aggregate_id.as_uuid().as_u64_pair();
    (aggregate_low ^ tenant_low.rotate_left(17)) as i64
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("{operation}: {}", db_err.message());
            classify_sqlstate(db_err.code().as_deref(), message)
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => {
            EventStoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => EventStoreError::InvalidAppend(format!("{operation}: {other}")),
    }
}

fn classify_sqlstate(code: Option<&str>, message: String) -> EventStoreError {
    match code {
        // unique_violation: another writer took the sequence number.
        Some("23505") => EventStoreError::Concurrency(message),
        // Connection exceptions and admin shutdown.
        Some(c) if c.starts_with("08") || c.starts_with("57P") => {
            EventStoreError::Unavailable(message)
        }
        _ => EventStoreError::InvalidAppend(message),
    }
}
