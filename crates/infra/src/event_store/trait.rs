use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use finflow_core::{AggregateId, ExpectedVersion, TenantId};
use finflow_events::EventEnvelope;
use std::sync::Arc;

/// A domain event wrapped with its stream metadata, not yet sequenced.
///
/// Built with [`UncommittedEvent::from_typed`] from the events an aggregate's
/// `handle` returned; the store assigns the sequence number on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A committed event at a fixed position of its stream.
///
/// Sequence numbers are per `(tenant_id, aggregate_id)`, start at 1 and never
/// have gaps; the last one is the stream version used for optimistic
/// concurrency on the next append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the stream (1-based).
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Decode the payload back into the aggregate's event enum.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Tenant-scoped envelope for the bus.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Event store failure (storage, concurrency, isolation).
///
/// Business rule violations never surface here; they are `DomainError`s
/// raised before anything is appended.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer appended to the stream since it was loaded.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// The backing database could not be reached or failed mid-operation.
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, tenant-scoped event store.
///
/// One stream per aggregate instance, keyed by `(tenant_id, aggregate_id)`.
///
/// `append` must:
/// - reject batches that mix tenants, aggregates or aggregate types
/// - check `expected_version` against the current stream version
/// - assign sequence numbers starting at `current_version + 1`
/// - persist the whole batch or nothing
///
/// `load_stream` returns the stream in sequence order, or an empty vector for
/// an aggregate that was never created.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }
}

/// Every event of one append must target the same stream.
pub(crate) fn validate_batch(events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    for (idx, e) in events.iter().enumerate() {
        if e.tenant_id != first.tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch contains multiple tenant_ids (index {idx})"
            )));
        }
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    Ok(())
}

impl UncommittedEvent {
    /// Serialize a typed domain event and capture its metadata.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: finflow_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
