use std::collections::HashMap;
use std::sync::RwLock;

use finflow_core::{AggregateId, ExpectedVersion, TenantId};

use super::query::{EventFilter, EventQuery, EventQueryResult, Pagination};
use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// A single `RwLock` over all streams: the version check and the push happen
/// under the same write guard, so two writers racing on one invoice cannot
/// both commit.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::InvalidAppend("event store lock poisoned".to_string())
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };

        let tenant_id = first.tenant_id;
        let aggregate_id = first.aggregate_id;
        let aggregate_type = first.aggregate_type.clone();
        validate_batch(&events)?;

        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let mut streams = self.streams.write().map_err(|_| Self::poisoned())?;
        let stream = streams.entry(key).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                tenant_id: e.tenant_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();
        stream.extend(committed.iter().cloned());

        Ok(committed)
    }

    fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self.streams.read().map_err(|_| Self::poisoned())?;
        Ok(streams.get(&key).cloned().unwrap_or_default())
    }
}

impl EventQuery for InMemoryEventStore {
    fn query_events(
        &self,
        tenant_id: TenantId,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let streams = self.streams.read().map_err(|_| Self::poisoned())?;

        let mut matching: Vec<StoredEvent> = streams
            .iter()
            .filter(|(key, _)| key.tenant_id == tenant_id)
            .flat_map(|(_, stream)| stream.iter())
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        drop(streams);

        matching.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.aggregate_id.as_uuid().cmp(b.aggregate_id.as_uuid()))
                .then(a.sequence_number.cmp(&b.sequence_number))
        });

        Ok(EventQueryResult::page(matching, pagination))
    }
}
