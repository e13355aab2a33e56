//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the stream (tenant-scoped) and check it is well-formed
//!   ↓
//! 2. Rehydrate the aggregate from history
//!   ↓
//! 3. handle(command) → events (pure; empty means "already done")
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 5. Publish committed envelopes to the bus
//! ```
//!
//! Step 4 is the single-writer-per-stream guarantee: two commands decided on
//! the same version race on the append and exactly one of them commits. The
//! loser gets [`DispatchError::Concurrency`]; append-only submissions (offers,
//! bids) go through [`CommandDispatcher::dispatch_retrying`], which reloads
//! and decides again instead of surfacing the conflict.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use finflow_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use finflow_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The aggregate rejected the command; carries the business reason.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The stream moved between load and append.
    #[error("optimistic concurrency conflict: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error("event store failure: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append (events are committed).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl DispatchError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            DispatchError::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of a dispatched command.
///
/// `before` and `after` are the aggregate as loaded and as it stands after the
/// committed events; they are equal when the command was a no-op.
#[derive(Debug, Clone)]
pub struct Dispatched<A> {
    pub before: A,
    pub after: A,
    pub committed: Vec<StoredEvent>,
}

impl<A> Dispatched<A> {
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Reusable command execution engine over any `EventStore` + `EventBus`.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Rehydrate an aggregate without deciding anything.
    ///
    /// Returns the empty instance from `make_aggregate` when the stream does
    /// not exist yet.
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Dispatch a command through the full pipeline once.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Clone,
        A::Event: finflow_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history(&mut aggregate, &history)?;
        let before = aggregate.clone();

        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                %aggregate_id,
                "command was a no-op"
            );
            return Ok(Dispatched {
                after: before.clone(),
                before,
                committed: vec![],
            });
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    A::AGGREGATE_TYPE,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(Dispatched {
            before,
            after: aggregate,
            committed,
        })
    }

    /// Like [`dispatch`](Self::dispatch), but reloads and decides again on a
    /// concurrency conflict, up to `max_retries` extra attempts.
    ///
    /// Domain errors are never retried: the re-decided command sees the state
    /// that won the race and fails (or no-ops) on its own merits.
    pub fn dispatch_retrying<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        command: A::Command,
        max_retries: u32,
        make_aggregate: impl Fn(TenantId, AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError> + Clone,
        A::Event: finflow_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            match self.dispatch(tenant_id, aggregate_id, command.clone(), &make_aggregate) {
                Err(err) if err.is_concurrency() && attempt < max_retries => {
                    attempt += 1;
                    debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        %aggregate_id,
                        attempt,
                        "retrying after concurrency conflict"
                    );
                }
                other => return other,
            }
        }
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    // validate_loaded_stream already guarantees sequence order.
    for stored in history {
        let ev: A::Event = stored.decode().map_err(|e| {
            DispatchError::Deserialize(format!(
                "{} #{}: {e}",
                stored.event_type, stored.sequence_number
            ))
        })?;
        aggregate.apply(&ev);
    }

    Ok(())
}
