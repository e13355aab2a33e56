//! Append-only event store boundary.
//!
//! Tenant-scoped streams with optimistic concurrency; no storage assumptions
//! beyond what [`EventStore`] promises. [`InMemoryEventStore`] backs tests and
//! local runs, [`PostgresEventStore`] persists across restarts.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventFilter, EventQuery, EventQueryResult, Pagination};
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// A store that can both append and answer history queries; what the API
/// holds, whichever backend is configured.
pub trait EventLog: EventStore + EventQuery {}

impl<T: EventStore + EventQuery + ?Sized> EventLog for T {}
