//! Event and command mechanics shared by the financing engine.
//!
//! - `Event` / `EventEnvelope`: immutable facts and their stream metadata
//! - `Command`: intent addressed to one aggregate stream
//! - `EventBus`: post-commit fan-out to notification relays, projections and
//!   realtime subscribers

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
