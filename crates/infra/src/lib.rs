//! Infrastructure layer: event store, dispatching, read models, external
//! collaborators, and the financing engine that ties them together.

pub mod command_dispatcher;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod external;
pub mod projections;
pub mod read_model;
pub mod workers;

#[cfg(test)]
mod integration_tests;
