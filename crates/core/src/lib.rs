//! `finflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the financing
//! engine (no infrastructure concerns, no clocks, no IO).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod rate;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, PartyId, TenantId};
pub use rate::Rate;
pub use value_object::ValueObject;
