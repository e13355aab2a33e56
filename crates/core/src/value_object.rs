//! Value object trait: equality by value, not identity.
//!
//! Rates, settlement breakdowns and contract terms are value objects: two
//! settlement breakdowns with the same numbers are the same breakdown, and a
//! "changed" breakdown is always a new value.

/// Marker trait for immutable values compared by their attributes.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
