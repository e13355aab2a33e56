//! Entity trait: identity + continuity across state changes.
//!
//! Offers and bids are entities owned by the invoice aggregate: they change
//! status over time but keep their identity.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Whether the entity can still change status.
    fn is_open(&self) -> bool;
}
