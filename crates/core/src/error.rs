//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Every variant carries the specific business reason: callers in this domain
/// are financial actors who need to know *why* an action failed (expired,
/// already accepted, out of revisions) to decide what to do next.
///
/// Infrastructure concerns (storage, transport) belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input (amounts, dates, missing fields, KYC not approved).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A lifecycle transition is not allowed from the current status.
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// A discount offer cannot be created or acted on because of another offer.
    #[error("offer conflict: {0}")]
    OfferConflict(String),

    /// The discount offer passed its `expires_at`.
    #[error("offer expired: {0}")]
    OfferExpired(String),

    /// The negotiation chain used all of its revisions.
    #[error("revision limit exceeded: at most {max} offers per negotiation")]
    RevisionLimitExceeded { max: u8 },

    /// The financier already has a pending bid on the invoice.
    #[error("duplicate bid: {0}")]
    DuplicateBid(String),

    /// The bid passed its `valid_until`.
    #[error("bid expired: {0}")]
    BidExpired(String),

    /// A conflicting change already happened (re-fetch before retrying).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// The actor is not the party allowed to perform the action.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transition(
        entity: impl Into<String>,
        from: impl core::fmt::Display,
        to: impl core::fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn offer_conflict(msg: impl Into<String>) -> Self {
        Self::OfferConflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Stable machine-readable code (used in API error bodies and audit entries).
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::InvalidStateTransition { .. } => "invalid_state_transition",
            DomainError::OfferConflict(_) => "offer_conflict",
            DomainError::OfferExpired(_) => "offer_expired",
            DomainError::RevisionLimitExceeded { .. } => "revision_limit_exceeded",
            DomainError::DuplicateBid(_) => "duplicate_bid",
            DomainError::BidExpired(_) => "bid_expired",
            DomainError::Conflict(_) => "conflict",
            DomainError::InvariantViolation(_) => "invariant_violation",
            DomainError::InvalidId(_) => "invalid_id",
            DomainError::NotFound => "not_found",
            DomainError::Unauthorized(_) => "unauthorized",
        }
    }
}
