//! Ports to collaborators outside the financing engine, with in-memory
//! adapters for tests and the single-process API.
//!
//! The engine never holds a stream lock while calling any of these: lookups
//! happen before a command is decided, notifications and audit entries after
//! it committed.

pub mod audit;
pub mod kyc;
pub mod notification;
pub mod profile;

pub use audit::{AuditAction, AuditEntry, AuditLog, InMemoryAuditLog};
pub use kyc::{InMemoryKycService, KycService, KycStatus};
pub use notification::{
    InMemoryNotificationSink, Notification, NotificationKind, NotificationSink,
};
pub use profile::{BankAccount, InMemoryProfileService, ProfileService};

use thiserror::Error;

/// Failure of an external collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// The service could not be reached or timed out.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// The service answered but refused the request.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

impl ExternalError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            service,
            message: message.into(),
        }
    }
}
