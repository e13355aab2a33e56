use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use finflow_core::{PartyId, TenantId};

use super::ExternalError;

/// Audited action on a financing entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submit,
    Accept,
    Reject,
    Withdraw,
    Cancel,
    Disburse,
    Repay,
    Default,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Submit => "submit",
            AuditAction::Accept => "accept",
            AuditAction::Reject => "reject",
            AuditAction::Withdraw => "withdraw",
            AuditAction::Cancel => "cancel",
            AuditAction::Disburse => "disburse",
            AuditAction::Repay => "repay",
            AuditAction::Default => "default",
        }
    }
}

/// Immutable audit record.
///
/// `actor` is `None` for actions the engine takes on its own (expiry sweep,
/// settlement follow-ups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    pub actor: Option<PartyId>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub at: DateTime<Utc>,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry) -> Result<(), ExternalError>;
}

impl<L: AuditLog + ?Sized> AuditLog for std::sync::Arc<L> {
    fn record(&self, entry: AuditEntry) -> Result<(), ExternalError> {
        (**self).record(entry)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, tenant_id: TenantId, entity_id: Uuid) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.tenant_id == tenant_id && e.entity_id == entity_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entries(&self, tenant_id: TenantId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<(), ExternalError> {
        self.entries
            .lock()
            .map_err(|_| ExternalError::unavailable("audit log", "lock poisoned"))?
            .push(entry);
        Ok(())
    }
}
