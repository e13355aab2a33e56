use serde::{Deserialize, Serialize};

use finflow_core::{PartyId, TenantId};

use super::ExternalError;
use crate::read_model::{InMemoryTenantStore, TenantStore};

/// KYC review outcome as reported by the KYC collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KycStatus {
    Pending,
    Approved,
    Rejected,
}

pub trait KycService: Send + Sync {
    fn is_approved(&self, tenant_id: TenantId, party: PartyId) -> Result<bool, ExternalError>;
}

impl<K: KycService + ?Sized> KycService for std::sync::Arc<K> {
    fn is_approved(&self, tenant_id: TenantId, party: PartyId) -> Result<bool, ExternalError> {
        (**self).is_approved(tenant_id, party)
    }
}

/// Parties without a recorded review are not approved.
#[derive(Debug, Default)]
pub struct InMemoryKycService {
    statuses: InMemoryTenantStore<PartyId, KycStatus>,
}

impl InMemoryKycService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, tenant_id: TenantId, party: PartyId, status: KycStatus) {
        self.statuses.upsert(tenant_id, party, status);
    }

    pub fn approve(&self, tenant_id: TenantId, party: PartyId) {
        self.set_status(tenant_id, party, KycStatus::Approved);
    }
}

impl KycService for InMemoryKycService {
    fn is_approved(&self, tenant_id: TenantId, party: PartyId) -> Result<bool, ExternalError> {
        Ok(self.statuses.get(tenant_id, &party) == Some(KycStatus::Approved))
    }
}
