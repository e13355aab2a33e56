use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use finflow_core::{PartyId, TenantId};
use finflow_financing::BankAccountRef;

use super::ExternalError;
use crate::read_model::{InMemoryTenantStore, TenantStore};

/// A bank account as held by the profile service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub account_id: String,
    pub holder: PartyId,
    pub account_number: String,
    pub ifsc: String,
    pub bank_name: String,
    pub verified: bool,
    pub primary: bool,
}

impl BankAccount {
    /// Masked reference safe to keep in a disbursement record.
    pub fn to_ref(&self) -> BankAccountRef {
        let digits: Vec<char> = self.account_number.chars().collect();
        let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
        BankAccountRef {
            account_id: self.account_id.clone(),
            holder: self.holder,
            masked_number: format!("XXXX{tail}"),
            ifsc: self.ifsc.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Profile {
    display_name: Option<String>,
    accounts: Vec<BankAccount>,
}

/// Bank-account and profile lookups.
pub trait ProfileService: Send + Sync {
    fn list_bank_accounts(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Vec<BankAccount>, ExternalError>;

    /// The account the party selected as primary, if any.
    fn primary(&self, tenant_id: TenantId, party: PartyId)
    -> Result<Option<BankAccount>, ExternalError>;

    fn display_name(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Option<String>, ExternalError>;
}

impl<P: ProfileService + ?Sized> ProfileService for std::sync::Arc<P> {
    fn list_bank_accounts(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Vec<BankAccount>, ExternalError> {
        (**self).list_bank_accounts(tenant_id, party)
    }

    fn primary(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Option<BankAccount>, ExternalError> {
        (**self).primary(tenant_id, party)
    }

    fn display_name(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Option<String>, ExternalError> {
        (**self).display_name(tenant_id, party)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileService {
    profiles: InMemoryTenantStore<PartyId, Profile>,
    offline: AtomicBool,
}

impl InMemoryProfileService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_display_name(&self, tenant_id: TenantId, party: PartyId, name: impl Into<String>) {
        let name = name.into();
        self.profiles.update(tenant_id, party, &mut |cur| {
            let mut profile = cur.cloned().unwrap_or_default();
            profile.display_name = Some(name.clone());
            Some(profile)
        });
    }

    /// Simulate an outage: bank-account lookups fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Add an account; marking it primary demotes the previous primary.
    pub fn add_bank_account(&self, tenant_id: TenantId, account: BankAccount) {
        self.profiles.update(tenant_id, account.holder, &mut |cur| {
            let mut profile = cur.cloned().unwrap_or_default();
            if account.primary {
                for existing in &mut profile.accounts {
                    existing.primary = false;
                }
            }
            profile
                .accounts
                .retain(|a| a.account_id != account.account_id);
            profile.accounts.push(account.clone());
            Some(profile)
        });
    }
}

impl ProfileService for InMemoryProfileService {
    fn list_bank_accounts(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Vec<BankAccount>, ExternalError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable {
                service: "profile",
                message: "bank account lookup timed out".to_string(),
            });
        }
        Ok(self
            .profiles
            .get(tenant_id, &party)
            .map(|p| p.accounts)
            .unwrap_or_default())
    }

    fn primary(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Option<BankAccount>, ExternalError> {
        Ok(self
            .list_bank_accounts(tenant_id, party)?
            .into_iter()
            .find(|a| a.primary))
    }

    fn display_name(
        &self,
        tenant_id: TenantId,
        party: PartyId,
    ) -> Result<Option<String>, ExternalError> {
        Ok(self
            .profiles
            .get(tenant_id, &party)
            .and_then(|p| p.display_name))
    }
}
