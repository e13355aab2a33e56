//! Financing contracts.
//!
//! A contract is generated once per accepted terms and is an immutable record
//! of what was agreed; only its status moves afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, PartyId, Rate, TenantId,
    ValueObject,
};
use finflow_events::{Command, Event};

use crate::ids::{ContractId, InvoiceId, TermsRef};
use crate::invoice::Invoice;
use crate::settlement::ContractType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Active,
    Completed,
    Cancelled,
}

impl ContractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractStatus::Active => "ACTIVE",
            ContractStatus::Completed => "COMPLETED",
            ContractStatus::Cancelled => "CANCELLED",
        }
    }
}

impl core::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agreed terms, frozen at generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    pub contract_number: String,
    pub contract_type: ContractType,
    pub invoice_id: InvoiceId,
    pub invoice_number: String,
    pub terms: TermsRef,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub financier: Option<PartyId>,
    pub invoice_amount: u64,
    pub discount_percentage: Rate,
    pub seller_receives: u64,
    pub financier_pays: Option<u64>,
    pub buyer_repays: u64,
    pub repayment_due_date: DateTime<Utc>,
    pub financier_rate: Option<Rate>,
    pub processing_fee: Option<Rate>,
    pub haircut_percentage: Option<Rate>,
}

impl ValueObject for ContractTerms {}

/// `FC-<invoice number>-<first 8 hex digits of the contract id>`.
pub fn contract_number(invoice_number: &str, contract_id: ContractId) -> String {
    let number: String = invoice_number
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '-' })
        .collect();
    let simple = contract_id.as_uuid().simple().to_string();
    format!("FC-{}-{}", number, simple[..8].to_ascii_uppercase())
}

impl Invoice {
    /// Contract id and terms for the accepted terms of this invoice.
    pub fn contract_terms(&self) -> DomainResult<(ContractId, ContractTerms)> {
        let plan = self.settlement_plan()?;
        let terms = self
            .accepted_terms()
            .ok_or_else(|| DomainError::conflict("invoice has no accepted terms"))?;
        let invoice_number = self
            .fields()
            .invoice_number
            .clone()
            .ok_or_else(|| DomainError::invariant("accepted invoice without number"))?;
        let contract_id = ContractId::for_terms(self.id_typed(), terms);

        Ok((
            contract_id,
            ContractTerms {
                contract_number: contract_number(&invoice_number, contract_id),
                contract_type: plan.contract_type,
                invoice_id: self.id_typed(),
                invoice_number,
                terms,
                seller: plan.seller,
                buyer: plan.buyer,
                financier: plan.financier,
                invoice_amount: plan.invoice_amount,
                discount_percentage: plan.discount,
                seller_receives: plan.seller_receives,
                financier_pays: plan.financier_pays,
                buyer_repays: plan.buyer_repays,
                repayment_due_date: plan.repayment_due_date,
                financier_rate: plan.financier_rate,
                processing_fee: plan.processing_fee,
                haircut_percentage: plan.haircut,
            },
        ))
    }
}

/// Aggregate root: Contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    id: ContractId,
    tenant_id: Option<TenantId>,
    terms: Option<ContractTerms>,
    status: ContractStatus,
    generated_at: Option<DateTime<Utc>>,
    status_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Contract {
    pub fn empty(id: ContractId) -> Self {
        Self {
            id,
            tenant_id: None,
            terms: None,
            status: ContractStatus::Active,
            generated_at: None,
            status_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ContractId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn terms(&self) -> Option<&ContractTerms> {
        self.terms.as_ref()
    }

    pub fn status(&self) -> ContractStatus {
        self.status
    }

    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        self.generated_at
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }
}

impl AggregateRoot for Contract {
    type Id = ContractId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: GenerateContract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateContract {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub terms: ContractTerms,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteContract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteContract {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelContract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelContract {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCommand {
    GenerateContract(GenerateContract),
    CompleteContract(CompleteContract),
    CancelContract(CancelContract),
}

impl Command for ContractCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            ContractCommand::GenerateContract(c) => c.contract_id.0,
            ContractCommand::CompleteContract(c) => c.contract_id.0,
            ContractCommand::CancelContract(c) => c.contract_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractGenerated {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub terms: ContractTerms,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCompleted {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCancelled {
    pub tenant_id: TenantId,
    pub contract_id: ContractId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractEvent {
    ContractGenerated(ContractGenerated),
    ContractCompleted(ContractCompleted),
    ContractCancelled(ContractCancelled),
}

impl Event for ContractEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ContractEvent::ContractGenerated(_) => "financing.contract.generated",
            ContractEvent::ContractCompleted(_) => "financing.contract.completed",
            ContractEvent::ContractCancelled(_) => "financing.contract.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ContractEvent::ContractGenerated(e) => e.occurred_at,
            ContractEvent::ContractCompleted(e) => e.occurred_at,
            ContractEvent::ContractCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Contract {
    type Command = ContractCommand;
    type Event = ContractEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "financing.contract";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ContractEvent::ContractGenerated(e) => {
                self.id = e.contract_id;
                self.tenant_id = Some(e.tenant_id);
                self.terms = Some(e.terms.clone());
                self.generated_at = Some(e.occurred_at);
                self.status = ContractStatus::Active;
                self.created = true;
            }
            ContractEvent::ContractCompleted(_) => {
                self.status = ContractStatus::Completed;
            }
            ContractEvent::ContractCancelled(e) => {
                self.status_reason = e.reason.clone();
                self.status = ContractStatus::Cancelled;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ContractCommand::GenerateContract(cmd) => self.handle_generate(cmd),
            ContractCommand::CompleteContract(cmd) => self.handle_complete(cmd),
            ContractCommand::CancelContract(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Contract {
    fn ensure_target(&self, tenant_id: TenantId, contract_id: ContractId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != contract_id {
            return Err(DomainError::invariant("contract_id mismatch"));
        }
        Ok(())
    }

    fn handle_generate(&self, cmd: &GenerateContract) -> Result<Vec<ContractEvent>, DomainError> {
        if cmd.contract_id != ContractId::for_terms(cmd.terms.invoice_id, cmd.terms.terms) {
            return Err(DomainError::invariant(
                "contract_id does not derive from invoice and accepted terms",
            ));
        }
        if self.created {
            self.ensure_target(cmd.tenant_id, cmd.contract_id)?;
            // Regeneration for the same acceptance returns the existing contract.
            return if self.terms.as_ref() == Some(&cmd.terms) {
                Ok(vec![])
            } else {
                Err(DomainError::conflict("contract terms are immutable"))
            };
        }
        if cmd.terms.terms.contract_type() != cmd.terms.contract_type {
            return Err(DomainError::invariant(
                "contract type does not match the accepted terms",
            ));
        }

        Ok(vec![ContractEvent::ContractGenerated(ContractGenerated {
            tenant_id: cmd.tenant_id,
            contract_id: cmd.contract_id,
            terms: cmd.terms.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.contract_id)?;
        match self.status {
            ContractStatus::Completed => Ok(vec![]),
            ContractStatus::Cancelled => Err(DomainError::transition(
                "contract",
                self.status,
                ContractStatus::Completed,
            )),
            ContractStatus::Active => Ok(vec![ContractEvent::ContractCompleted(
                ContractCompleted {
                    tenant_id: cmd.tenant_id,
                    contract_id: cmd.contract_id,
                    occurred_at: cmd.occurred_at,
                },
            )]),
        }
    }

    fn handle_cancel(&self, cmd: &CancelContract) -> Result<Vec<ContractEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.contract_id)?;
        match self.status {
            ContractStatus::Cancelled => Ok(vec![]),
            ContractStatus::Completed => Err(DomainError::transition(
                "contract",
                self.status,
                ContractStatus::Cancelled,
            )),
            ContractStatus::Active => Ok(vec![ContractEvent::ContractCancelled(
                ContractCancelled {
                    tenant_id: cmd.tenant_id,
                    contract_id: cmd.contract_id,
                    reason: cmd.reason.clone(),
                    occurred_at: cmd.occurred_at,
                },
            )]),
        }
    }
}
