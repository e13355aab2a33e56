//! Financing engine: application services over the financing aggregates.
//!
//! Every operation follows the same shape:
//!
//! ```text
//! collaborator lookups (KYC, bank accounts)      no stream is held
//!   ↓
//! CommandDispatcher::dispatch                     one stream, one append
//!   ↓
//! audit entry + follow-up commands                only after the commit
//! ```
//!
//! The Settlement Orchestrator (`settlement`) chains the follow-ups across
//! streams: accepted terms → contract + disbursement → financed → repayment
//! → repaid. Each step is idempotent, so a step that failed half way is
//! finished by calling [`FinancingEngine::resume_settlement`] again.

pub mod clock;

mod auction;
mod lifecycle;
mod maintenance;
mod negotiation;
mod settlement;

pub use auction::BidTerms;
pub use clock::{Clock, ManualClock, SystemClock};
pub use maintenance::ResumeOutcome;
pub use settlement::Settlement;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use finflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, PartyId, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    Contract, ContractCommand, ContractId, Disbursement, DisbursementCommand, DisbursementId,
    Invoice, InvoiceCommand, InvoiceId, Repayment, RepaymentCommand, RepaymentId,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
use crate::config::EngineConfig;
use crate::event_store::EventStore;
use crate::external::{AuditAction, AuditEntry, AuditLog, ExternalError, KycService, ProfileService};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Disbursement cannot start without a verified primary account.
    #[error("{role} {party} has no verified primary bank account")]
    MissingBankAccount { party: PartyId, role: &'static str },

    #[error("{role} KYC is not approved")]
    KycNotApproved { role: &'static str },

    #[error(transparent)]
    ExternalService(#[from] ExternalError),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::Dispatch(DispatchError::Domain(value))
    }
}

impl EngineError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Dispatch(e) => e.domain(),
            _ => None,
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, EngineError::Dispatch(e) if e.is_concurrency())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Dispatch(DispatchError::Domain(e)) => e.code(),
            EngineError::Dispatch(DispatchError::Concurrency(_)) => "concurrency_conflict",
            EngineError::Dispatch(DispatchError::TenantIsolation(_)) => "tenant_isolation",
            EngineError::Dispatch(_) => "internal_error",
            EngineError::MissingBankAccount { .. } => "missing_bank_account",
            EngineError::KycNotApproved { .. } => "kyc_not_approved",
            EngineError::ExternalService(_) => "external_service_error",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Collaborators the engine calls out to.
#[derive(Clone)]
pub struct EngineServices {
    pub kyc: Arc<dyn KycService>,
    pub profiles: Arc<dyn ProfileService>,
    pub audit: Arc<dyn AuditLog>,
}

pub struct FinancingEngine<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    services: EngineServices,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S, B> FinancingEngine<S, B> {
    pub fn new(
        dispatcher: CommandDispatcher<S, B>,
        services: EngineServices,
        config: EngineConfig,
    ) -> Self {
        Self {
            dispatcher,
            services,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Current state of an invoice; `NotFound` if it was never drafted in
    /// this tenant.
    pub fn invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> EngineResult<Invoice> {
        let invoice = self.dispatcher.load(tenant_id, invoice_id.0, invoice_stream)?;
        if !invoice.is_created() {
            return Err(DomainError::not_found().into());
        }
        Ok(invoice)
    }

    pub fn contract(&self, tenant_id: TenantId, contract_id: ContractId) -> EngineResult<Contract> {
        let contract = self.dispatcher.load(tenant_id, contract_id.0, contract_stream)?;
        if !contract.is_created() {
            return Err(DomainError::not_found().into());
        }
        Ok(contract)
    }

    pub fn disbursement(
        &self,
        tenant_id: TenantId,
        disbursement_id: DisbursementId,
    ) -> EngineResult<Disbursement> {
        let disbursement =
            self.dispatcher
                .load(tenant_id, disbursement_id.0, disbursement_stream)?;
        if !disbursement.is_created() {
            return Err(DomainError::not_found().into());
        }
        Ok(disbursement)
    }

    pub fn repayment(
        &self,
        tenant_id: TenantId,
        repayment_id: RepaymentId,
    ) -> EngineResult<Repayment> {
        let repayment = self
            .dispatcher
            .load(tenant_id, repayment_id.0, repayment_stream)?;
        if !repayment.is_created() {
            return Err(DomainError::not_found().into());
        }
        Ok(repayment)
    }

    // Loads that tolerate a missing stream, for orchestration decisions.

    fn load_contract(&self, tenant_id: TenantId, id: ContractId) -> EngineResult<Contract> {
        Ok(self.dispatcher.load(tenant_id, id.0, contract_stream)?)
    }

    fn load_disbursement(
        &self,
        tenant_id: TenantId,
        id: DisbursementId,
    ) -> EngineResult<Disbursement> {
        Ok(self.dispatcher.load(tenant_id, id.0, disbursement_stream)?)
    }

    fn load_repayment(&self, tenant_id: TenantId, id: RepaymentId) -> EngineResult<Repayment> {
        Ok(self.dispatcher.load(tenant_id, id.0, repayment_stream)?)
    }

    /// Single attempt; a lost race surfaces as a concurrency conflict.
    fn on_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        command: InvoiceCommand,
    ) -> EngineResult<Dispatched<Invoice>> {
        Ok(self
            .dispatcher
            .dispatch(tenant_id, invoice_id.0, command, invoice_stream)?)
    }

    /// Re-decides on conflict. For append-only submissions and for
    /// follow-ups the engine issues on its own.
    fn on_invoice_retrying(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        command: InvoiceCommand,
    ) -> EngineResult<Dispatched<Invoice>> {
        Ok(self.dispatcher.dispatch_retrying(
            tenant_id,
            invoice_id.0,
            command,
            self.config.dispatch_retries,
            invoice_stream,
        )?)
    }

    fn on_contract(
        &self,
        tenant_id: TenantId,
        contract_id: ContractId,
        command: ContractCommand,
    ) -> EngineResult<Dispatched<Contract>> {
        Ok(self.dispatcher.dispatch_retrying(
            tenant_id,
            contract_id.0,
            command,
            self.config.dispatch_retries,
            contract_stream,
        )?)
    }

    fn on_disbursement(
        &self,
        tenant_id: TenantId,
        disbursement_id: DisbursementId,
        command: DisbursementCommand,
    ) -> EngineResult<Dispatched<Disbursement>> {
        Ok(self.dispatcher.dispatch_retrying(
            tenant_id,
            disbursement_id.0,
            command,
            self.config.dispatch_retries,
            disbursement_stream,
        )?)
    }

    fn on_repayment(
        &self,
        tenant_id: TenantId,
        repayment_id: RepaymentId,
        command: RepaymentCommand,
    ) -> EngineResult<Dispatched<Repayment>> {
        Ok(self.dispatcher.dispatch_retrying(
            tenant_id,
            repayment_id.0,
            command,
            self.config.dispatch_retries,
            repayment_stream,
        )?)
    }

    /// Record an audit entry for a committed change. No-ops are not audited
    /// and a failing audit log never undoes a commit.
    fn audit<A: Audited>(
        &self,
        tenant_id: TenantId,
        actor: Option<PartyId>,
        action: AuditAction,
        dispatched: &Dispatched<A>,
    ) {
        if dispatched.is_noop() {
            return;
        }
        let entry = AuditEntry {
            tenant_id,
            actor,
            action,
            entity_type: A::ENTITY_TYPE.to_string(),
            entity_id: dispatched.after.entity_id(),
            at: self.now(),
            before: dispatched.before.snapshot(),
            after: dispatched.after.snapshot(),
        };
        if let Err(err) = self.services.audit.record(entry) {
            warn!(
                %tenant_id,
                entity_type = A::ENTITY_TYPE,
                action = action.as_str(),
                error = %err,
                "audit entry was not recorded"
            );
        }
    }
}

fn invoice_stream(_: TenantId, id: AggregateId) -> Invoice {
    Invoice::empty(InvoiceId::new(id))
}

fn contract_stream(_: TenantId, id: AggregateId) -> Contract {
    Contract::empty(ContractId::new(id))
}

fn disbursement_stream(_: TenantId, id: AggregateId) -> Disbursement {
    Disbursement::empty(DisbursementId::new(id))
}

fn repayment_stream(_: TenantId, id: AggregateId) -> Repayment {
    Repayment::empty(RepaymentId::new(id))
}

/// Before/after snapshot shape stored in audit entries.
trait Audited: Aggregate {
    const ENTITY_TYPE: &'static str;

    fn entity_id(&self) -> Uuid;
    fn created(&self) -> bool;
    fn audit_fields(&self) -> JsonValue;

    fn snapshot(&self) -> Option<JsonValue> {
        if !self.created() {
            return None;
        }
        let mut value = self.audit_fields();
        if let Some(map) = value.as_object_mut() {
            map.insert("version".to_string(), json!(self.version()));
        }
        Some(value)
    }
}

impl Audited for Invoice {
    const ENTITY_TYPE: &'static str = "invoice";

    fn entity_id(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn created(&self) -> bool {
        self.is_created()
    }

    fn audit_fields(&self) -> JsonValue {
        json!({
            "status": self.status(),
            "accepted_terms": self.accepted_terms(),
            "status_reason": self.status_reason(),
        })
    }
}

impl Audited for Contract {
    const ENTITY_TYPE: &'static str = "contract";

    fn entity_id(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn created(&self) -> bool {
        self.is_created()
    }

    fn audit_fields(&self) -> JsonValue {
        json!({
            "status": self.status(),
            "contract_number": self.terms().map(|t| t.contract_number.clone()),
        })
    }
}

impl Audited for Disbursement {
    const ENTITY_TYPE: &'static str = "disbursement";

    fn entity_id(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn created(&self) -> bool {
        self.is_created()
    }

    fn audit_fields(&self) -> JsonValue {
        json!({
            "status": self.status(),
            "amount": self.amount(),
            "attempts": self.attempts(),
            "reference": self.reference(),
        })
    }
}

impl Audited for Repayment {
    const ENTITY_TYPE: &'static str = "repayment";

    fn entity_id(&self) -> Uuid {
        *self.id_typed().as_uuid()
    }

    fn created(&self) -> bool {
        self.is_created()
    }

    fn audit_fields(&self) -> JsonValue {
        json!({
            "status": self.status(),
            "amount": self.amount(),
            "reference": self.reference(),
        })
    }
}
