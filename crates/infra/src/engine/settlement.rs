//! Settlement Orchestrator.
//!
//! Two-party (accepted discount offer): the buyer pays the seller early; the
//! completed disbursement settles the invoice outright.
//!
//! Three-party (accepted bid): the financier pays the seller; completing that
//! disbursement schedules a repayment of the full invoice amount from the
//! buyer to the financier, due on the original due date.
//!
//! Every stream id involved derives from (invoice, accepted terms), so a
//! repeated or resumed step lands on the same streams and no-ops.

use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use finflow_core::{DomainError, PartyId, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    BankAccountRef, CompleteContract, CompleteDisbursement, CompleteRepayment, ConfirmDefault,
    Contract, ContractCommand, ContractId, ContractType, CreateRepayment, Disbursement,
    DisbursementCommand, DisbursementId, DisbursementStatus, FailDisbursement, GenerateContract,
    InitiateDisbursement, Invoice, InvoiceCommand, InvoiceId, InvoiceStatus, MarkOverdue,
    RecordFinanced,
    RecordRepaid, Repayment, RepaymentCommand, RepaymentId, RepaymentStatus, StartProcessing,
    TermsRef,
};

use super::{EngineError, EngineResult, FinancingEngine};
use crate::event_store::EventStore;
use crate::external::{AuditAction, ExternalError};

/// Outcome of accepting terms: the invoice, its contract and the disbursement
/// waiting to be initiated by the payer.
///
/// `contract` and `disbursement` are `None` when opening the settlement
/// failed after the acceptance committed. The acceptance stands and
/// [`FinancingEngine::resume_settlement`] opens them later.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub invoice: Invoice,
    pub contract: Option<Contract>,
    pub disbursement: Option<Disbursement>,
}

impl Settlement {
    pub fn is_open(&self) -> bool {
        self.contract.is_some() && self.disbursement.is_some()
    }
}

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Settlement for terms that were just accepted. A failure here cannot
    /// undo the acceptance, so it is logged and left to the sweeper.
    pub(super) fn settle_accepted(&self, tenant_id: TenantId, invoice: Invoice) -> Settlement {
        match self.settle(tenant_id, &invoice) {
            Ok((contract, disbursement)) => Settlement {
                invoice,
                contract: Some(contract),
                disbursement: Some(disbursement),
            },
            Err(err) => {
                warn!(
                    %tenant_id,
                    invoice_id = %invoice.id_typed(),
                    error = %err,
                    "settlement not opened; the sweeper will resume it"
                );
                Settlement {
                    invoice,
                    contract: None,
                    disbursement: None,
                }
            }
        }
    }

    /// Generate the contract and open the disbursement for accepted terms.
    pub(super) fn settle(
        &self,
        tenant_id: TenantId,
        invoice: &Invoice,
    ) -> EngineResult<(Contract, Disbursement)> {
        let invoice_id = invoice.id_typed();
        let terms = accepted_terms(invoice)?;
        let plan = invoice.settlement_plan()?;
        let (contract_id, contract_terms) = invoice.contract_terms()?;

        let contract = self
            .on_contract(
                tenant_id,
                contract_id,
                ContractCommand::GenerateContract(GenerateContract {
                    tenant_id,
                    contract_id,
                    terms: contract_terms,
                    occurred_at: self.now(),
                }),
            )?
            .after;

        let disbursement_id = DisbursementId::for_terms(invoice_id, terms);
        let disbursement = self
            .on_disbursement(
                tenant_id,
                disbursement_id,
                DisbursementCommand::InitiateDisbursement(InitiateDisbursement {
                    tenant_id,
                    disbursement_id,
                    invoice_id,
                    terms,
                    amount: plan.disbursement_amount(),
                    payer: plan.disbursement_payer(),
                    payee: plan.seller,
                    occurred_at: self.now(),
                }),
            )?
            .after;

        info!(
            %tenant_id,
            %invoice_id,
            %contract_id,
            %disbursement_id,
            contract_type = plan.contract_type.as_str(),
            amount = plan.disbursement_amount(),
            "settlement opened"
        );
        Ok((contract, disbursement))
    }

    /// Start moving money: attach the verified primary accounts of payer and
    /// payee and put the disbursement in PROCESSING.
    ///
    /// Idempotent per (invoice, accepted terms): a disbursement that is
    /// already processing or completed is returned unchanged. A FAILED one
    /// is retried.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, %disbursement_id))]
    pub fn initiate_disbursement(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        disbursement_id: DisbursementId,
    ) -> EngineResult<Disbursement> {
        let current = self.disbursement(tenant_id, disbursement_id)?;
        let (Some(payer), Some(payee)) = (current.payer(), current.payee()) else {
            return Err(DomainError::invariant("disbursement without parties").into());
        };
        if actor != payer {
            return Err(DomainError::unauthorized(
                "only the paying party can initiate the disbursement",
            )
            .into());
        }
        if matches!(
            current.status(),
            DisbursementStatus::Processing | DisbursementStatus::Completed
        ) {
            return Ok(current);
        }

        let accounts = self.verified_primary(tenant_id, payer, "payer").and_then(|source| {
            Ok((source, self.verified_primary(tenant_id, payee, "payee")?))
        });
        let (source_account, destination_account) = match accounts {
            Ok(accounts) => accounts,
            Err(EngineError::ExternalService(err)) => {
                // Funds never move on a failed lookup; the payer re-initiates.
                self.record_lookup_failure(tenant_id, actor, disbursement_id, &err);
                return Err(EngineError::ExternalService(err));
            }
            Err(err) => return Err(err),
        };

        if current.status() == DisbursementStatus::Failed {
            let (Some(invoice_id), Some(terms)) = (current.invoice_id(), current.terms()) else {
                return Err(DomainError::invariant("disbursement without invoice").into());
            };
            let retried = self.on_disbursement(
                tenant_id,
                disbursement_id,
                DisbursementCommand::InitiateDisbursement(InitiateDisbursement {
                    tenant_id,
                    disbursement_id,
                    invoice_id,
                    terms,
                    amount: current.amount(),
                    payer,
                    payee,
                    occurred_at: self.now(),
                }),
            )?;
            info!(attempt = retried.after.attempts(), "disbursement retried");
        }

        let dispatched = self.on_disbursement(
            tenant_id,
            disbursement_id,
            DisbursementCommand::StartProcessing(StartProcessing {
                tenant_id,
                disbursement_id,
                source_account,
                destination_account,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Disburse, &dispatched);
        info!(amount = dispatched.after.amount(), "disbursement processing");
        Ok(dispatched.after)
    }

    /// Manual confirmation that the funds arrived, optionally with the bank
    /// reference. Marks the invoice financed and continues settlement.
    ///
    /// Refused once the invoice has ended (cancelled, for instance) unless
    /// the disbursement already completed, which makes the call a no-op.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, %disbursement_id))]
    pub fn complete_disbursement(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        disbursement_id: DisbursementId,
        reference: Option<String>,
    ) -> EngineResult<Disbursement> {
        let current = self.disbursement(tenant_id, disbursement_id)?;
        ensure_party(actor, current.payer(), current.payee(), "confirm the disbursement")?;
        if current.status() != DisbursementStatus::Completed {
            let invoice_id = current
                .invoice_id()
                .ok_or_else(|| DomainError::invariant("disbursement without invoice"))?;
            let invoice = self.invoice(tenant_id, invoice_id)?;
            if invoice.status().is_terminal() {
                return Err(
                    DomainError::transition("invoice", invoice.status(), InvoiceStatus::Financed)
                        .into(),
                );
            }
        }

        let dispatched = self.on_disbursement(
            tenant_id,
            disbursement_id,
            DisbursementCommand::CompleteDisbursement(CompleteDisbursement {
                tenant_id,
                disbursement_id,
                reference,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Disburse, &dispatched);
        info!(amount = dispatched.after.amount(), "disbursement completed");

        if let Err(err) = self.after_disbursement(tenant_id, &dispatched.after) {
            warn!(error = %err, "settlement follow-up failed; the sweeper will resume it");
        }
        Ok(dispatched.after)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, %disbursement_id))]
    pub fn fail_disbursement(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        disbursement_id: DisbursementId,
        reason: String,
    ) -> EngineResult<Disbursement> {
        let current = self.disbursement(tenant_id, disbursement_id)?;
        ensure_party(actor, current.payer(), current.payee(), "report a failed disbursement")?;

        let dispatched = self.on_disbursement(
            tenant_id,
            disbursement_id,
            DisbursementCommand::FailDisbursement(FailDisbursement {
                tenant_id,
                disbursement_id,
                reason,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Disburse, &dispatched);
        warn!(reason = dispatched.after.failure_reason(), "disbursement failed");
        Ok(dispatched.after)
    }

    /// Buyer's repayment to the financier arrived. The invoice becomes
    /// REPAID and the contract completes.
    ///
    /// Only a FINANCED invoice can be repaid: after a confirmed default or a
    /// cancellation the repayment stays as it is.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, %repayment_id))]
    pub fn complete_repayment(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        repayment_id: RepaymentId,
        reference: Option<String>,
    ) -> EngineResult<Repayment> {
        let current = self.repayment(tenant_id, repayment_id)?;
        ensure_party(actor, current.payer(), current.payee(), "record the repayment")?;
        if current.status() != RepaymentStatus::Completed {
            let invoice_id = current
                .invoice_id()
                .ok_or_else(|| DomainError::invariant("repayment without invoice"))?;
            let invoice = self.invoice(tenant_id, invoice_id)?;
            if invoice.status() != InvoiceStatus::Financed {
                return Err(
                    DomainError::transition("invoice", invoice.status(), InvoiceStatus::Repaid)
                        .into(),
                );
            }
        }

        let dispatched = self.on_repayment(
            tenant_id,
            repayment_id,
            RepaymentCommand::CompleteRepayment(CompleteRepayment {
                tenant_id,
                repayment_id,
                reference,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Repay, &dispatched);
        info!(amount = dispatched.after.amount(), "repayment completed");

        if let Err(err) = self.after_repayment(tenant_id, &dispatched.after) {
            warn!(error = %err, "settlement follow-up failed; the sweeper will resume it");
        }
        Ok(dispatched.after)
    }

    /// Record that a repayment passed its due date unpaid.
    pub fn mark_overdue(
        &self,
        tenant_id: TenantId,
        repayment_id: RepaymentId,
    ) -> EngineResult<Repayment> {
        let dispatched = self.on_repayment(
            tenant_id,
            repayment_id,
            RepaymentCommand::MarkOverdue(MarkOverdue {
                tenant_id,
                repayment_id,
                occurred_at: self.now(),
            }),
        )?;
        if !dispatched.is_noop() {
            warn!(%tenant_id, %repayment_id, "repayment overdue");
        }
        Ok(dispatched.after)
    }

    /// FINANCED → DEFAULTED, confirmed by the financier once the repayment
    /// has been overdue for longer than the invoice's grace period.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn confirm_default(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        reason: Option<String>,
    ) -> EngineResult<Invoice> {
        let invoice = self.invoice(tenant_id, invoice_id)?;
        let terms = accepted_terms(&invoice)?;
        let repayment_id =
            RepaymentId::for_disbursement(DisbursementId::for_terms(invoice_id, terms));
        let mut repayment = self.repayment(tenant_id, repayment_id)?;

        let now = self.now();
        if repayment.status() == RepaymentStatus::Pending && repayment.is_past_due_at(now) {
            repayment = self.mark_overdue(tenant_id, repayment_id)?;
        }
        let grace = invoice.policy().default_grace_period_days;
        if !repayment.is_default_eligible_at(now, grace) {
            return Err(DomainError::validation(format!(
                "repayment is not overdue past the {grace}-day grace period"
            ))
            .into());
        }

        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::ConfirmDefault(ConfirmDefault {
                tenant_id,
                invoice_id,
                repayment_id,
                actor,
                reason,
                occurred_at: now,
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Default, &dispatched);
        warn!("invoice defaulted");
        Ok(dispatched.after)
    }

    /// Follow-ups of a completed disbursement: invoice FINANCED, then either
    /// the contract completes (two-party) or the buyer's repayment is
    /// scheduled (three-party).
    pub(super) fn after_disbursement(
        &self,
        tenant_id: TenantId,
        disbursement: &Disbursement,
    ) -> EngineResult<()> {
        let (Some(invoice_id), Some(terms)) = (disbursement.invoice_id(), disbursement.terms())
        else {
            return Err(DomainError::invariant("disbursement without invoice").into());
        };
        let disbursement_id = disbursement.id_typed();

        let financed = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::RecordFinanced(RecordFinanced {
                tenant_id,
                invoice_id,
                disbursement_id,
                terms,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, None, AuditAction::Disburse, &financed);

        match terms.contract_type() {
            ContractType::TwoParty => {
                self.complete_contract(tenant_id, ContractId::for_terms(invoice_id, terms))?;
            }
            ContractType::ThreeParty => {
                let plan = financed.after.settlement_plan()?;
                let financier = plan
                    .financier
                    .ok_or_else(|| DomainError::invariant("three-party plan without financier"))?;
                let repayment_id = RepaymentId::for_disbursement(disbursement_id);
                let scheduled = self.on_repayment(
                    tenant_id,
                    repayment_id,
                    RepaymentCommand::CreateRepayment(CreateRepayment {
                        tenant_id,
                        repayment_id,
                        invoice_id,
                        disbursement_id,
                        payer: plan.buyer,
                        payee: financier,
                        amount: plan.buyer_repays,
                        due_date: plan.repayment_due_date,
                        occurred_at: self.now(),
                    }),
                )?;
                if !scheduled.is_noop() {
                    info!(
                        %repayment_id,
                        amount = plan.buyer_repays,
                        due = %plan.repayment_due_date,
                        "repayment scheduled"
                    );
                }
            }
        }
        Ok(())
    }

    /// Follow-ups of a completed repayment: invoice REPAID, contract done.
    pub(super) fn after_repayment(
        &self,
        tenant_id: TenantId,
        repayment: &Repayment,
    ) -> EngineResult<()> {
        let invoice_id = repayment
            .invoice_id()
            .ok_or_else(|| DomainError::invariant("repayment without invoice"))?;
        let repayment_id = repayment.id_typed();

        let repaid = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::RecordRepaid(RecordRepaid {
                tenant_id,
                invoice_id,
                repayment_id,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, None, AuditAction::Repay, &repaid);

        let terms = accepted_terms(&repaid.after)?;
        self.complete_contract(tenant_id, ContractId::for_terms(invoice_id, terms))
    }

    pub(super) fn complete_contract(
        &self,
        tenant_id: TenantId,
        contract_id: ContractId,
    ) -> EngineResult<()> {
        let dispatched = self.on_contract(
            tenant_id,
            contract_id,
            ContractCommand::CompleteContract(CompleteContract {
                tenant_id,
                contract_id,
                occurred_at: self.now(),
            }),
        )?;
        if !dispatched.is_noop() {
            info!(%contract_id, "contract completed");
        }
        Ok(())
    }

    fn record_lookup_failure(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        disbursement_id: DisbursementId,
        err: &ExternalError,
    ) {
        let failed = self.on_disbursement(
            tenant_id,
            disbursement_id,
            DisbursementCommand::FailDisbursement(FailDisbursement {
                tenant_id,
                disbursement_id,
                reason: format!("bank account lookup failed: {err}"),
                occurred_at: self.now(),
            }),
        );
        match failed {
            Ok(dispatched) => {
                self.audit(tenant_id, Some(actor), AuditAction::Disburse, &dispatched);
            }
            Err(e) => warn!(error = %e, "could not record failed disbursement"),
        }
    }

    fn verified_primary(
        &self,
        tenant_id: TenantId,
        party: PartyId,
        role: &'static str,
    ) -> EngineResult<BankAccountRef> {
        self.services
            .profiles
            .primary(tenant_id, party)?
            .filter(|account| account.verified)
            .map(|account| account.to_ref())
            .ok_or(EngineError::MissingBankAccount { party, role })
    }
}

pub(super) fn accepted_terms(invoice: &Invoice) -> EngineResult<TermsRef> {
    invoice
        .accepted_terms()
        .ok_or_else(|| DomainError::conflict("invoice has no accepted terms").into())
}

fn ensure_party(
    actor: PartyId,
    payer: Option<PartyId>,
    payee: Option<PartyId>,
    action: &str,
) -> EngineResult<()> {
    if payer == Some(actor) || payee == Some(actor) {
        Ok(())
    } else {
        Err(DomainError::unauthorized(format!("only the payer or payee can {action}")).into())
    }
}
