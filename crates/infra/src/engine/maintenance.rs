use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use finflow_core::TenantId;
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    ContractId, ContractStatus, DisbursementId, DisbursementStatus, InvoiceId, InvoiceStatus,
    RepaymentId, RepaymentStatus, TermsRef,
};

use super::{EngineResult, FinancingEngine};
use crate::event_store::EventStore;

/// Settlement steps a resume pass had to perform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeOutcome {
    pub steps: Vec<&'static str>,
}

impl ResumeOutcome {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Bring the settlement streams of an invoice in line with its state.
    ///
    /// Follow-up commands run after the triggering commit; if the process
    /// stops in between, this finishes the job. Every step is idempotent, so
    /// running it on a consistent invoice does nothing.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn resume_settlement(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
    ) -> EngineResult<ResumeOutcome> {
        let mut outcome = ResumeOutcome::default();
        let invoice = self.invoice(tenant_id, invoice_id)?;
        let Some(terms) = invoice.accepted_terms() else {
            return Ok(outcome);
        };

        let contract_id = ContractId::for_terms(invoice_id, terms);
        let disbursement_id = DisbursementId::for_terms(invoice_id, terms);

        match invoice.status() {
            InvoiceStatus::Cancelled => {
                if self.unwind_settlement(tenant_id, None, invoice_id, terms, None)? > 0 {
                    outcome.steps.push("unwound");
                }
            }
            InvoiceStatus::Accepted | InvoiceStatus::BidAccepted => {
                let contract = self.load_contract(tenant_id, contract_id)?;
                let mut disbursement = self.load_disbursement(tenant_id, disbursement_id)?;
                if !contract.is_created() || !disbursement.is_created() {
                    disbursement = self.settle(tenant_id, &invoice)?.1;
                    outcome.steps.push("settlement_opened");
                }
                if disbursement.status() == DisbursementStatus::Completed {
                    self.after_disbursement(tenant_id, &disbursement)?;
                    outcome.steps.push("financed");
                }
            }
            InvoiceStatus::Financed => {
                if let TermsRef::Bid(_) = terms {
                    let repayment_id = RepaymentId::for_disbursement(disbursement_id);
                    let repayment = self.load_repayment(tenant_id, repayment_id)?;
                    if !repayment.is_created() {
                        let disbursement = self.load_disbursement(tenant_id, disbursement_id)?;
                        self.after_disbursement(tenant_id, &disbursement)?;
                        outcome.steps.push("repayment_scheduled");
                    } else if repayment.status() == RepaymentStatus::Completed {
                        self.after_repayment(tenant_id, &repayment)?;
                        outcome.steps.push("repaid");
                    }
                }
            }
            InvoiceStatus::Repaid => {
                let contract = self.load_contract(tenant_id, contract_id)?;
                if contract.is_created() && contract.status() == ContractStatus::Active {
                    self.complete_contract(tenant_id, contract_id)?;
                    outcome.steps.push("contract_completed");
                }
            }
            InvoiceStatus::Draft
            | InvoiceStatus::Submitted
            | InvoiceStatus::OpenForBidding
            | InvoiceStatus::Defaulted => {}
        }

        if !outcome.is_empty() {
            info!(steps = ?outcome.steps, "settlement resumed");
        }
        Ok(outcome)
    }
}
