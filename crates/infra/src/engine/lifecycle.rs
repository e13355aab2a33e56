use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use finflow_core::{AggregateId, PartyId, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    AcceptInvoice, CancelContract, CancelDisbursement, CancelInvoice, CancelRepayment,
    ContractCommand, ContractId, ContractStatus, CreateDraft, DisbursementCommand,
    DisbursementId, DisbursementStatus, FieldSource, Invoice, InvoiceCommand, InvoiceFields,
    InvoiceId, InvoiceStatus, ProductType, RepaymentCommand, RepaymentId, SubmitInvoice,
    TermsRef, UpdateDraft,
};

use super::{EngineError, EngineResult, FinancingEngine};
use crate::event_store::EventStore;
use crate::external::AuditAction;

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Draft a new invoice on behalf of the seller.
    ///
    /// Fields may be partial; they are only required at submission. The
    /// negotiation policy is fixed here from the engine configuration.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, seller = %seller))]
    pub fn create_draft(
        &self,
        tenant_id: TenantId,
        seller: PartyId,
        buyer: PartyId,
        fields: InvoiceFields,
        source: FieldSource,
        product_type: ProductType,
    ) -> EngineResult<Invoice> {
        let invoice_id = InvoiceId::new(AggregateId::new());
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::CreateDraft(CreateDraft {
                tenant_id,
                invoice_id,
                seller,
                buyer,
                fields,
                source,
                product_type,
                policy: self.config.policy(),
                occurred_at: self.now(),
            }),
        )?;
        info!(%invoice_id, "invoice drafted");
        Ok(dispatched.after)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn update_draft(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        fields: InvoiceFields,
        source: FieldSource,
    ) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::UpdateDraft(UpdateDraft {
                tenant_id,
                invoice_id,
                actor,
                fields,
                source,
                occurred_at: self.now(),
            }),
        )?;
        Ok(dispatched.after)
    }

    /// DRAFT → SUBMITTED. Both parties must be KYC-approved.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn submit_invoice(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
    ) -> EngineResult<Invoice> {
        let current = self.invoice(tenant_id, invoice_id)?;

        // KYC only matters once the seller is allowed to submit at all;
        // otherwise the aggregate reports the real reason.
        let (mut seller_ok, mut buyer_ok) = (false, false);
        if current.status() == InvoiceStatus::Draft && current.seller() == Some(actor) {
            if let (Some(seller), Some(buyer)) = (current.seller(), current.buyer()) {
                seller_ok = self.services.kyc.is_approved(tenant_id, seller)?;
                if !seller_ok {
                    return Err(EngineError::KycNotApproved { role: "seller" });
                }
                buyer_ok = self.services.kyc.is_approved(tenant_id, buyer)?;
                if !buyer_ok {
                    return Err(EngineError::KycNotApproved { role: "buyer" });
                }
            }
        }

        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::SubmitInvoice(SubmitInvoice {
                tenant_id,
                invoice_id,
                actor,
                seller_kyc_approved: seller_ok,
                buyer_kyc_approved: buyer_ok,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Submit, &dispatched);
        info!("invoice submitted");
        Ok(dispatched.after)
    }

    /// SUBMITTED → ACCEPTED, by the buyer.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn accept_invoice(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
    ) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::AcceptInvoice(AcceptInvoice {
                tenant_id,
                invoice_id,
                actor,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Accept, &dispatched);
        info!("invoice accepted by buyer");
        Ok(dispatched.after)
    }

    /// Cancel a non-terminal invoice, FINANCED included.
    ///
    /// Pending offers and bids are rejected in the same append. Settlement
    /// already under way is unwound afterwards: an unfinished disbursement,
    /// an unpaid repayment and the active contract are cancelled. A completed
    /// disbursement stays completed; reversing funds is out of band.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn cancel_invoice(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        reason: Option<String>,
    ) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::CancelInvoice(CancelInvoice {
                tenant_id,
                invoice_id,
                actor,
                reason: reason.clone(),
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Cancel, &dispatched);
        info!("invoice cancelled");

        if let Some(terms) = dispatched.after.accepted_terms() {
            let unwound =
                self.unwind_settlement(tenant_id, Some(actor), invoice_id, terms, reason);
            if let Err(err) = unwound {
                warn!(error = %err, "settlement unwind incomplete; the sweeper will retry");
            }
        }
        Ok(dispatched.after)
    }

    /// Cancel whatever settlement artefacts exist for a cancelled invoice and
    /// return how many were changed. Finished artefacts are left alone.
    pub(super) fn unwind_settlement(
        &self,
        tenant_id: TenantId,
        actor: Option<PartyId>,
        invoice_id: InvoiceId,
        terms: TermsRef,
        reason: Option<String>,
    ) -> EngineResult<usize> {
        let mut changed = 0;
        let disbursement_id = DisbursementId::for_terms(invoice_id, terms);
        let disbursement = self.load_disbursement(tenant_id, disbursement_id)?;
        if disbursement.is_created()
            && !matches!(
                disbursement.status(),
                DisbursementStatus::Completed | DisbursementStatus::Cancelled
            )
        {
            let dispatched = self.on_disbursement(
                tenant_id,
                disbursement_id,
                DisbursementCommand::CancelDisbursement(CancelDisbursement {
                    tenant_id,
                    disbursement_id,
                    reason: reason.clone(),
                    occurred_at: self.now(),
                }),
            )?;
            self.audit(tenant_id, actor, AuditAction::Cancel, &dispatched);
            changed += 1;
        }

        let repayment_id = RepaymentId::for_disbursement(disbursement_id);
        let repayment = self.load_repayment(tenant_id, repayment_id)?;
        if repayment.is_created() && !repayment.status().is_terminal() {
            let dispatched = self.on_repayment(
                tenant_id,
                repayment_id,
                RepaymentCommand::CancelRepayment(CancelRepayment {
                    tenant_id,
                    repayment_id,
                    reason: reason.clone(),
                    occurred_at: self.now(),
                }),
            )?;
            self.audit(tenant_id, actor, AuditAction::Cancel, &dispatched);
            changed += 1;
        }

        let contract_id = ContractId::for_terms(invoice_id, terms);
        let contract = self.load_contract(tenant_id, contract_id)?;
        if contract.is_created() && contract.status() == ContractStatus::Active {
            let dispatched = self.on_contract(
                tenant_id,
                contract_id,
                ContractCommand::CancelContract(CancelContract {
                    tenant_id,
                    contract_id,
                    reason,
                    occurred_at: self.now(),
                }),
            )?;
            self.audit(tenant_id, actor, AuditAction::Cancel, &dispatched);
            changed += 1;
        }
        Ok(changed)
    }
}
