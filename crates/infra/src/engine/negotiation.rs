use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use finflow_core::{DomainError, PartyId, Rate, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    AcceptOffer, CreateOffer, DiscountOffer, ExpireStale, FallbackToStandardPayment, Invoice,
    InvoiceCommand, InvoiceId, OfferId, RejectOffer, ReviseOffer,
};

use super::{EngineResult, FinancingEngine, Settlement};
use crate::event_store::EventStore;
use crate::external::AuditAction;

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// The buyer's first discount offer on a submitted or accepted invoice.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn create_offer(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        discount: Rate,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<DiscountOffer> {
        let offer_id = OfferId::new();
        let dispatched = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::CreateOffer(CreateOffer {
                tenant_id,
                invoice_id,
                offer_id,
                actor,
                discount,
                expires_at,
                occurred_at: self.now(),
            }),
        )?;
        info!(%offer_id, discount_bps = discount.bps(), "discount offered");
        offer_in(&dispatched.after, offer_id)
    }

    /// A revised offer from the buyer. Supersedes the pending one, if any,
    /// and consumes one revision.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn revise_offer(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        discount: Rate,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<DiscountOffer> {
        let offer_id = OfferId::new();
        let dispatched = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::ReviseOffer(ReviseOffer {
                tenant_id,
                invoice_id,
                offer_id,
                actor,
                discount,
                expires_at,
                occurred_at: self.now(),
            }),
        )?;
        let offer = offer_in(&dispatched.after, offer_id)?;
        info!(
            %offer_id,
            sequence = offer.sequence,
            revisions_remaining = offer.revisions_remaining,
            "discount offer revised"
        );
        Ok(offer)
    }

    /// Seller accepts a pending offer and two-party settlement starts.
    ///
    /// An offer that expired is marked as such before the error is
    /// returned, so the next reader sees it closed.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id, %offer_id))]
    pub fn accept_offer(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        offer_id: OfferId,
    ) -> EngineResult<Settlement> {
        let result = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::AcceptOffer(AcceptOffer {
                tenant_id,
                invoice_id,
                offer_id,
                actor,
                occurred_at: self.now(),
            }),
        );
        let dispatched = match result {
            Err(err) if matches!(err.domain(), Some(DomainError::OfferExpired(_))) => {
                self.expire_after_rejection(tenant_id, invoice_id);
                return Err(err);
            }
            other => other?,
        };
        self.audit(tenant_id, Some(actor), AuditAction::Accept, &dispatched);
        info!("discount offer accepted");

        Ok(self.settle_accepted(tenant_id, dispatched.after))
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id, %offer_id))]
    pub fn reject_offer(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        offer_id: OfferId,
        reason: Option<String>,
    ) -> EngineResult<Invoice> {
        let result = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::RejectOffer(RejectOffer {
                tenant_id,
                invoice_id,
                offer_id,
                actor,
                reason,
                occurred_at: self.now(),
            }),
        );
        let dispatched = match result {
            Err(err) if matches!(err.domain(), Some(DomainError::OfferExpired(_))) => {
                self.expire_after_rejection(tenant_id, invoice_id);
                return Err(err);
            }
            other => other?,
        };
        self.audit(tenant_id, Some(actor), AuditAction::Reject, &dispatched);
        info!("discount offer rejected");
        Ok(dispatched.after)
    }

    /// Seller ends the negotiation and takes standard payment on the due
    /// date. A live offer is rejected along the way.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn fallback_to_standard_payment(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
    ) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::FallbackToStandardPayment(FallbackToStandardPayment {
                tenant_id,
                invoice_id,
                actor,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Reject, &dispatched);
        info!("negotiation closed; standard payment");
        Ok(dispatched.after)
    }

    /// Persist expiry of whatever is stale on this invoice.
    pub fn expire_stale(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::ExpireStale(ExpireStale {
                tenant_id,
                invoice_id,
                occurred_at: self.now(),
            }),
        )?;
        if !dispatched.is_noop() {
            info!(%tenant_id, %invoice_id, "stale offers and bids expired");
        }
        Ok(dispatched.after)
    }

    /// Expiry side effect of a failed acceptance; the acceptance error is
    /// what the caller sees either way.
    pub(super) fn expire_after_rejection(&self, tenant_id: TenantId, invoice_id: InvoiceId) {
        if let Err(err) = self.expire_stale(tenant_id, invoice_id) {
            warn!(%tenant_id, %invoice_id, error = %err, "could not record expiry");
        }
    }
}

fn offer_in(invoice: &Invoice, offer_id: OfferId) -> EngineResult<DiscountOffer> {
    invoice
        .offer(offer_id)
        .cloned()
        .ok_or_else(|| DomainError::invariant("committed offer is missing from the invoice").into())
}
