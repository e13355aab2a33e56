use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use finflow_core::{DomainError, PartyId, Rate, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    AcceptBid, AuctionSummary, Bid, BidId, Invoice, InvoiceCommand, InvoiceId, OpenForBidding,
    RankedBid, SubmitBid, WithdrawBid,
};

use super::{EngineResult, FinancingEngine, Settlement};
use crate::event_store::EventStore;
use crate::external::AuditAction;

/// What a financier offers for an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidTerms {
    pub discount_rate: Rate,
    pub processing_fee: Rate,
    /// GST-backed invoices only; replaces rate and fee in the payout.
    pub haircut: Option<Rate>,
    pub valid_until: DateTime<Utc>,
}

impl<S, B> FinancingEngine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// ACCEPTED → OPEN_FOR_BIDDING, by the seller.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub fn open_for_bidding(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
    ) -> EngineResult<Invoice> {
        let dispatched = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::OpenForBidding(OpenForBidding {
                tenant_id,
                invoice_id,
                actor,
                occurred_at: self.now(),
            }),
        )?;
        info!("invoice opened for bidding");
        Ok(dispatched.after)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id, %financier))]
    pub fn submit_bid(
        &self,
        tenant_id: TenantId,
        financier: PartyId,
        invoice_id: InvoiceId,
        terms: BidTerms,
    ) -> EngineResult<Bid> {
        let bid_id = BidId::new();
        let dispatched = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::SubmitBid(SubmitBid {
                tenant_id,
                invoice_id,
                bid_id,
                financier,
                discount_rate: terms.discount_rate,
                processing_fee: terms.processing_fee,
                haircut: terms.haircut,
                valid_until: terms.valid_until,
                occurred_at: self.now(),
            }),
        )?;
        info!(%bid_id, rate_bps = terms.discount_rate.bps(), "bid submitted");
        bid_in(&dispatched.after, bid_id)
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id, %bid_id))]
    pub fn withdraw_bid(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        bid_id: BidId,
    ) -> EngineResult<Bid> {
        let dispatched = self.on_invoice_retrying(
            tenant_id,
            invoice_id,
            InvoiceCommand::WithdrawBid(WithdrawBid {
                tenant_id,
                invoice_id,
                bid_id,
                actor,
                occurred_at: self.now(),
            }),
        )?;
        self.audit(tenant_id, Some(actor), AuditAction::Withdraw, &dispatched);
        info!("bid withdrawn");
        bid_in(&dispatched.after, bid_id)
    }

    /// Accept one bid: it wins, every rival pending bid is rejected and
    /// three-party settlement starts.
    ///
    /// Acceptance is a single attempt. If another acceptance got there first
    /// the caller gets a conflict and must re-read the invoice.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, invoice_id = %invoice_id, %bid_id))]
    pub fn accept_bid(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
        bid_id: BidId,
    ) -> EngineResult<Settlement> {
        let result = self.on_invoice(
            tenant_id,
            invoice_id,
            InvoiceCommand::AcceptBid(AcceptBid {
                tenant_id,
                invoice_id,
                bid_id,
                actor,
                occurred_at: self.now(),
            }),
        );
        let dispatched = match result {
            Err(err) if matches!(err.domain(), Some(DomainError::BidExpired(_))) => {
                self.expire_after_rejection(tenant_id, invoice_id);
                return Err(err);
            }
            other => other?,
        };
        self.audit(tenant_id, Some(actor), AuditAction::Accept, &dispatched);
        info!("bid accepted");

        Ok(self.settle_accepted(tenant_id, dispatched.after))
    }

    /// Live bids ranked for the invoice parties. Financiers only see the
    /// anonymous [`auction_summary`](Self::auction_summary).
    pub fn ranked_bids(
        &self,
        tenant_id: TenantId,
        actor: PartyId,
        invoice_id: InvoiceId,
    ) -> EngineResult<Vec<RankedBid>> {
        let invoice = self.invoice(tenant_id, invoice_id)?;
        if invoice.seller() != Some(actor) && invoice.buyer() != Some(actor) {
            return Err(DomainError::unauthorized(
                "only the seller or buyer can see individual bids",
            )
            .into());
        }
        Ok(invoice.ranked_bids(self.now()))
    }

    pub fn auction_summary(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
    ) -> EngineResult<AuctionSummary> {
        let invoice = self.invoice(tenant_id, invoice_id)?;
        Ok(invoice.auction_summary(self.now()))
    }
}

fn bid_in(invoice: &Invoice, bid_id: BidId) -> EngineResult<Bid> {
    invoice
        .bid(bid_id)
        .cloned()
        .ok_or_else(|| DomainError::invariant("committed bid is missing from the invoice").into())
}
