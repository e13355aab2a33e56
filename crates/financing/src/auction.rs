//! Financier bidding.
//!
//! Financiers compete on an open invoice; the seller (or buyer) accepts one
//! bid and every rival still pending is rejected by the same event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{DomainError, DomainResult, Entity, PartyId, Rate};

use crate::ids::BidId;
use crate::invoice::{
    AcceptBid, BidAccepted, BidSubmitted, BidWithdrawn, Invoice, InvoiceEvent, OpenForBidding,
    OpenedForBidding, SubmitBid, WithdrawBid,
};
use crate::settlement::{self, ThreePartySplit};
use crate::status::InvoiceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

impl BidStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BidStatus::Pending => "PENDING",
            BidStatus::Accepted => "ACCEPTED",
            BidStatus::Rejected => "REJECTED",
            BidStatus::Withdrawn => "WITHDRAWN",
        }
    }
}

/// A financier's offer to pay the seller early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub financier: PartyId,
    pub discount_rate: Rate,
    pub processing_fee: Rate,
    /// GST-backed invoices only; replaces rate + fee when present.
    pub haircut: Option<Rate>,
    pub valid_until: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub status: BidStatus,
    pub closed_reason: Option<String>,
}

impl Bid {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == BidStatus::Pending && !self.is_expired_at(now)
    }

    /// The rate shown to sellers: the haircut if any, else the discount rate.
    pub fn headline_rate(&self) -> Rate {
        self.haircut.unwrap_or(self.discount_rate)
    }

    pub fn split(&self, amount: u64) -> DomainResult<ThreePartySplit> {
        settlement::three_party(amount, self.discount_rate, self.processing_fee, self.haircut)
    }

    pub fn annualized_yield(&self, tenure_days: i64) -> Option<f64> {
        settlement::annualized_yield(self.headline_rate(), tenure_days)
    }
}

impl Entity for Bid {
    type Id = BidId;

    fn id(&self) -> &Self::Id {
        &self.bid_id
    }

    fn is_open(&self) -> bool {
        self.status == BidStatus::Pending
    }
}

/// A live bid with the figures a seller compares on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedBid {
    pub bid: Bid,
    pub financier_pays: u64,
    pub annualized_yield: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuctionSummary {
    pub pending_bids: usize,
    pub lowest_rate: Option<Rate>,
    pub best_financier_pays: Option<u64>,
}

impl Invoice {
    /// Live bids, best seller proceeds first; ties go to the earlier bid.
    pub fn ranked_bids(&self, now: DateTime<Utc>) -> Vec<RankedBid> {
        let Some(amount) = self.fields.amount else {
            return Vec::new();
        };
        let tenure = self
            .fields
            .due_date
            .map(|due| settlement::tenure_days(now, due))
            .unwrap_or(0);

        let mut ranked: Vec<RankedBid> = self
            .bids
            .iter()
            .filter(|b| b.is_live_at(now))
            .filter_map(|b| {
                let split = b.split(amount).ok()?;
                Some(RankedBid {
                    bid: b.clone(),
                    financier_pays: split.financier_pays,
                    annualized_yield: b.annualized_yield(tenure),
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.financier_pays
                .cmp(&a.financier_pays)
                .then(a.bid.submitted_at.cmp(&b.bid.submitted_at))
        });
        ranked
    }

    pub fn auction_summary(&self, now: DateTime<Utc>) -> AuctionSummary {
        let ranked = self.ranked_bids(now);
        AuctionSummary {
            pending_bids: ranked.len(),
            lowest_rate: ranked.iter().map(|r| r.bid.headline_rate()).min(),
            best_financier_pays: ranked.first().map(|r| r.financier_pays),
        }
    }

    pub(crate) fn handle_open_for_bidding(
        &self,
        cmd: &OpenForBidding,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "open the invoice for bidding")?;
        if self.accepted_terms.is_some() && !self.status.is_terminal() {
            return Err(DomainError::offer_conflict(
                "discount terms already accepted; bidding is closed",
            ));
        }
        self.status.ensure_transition(InvoiceStatus::OpenForBidding)?;

        let mut events = Vec::new();
        if let Some(stale) = self.stale_event(cmd.tenant_id, cmd.occurred_at) {
            events.push(stale);
        }
        events.push(InvoiceEvent::OpenedForBidding(OpenedForBidding {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            opened_by: cmd.actor,
            rejected_offer: self.live_offer(cmd.occurred_at).map(|o| o.offer_id),
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    pub(crate) fn handle_submit_bid(
        &self,
        cmd: &SubmitBid,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_status_in(&[InvoiceStatus::OpenForBidding], "BID_SUBMITTED")?;

        if self.seller == Some(cmd.financier) || self.buyer == Some(cmd.financier) {
            return Err(DomainError::unauthorized(
                "invoice parties cannot bid on their own invoice",
            ));
        }
        if self.bid(cmd.bid_id).is_some() {
            return Err(DomainError::conflict("bid_id already used"));
        }
        if cmd.valid_until <= cmd.occurred_at {
            return Err(DomainError::BidExpired(
                "valid_until must be in the future".to_string(),
            ));
        }
        if cmd.haircut.is_some() && !self.is_gst_backed() {
            return Err(DomainError::validation(
                "haircut bids are only allowed on GST-backed invoices",
            ));
        }
        if let Some(existing) = self
            .bids
            .iter()
            .find(|b| b.financier == cmd.financier && b.is_live_at(cmd.occurred_at))
        {
            return Err(DomainError::DuplicateBid(format!(
                "financier already has pending bid {}",
                existing.bid_id
            )));
        }

        let bid = Bid {
            bid_id: cmd.bid_id,
            financier: cmd.financier,
            discount_rate: cmd.discount_rate,
            processing_fee: cmd.processing_fee,
            haircut: cmd.haircut,
            valid_until: cmd.valid_until,
            submitted_at: cmd.occurred_at,
            status: BidStatus::Pending,
            closed_reason: None,
        };
        let amount = self
            .fields
            .amount
            .ok_or_else(|| DomainError::invariant("open invoice without amount"))?;
        bid.split(amount)?;

        let mut events = Vec::new();
        if let Some(stale) = self.stale_event(cmd.tenant_id, cmd.occurred_at) {
            events.push(stale);
        }
        events.push(InvoiceEvent::BidSubmitted(BidSubmitted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            bid,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    pub(crate) fn handle_withdraw_bid(
        &self,
        cmd: &WithdrawBid,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        let bid = self.bid(cmd.bid_id).ok_or_else(DomainError::not_found)?;
        if bid.financier != cmd.actor {
            return Err(DomainError::unauthorized(
                "only the financier who placed the bid can withdraw it",
            ));
        }
        self.ensure_status_in(&[InvoiceStatus::OpenForBidding], "BID_WITHDRAWN")?;
        if bid.status != BidStatus::Pending {
            return Err(DomainError::conflict(format!(
                "bid {} is {}",
                bid.bid_id,
                bid.status.as_str()
            )));
        }

        Ok(vec![InvoiceEvent::BidWithdrawn(BidWithdrawn {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            bid_id: cmd.bid_id,
            financier: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    pub(crate) fn handle_accept_bid(
        &self,
        cmd: &AcceptBid,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        if self.seller != Some(cmd.actor) && self.buyer != Some(cmd.actor) {
            return Err(DomainError::unauthorized(
                "only the seller or buyer can accept a bid",
            ));
        }
        if self.status == InvoiceStatus::BidAccepted {
            return Err(DomainError::conflict("invoice already has an accepted bid"));
        }
        self.ensure_status_in(&[InvoiceStatus::OpenForBidding], "BID_ACCEPTED")?;

        let bid = self.bid(cmd.bid_id).ok_or_else(DomainError::not_found)?;
        if bid.status != BidStatus::Pending {
            return Err(DomainError::conflict(format!(
                "bid {} is {}",
                bid.bid_id,
                bid.status.as_str()
            )));
        }
        if bid.is_expired_at(cmd.occurred_at) {
            return Err(DomainError::BidExpired(format!(
                "bid {} was valid until {}",
                bid.bid_id, bid.valid_until
            )));
        }

        let amount = self
            .fields
            .amount
            .ok_or_else(|| DomainError::invariant("open invoice without amount"))?;
        let split = bid.split(amount)?;
        let rejected_bids = self
            .bids
            .iter()
            .filter(|b| b.bid_id != bid.bid_id && b.status == BidStatus::Pending)
            .map(|b| b.bid_id)
            .collect();

        Ok(vec![InvoiceEvent::BidAccepted(BidAccepted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            bid_id: bid.bid_id,
            financier: bid.financier,
            financier_pays: split.financier_pays,
            accepted_by: cmd.actor,
            rejected_bids,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use finflow_core::Aggregate;

    use crate::invoice::test_support::Fixture;
    use crate::invoice::{AcceptInvoice, ExpireStale, InvoiceCommand, InvoiceFields, SubmitInvoice};
    use crate::negotiation::OfferStatus;
    use crate::settlement::ContractType;
    use crate::status::ProductType;

    use super::*;

    fn gst_backed_open_invoice(fx: &Fixture) -> Invoice {
        let mut invoice = fx.draft(InvoiceFields {
            gstin: Some("27AAPFU0939F1ZV".to_string()),
            ..fx.complete_fields(1_000_000)
        });
        fx.run(
            &mut invoice,
            InvoiceCommand::SubmitInvoice(SubmitInvoice {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                actor: fx.seller,
                seller_kyc_approved: true,
                buyer_kyc_approved: true,
                occurred_at: fx.t0,
            }),
        );
        fx.run(
            &mut invoice,
            InvoiceCommand::AcceptInvoice(AcceptInvoice {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                actor: fx.buyer,
                occurred_at: fx.t0,
            }),
        );
        fx.run(
            &mut invoice,
            InvoiceCommand::OpenForBidding(OpenForBidding {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                actor: fx.seller,
                occurred_at: fx.t0,
            }),
        );
        invoice
    }

    #[test]
    fn accepting_a_bid_rejects_rivals_in_one_event() {
        let fx = Fixture::new();
        let mut invoice = fx.open_for_bidding(1_000_000);
        assert_eq!(invoice.product_type(), ProductType::FinancierBacked);

        let winner = fx.submit_bid(PartyId::new(), 160, 25);
        let rival = fx.submit_bid(PartyId::new(), 200, 25);
        fx.run(&mut invoice, InvoiceCommand::SubmitBid(winner.clone()));
        fx.run(&mut invoice, InvoiceCommand::SubmitBid(rival.clone()));

        let events = fx.run(
            &mut invoice,
            InvoiceCommand::AcceptBid(fx.accept_bid(winner.bid_id, 1)),
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            InvoiceEvent::BidAccepted(e) => {
                assert_eq!(e.financier_pays, 981_500);
                assert_eq!(e.rejected_bids, vec![rival.bid_id]);
            }
            other => panic!("expected BidAccepted, got {other:?}"),
        }
        assert_eq!(invoice.status(), InvoiceStatus::BidAccepted);
        assert_eq!(invoice.bid(rival.bid_id).unwrap().status, BidStatus::Rejected);

        let plan = invoice.settlement_plan().unwrap();
        assert_eq!(plan.contract_type, ContractType::ThreeParty);
        assert_eq!(plan.financier_pays, Some(981_500));
        assert_eq!(plan.buyer_repays, 1_000_000);
        assert_eq!(plan.disbursement_payer(), winner.financier);

        let err = invoice
            .handle(&InvoiceCommand::AcceptBid(fx.accept_bid(rival.bid_id, 2)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn one_pending_bid_per_financier() {
        let fx = Fixture::new();
        let mut invoice = fx.open_for_bidding(1_000_000);
        let financier = PartyId::new();
        let first = fx.submit_bid(financier, 160, 25);
        fx.run(&mut invoice, InvoiceCommand::SubmitBid(first.clone()));

        let err = invoice
            .handle(&InvoiceCommand::SubmitBid(fx.submit_bid(financier, 150, 25)))
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateBid(_)));

        fx.run(
            &mut invoice,
            InvoiceCommand::WithdrawBid(WithdrawBid {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                bid_id: first.bid_id,
                actor: financier,
                occurred_at: fx.at(1),
            }),
        );
        assert_eq!(invoice.bid(first.bid_id).unwrap().status, BidStatus::Withdrawn);
        fx.run(
            &mut invoice,
            InvoiceCommand::SubmitBid(fx.submit_bid(financier, 150, 25)),
        );
    }

    #[test]
    fn haircut_bids_need_a_gstin() {
        let fx = Fixture::new();
        let plain = fx.open_for_bidding(1_000_000);
        let mut bid = fx.submit_bid(PartyId::new(), 160, 25);
        bid.haircut = Some(Rate::from_bps(300));
        assert!(matches!(
            plain
                .handle(&InvoiceCommand::SubmitBid(bid.clone()))
                .unwrap_err(),
            DomainError::Validation(_)
        ));

        let mut gst = gst_backed_open_invoice(&fx);
        fx.run(&mut gst, InvoiceCommand::SubmitBid(bid.clone()));
        let ranked = gst.ranked_bids(fx.t0);
        assert_eq!(ranked[0].financier_pays, 970_000);
        assert_eq!(ranked[0].bid.headline_rate(), Rate::from_bps(300));
    }

    #[test]
    fn expired_bid_cannot_be_accepted() {
        let fx = Fixture::new();
        let mut invoice = fx.open_for_bidding(1_000_000);
        let bid = fx.submit_bid(PartyId::new(), 160, 25);
        fx.run(&mut invoice, InvoiceCommand::SubmitBid(bid.clone()));

        let err = invoice
            .handle(&InvoiceCommand::AcceptBid(fx.accept_bid(bid.bid_id, 72)))
            .unwrap_err();
        assert!(matches!(err, DomainError::BidExpired(_)));

        fx.run(
            &mut invoice,
            InvoiceCommand::ExpireStale(ExpireStale {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                occurred_at: fx.at(72),
            }),
        );
        let swept = invoice.bid(bid.bid_id).unwrap();
        assert_eq!(swept.status, BidStatus::Rejected);
        assert_eq!(swept.closed_reason.as_deref(), Some("expired"));
        assert_eq!(invoice.status(), InvoiceStatus::OpenForBidding);
    }

    #[test]
    fn parties_cannot_bid_on_their_own_invoice() {
        let fx = Fixture::new();
        let invoice = fx.open_for_bidding(1_000_000);
        let err = invoice
            .handle(&InvoiceCommand::SubmitBid(fx.submit_bid(fx.buyer, 160, 25)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));
    }

    #[test]
    fn bids_require_an_open_auction() {
        let fx = Fixture::new();
        let invoice = fx.accepted(1_000_000);
        let err = invoice
            .handle(&InvoiceCommand::SubmitBid(fx.submit_bid(PartyId::new(), 160, 25)))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn ranking_prefers_proceeds_then_age() {
        let fx = Fixture::new();
        let mut invoice = fx.open_for_bidding(1_000_000);
        let costly = fx.submit_bid(PartyId::new(), 300, 0);
        let mut early = fx.submit_bid(PartyId::new(), 150, 10);
        let mut late = fx.submit_bid(PartyId::new(), 100, 60);
        early.occurred_at = fx.at(1);
        late.occurred_at = fx.at(2);
        for cmd in [costly.clone(), late.clone(), early.clone()] {
            fx.run(&mut invoice, InvoiceCommand::SubmitBid(cmd));
        }

        let order: Vec<BidId> = invoice
            .ranked_bids(fx.at(3))
            .into_iter()
            .map(|r| r.bid.bid_id)
            .collect();
        assert_eq!(order, vec![early.bid_id, late.bid_id, costly.bid_id]);

        let summary = invoice.auction_summary(fx.at(3));
        assert_eq!(summary.pending_bids, 3);
        assert_eq!(summary.lowest_rate, Some(Rate::from_bps(100)));
        assert_eq!(summary.best_financier_pays, Some(984_000));

        let ranked = invoice.ranked_bids(fx.at(3));
        let y = ranked[0].annualized_yield.unwrap();
        assert!(y > 0.0);
    }

    #[test]
    fn opening_for_bidding_rejects_the_pending_offer() {
        let fx = Fixture::new();
        let mut invoice = fx.accepted(1_000_000);
        let offer = fx.create_offer(200, 48);
        fx.run(&mut invoice, InvoiceCommand::CreateOffer(offer.clone()));
        fx.run(
            &mut invoice,
            InvoiceCommand::OpenForBidding(OpenForBidding {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                actor: fx.seller,
                occurred_at: fx.at(1),
            }),
        );
        let closed = invoice.offer(offer.offer_id).unwrap();
        assert_eq!(closed.status, OfferStatus::Rejected);
        assert_eq!(
            closed.closed_reason.as_deref(),
            Some("invoice opened for bidding")
        );
    }

    #[test]
    fn accepted_discount_blocks_the_auction() {
        let fx = Fixture::new();
        let mut invoice = fx.accepted(1_000_000);
        let offer = fx.create_offer(200, 48);
        fx.run(&mut invoice, InvoiceCommand::CreateOffer(offer.clone()));
        fx.run(
            &mut invoice,
            InvoiceCommand::AcceptOffer(fx.accept_offer(offer.offer_id, 1)),
        );
        let err = invoice
            .handle(&InvoiceCommand::OpenForBidding(OpenForBidding {
                tenant_id: fx.tenant_id,
                invoice_id: fx.invoice_id,
                actor: fx.seller,
                occurred_at: fx.at(2),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::OfferConflict(_)));
    }
}
