//! Discount negotiation between buyer and seller.
//!
//! Offers form a single chain per invoice: one initial offer plus revisions,
//! bounded by `FinancingPolicy::max_offer_revisions`. At most one offer is
//! pending at a time; a revision supersedes the pending one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{DomainError, DomainResult, Entity, PartyId, Rate};

use crate::ids::OfferId;
use crate::invoice::{
    AcceptOffer, CreateOffer, DiscountOfferAccepted, DiscountOfferRejected, DiscountOffered,
    FallbackToStandardPayment, Invoice, InvoiceEvent, NegotiationClosed, RejectOffer, ReviseOffer,
};
use crate::settlement;
use crate::status::InvoiceStatus;

const REASON_MAX_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl OfferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OfferStatus::Pending => "PENDING",
            OfferStatus::Accepted => "ACCEPTED",
            OfferStatus::Rejected => "REJECTED",
            OfferStatus::Expired => "EXPIRED",
        }
    }
}

/// A buyer's early-payment discount proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountOffer {
    pub offer_id: OfferId,
    /// Position in the negotiation chain (1 = initial offer).
    pub sequence: u8,
    pub discount: Rate,
    pub offered_by: PartyId,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OfferStatus,
    /// Further revisions allowed after this offer.
    pub revisions_remaining: u8,
    pub closed_reason: Option<String>,
}

impl DiscountOffer {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Status as observed at `now`, treating an overdue pending offer as expired.
    pub fn status_at(&self, now: DateTime<Utc>) -> OfferStatus {
        if self.status == OfferStatus::Pending && self.is_expired_at(now) {
            OfferStatus::Expired
        } else {
            self.status
        }
    }
}

impl Entity for DiscountOffer {
    type Id = OfferId;

    fn id(&self) -> &Self::Id {
        &self.offer_id
    }

    fn is_open(&self) -> bool {
        self.status == OfferStatus::Pending
    }
}

fn validate_offer_terms(
    discount: Rate,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DomainResult<()> {
    if discount.is_zero() || discount >= Rate::FULL {
        return Err(DomainError::validation(
            "discount must be greater than 0% and below 100%",
        ));
    }
    if expires_at <= now {
        return Err(DomainError::validation("offer must expire in the future"));
    }
    Ok(())
}

fn validate_reason(reason: &Option<String>) -> DomainResult<Option<String>> {
    match reason.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(r) if r.len() > REASON_MAX_LEN => Err(DomainError::validation(format!(
            "reason must be at most {REASON_MAX_LEN} characters"
        ))),
        Some(r) => Ok(Some(r.to_string())),
    }
}

impl Invoice {
    /// Pending offer that has not yet passed its expiry at `now`.
    pub fn live_offer(&self, now: DateTime<Utc>) -> Option<&DiscountOffer> {
        self.offers
            .iter()
            .find(|o| o.status_at(now) == OfferStatus::Pending)
    }

    fn ensure_negotiable(&self, action: &str) -> DomainResult<()> {
        self.ensure_status_in(&[InvoiceStatus::Submitted, InvoiceStatus::Accepted], action)?;
        if self.accepted_terms.is_some() {
            return Err(DomainError::offer_conflict("terms already accepted"));
        }
        if self.negotiation_closed {
            return Err(DomainError::offer_conflict(
                "discount negotiation closed; seller chose standard payment",
            ));
        }
        Ok(())
    }

    /// The offer `offer_id` if it can still be acted on at `now`.
    fn pending_offer(&self, offer_id: OfferId, now: DateTime<Utc>) -> DomainResult<&DiscountOffer> {
        let offer = self.offer(offer_id).ok_or_else(DomainError::not_found)?;
        match offer.status_at(now) {
            OfferStatus::Pending => Ok(offer),
            OfferStatus::Expired => Err(DomainError::OfferExpired(format!(
                "offer {offer_id} expired at {}",
                offer.expires_at
            ))),
            other => Err(DomainError::conflict(format!(
                "offer {offer_id} is {}",
                other.as_str()
            ))),
        }
    }

    pub(crate) fn handle_create_offer(
        &self,
        cmd: &CreateOffer,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_buyer(cmd.actor, "make a discount offer")?;
        self.ensure_negotiable("DISCOUNT_OFFERED")?;

        if let Some(live) = self.live_offer(cmd.occurred_at) {
            return Err(DomainError::offer_conflict(format!(
                "offer {} is still pending",
                live.offer_id
            )));
        }
        if !self.offers.is_empty() {
            return Err(DomainError::offer_conflict(
                "negotiation already started; revise the latest offer instead",
            ));
        }
        validate_offer_terms(cmd.discount, cmd.expires_at, cmd.occurred_at)?;

        let offer = DiscountOffer {
            offer_id: cmd.offer_id,
            sequence: 1,
            discount: cmd.discount,
            offered_by: cmd.actor,
            offered_at: cmd.occurred_at,
            expires_at: cmd.expires_at,
            status: OfferStatus::Pending,
            revisions_remaining: self.policy.max_offer_revisions.saturating_sub(1),
            closed_reason: None,
        };

        Ok(vec![InvoiceEvent::DiscountOffered(DiscountOffered {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            offer,
            supersedes: None,
            occurred_at: cmd.occurred_at,
        })])
    }

    pub(crate) fn handle_revise_offer(
        &self,
        cmd: &ReviseOffer,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_buyer(cmd.actor, "revise the discount offer")?;
        self.ensure_negotiable("DISCOUNT_OFFERED")?;

        let latest = self
            .latest_offer()
            .ok_or_else(|| DomainError::offer_conflict("no offer to revise"))?;
        if latest.revisions_remaining == 0 {
            return Err(DomainError::RevisionLimitExceeded {
                max: self.policy.max_offer_revisions,
            });
        }
        if self.offer(cmd.offer_id).is_some() {
            return Err(DomainError::conflict("offer_id already used"));
        }
        validate_offer_terms(cmd.discount, cmd.expires_at, cmd.occurred_at)?;

        let mut events = Vec::new();
        if let Some(stale) = self.stale_event(cmd.tenant_id, cmd.occurred_at) {
            events.push(stale);
        }
        let supersedes = self.live_offer(cmd.occurred_at).map(|o| o.offer_id);

        let offer = DiscountOffer {
            offer_id: cmd.offer_id,
            sequence: latest.sequence + 1,
            discount: cmd.discount,
            offered_by: cmd.actor,
            offered_at: cmd.occurred_at,
            expires_at: cmd.expires_at,
            status: OfferStatus::Pending,
            revisions_remaining: latest.revisions_remaining - 1,
            closed_reason: None,
        };
        events.push(InvoiceEvent::DiscountOffered(DiscountOffered {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            offer,
            supersedes,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    pub(crate) fn handle_accept_offer(
        &self,
        cmd: &AcceptOffer,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "accept a discount offer")?;
        self.ensure_status_in(
            &[InvoiceStatus::Submitted, InvoiceStatus::Accepted],
            InvoiceStatus::Accepted.as_str(),
        )?;
        if self.accepted_terms.is_some() {
            return Err(DomainError::conflict("invoice already has accepted terms"));
        }

        let offer = self.pending_offer(cmd.offer_id, cmd.occurred_at)?;
        let amount = self
            .fields
            .amount
            .ok_or_else(|| DomainError::invariant("submitted invoice without amount"))?;
        let split = settlement::two_party(amount, offer.discount)?;

        Ok(vec![InvoiceEvent::DiscountOfferAccepted(DiscountOfferAccepted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            offer_id: offer.offer_id,
            discount: offer.discount,
            seller_receives: split.seller_receives,
            accepted_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    pub(crate) fn handle_reject_offer(
        &self,
        cmd: &RejectOffer,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "reject a discount offer")?;
        self.ensure_status_in(
            &[InvoiceStatus::Submitted, InvoiceStatus::Accepted],
            "DISCOUNT_REJECTED",
        )?;
        let reason = validate_reason(&cmd.reason)?;
        let offer = self.pending_offer(cmd.offer_id, cmd.occurred_at)?;

        Ok(vec![InvoiceEvent::DiscountOfferRejected(DiscountOfferRejected {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            offer_id: offer.offer_id,
            rejected_by: cmd.actor,
            reason,
            occurred_at: cmd.occurred_at,
        })])
    }

    pub(crate) fn handle_fallback(
        &self,
        cmd: &FallbackToStandardPayment,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "fall back to standard payment")?;
        self.ensure_negotiable("STANDARD_PAYMENT")?;

        let mut events = Vec::new();
        if let Some(stale) = self.stale_event(cmd.tenant_id, cmd.occurred_at) {
            events.push(stale);
        }
        events.push(InvoiceEvent::NegotiationClosed(NegotiationClosed {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            closed_by: cmd.actor,
            rejected_offer: self.live_offer(cmd.occurred_at).map(|o| o.offer_id),
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }
}
