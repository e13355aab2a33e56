use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, PartyId, Rate, TenantId,
};
use finflow_events::{Command, Event};

use crate::auction::{Bid, BidStatus};
use crate::ids::{BidId, DisbursementId, InvoiceId, OfferId, RepaymentId, TermsRef};
use crate::negotiation::{DiscountOffer, OfferStatus};
use crate::policy::FinancingPolicy;
use crate::settlement::{self, ContractType, SettlementPlan};
use crate::status::{InvoiceStatus, ProductType};

/// Where a draft field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldSource {
    /// Typed in by the seller.
    Manual,
    /// Pre-filled from an uploaded invoice document.
    Extracted,
}

/// Invoice header fields. All optional while drafting; all but `gstin`
/// required to submit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub invoice_number: Option<String>,
    /// Face value in minor currency units.
    pub amount: Option<u64>,
    pub invoice_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    /// GST registration of the seller; enables haircut bids.
    pub gstin: Option<String>,
}

const INVOICE_NUMBER_MAX_LEN: usize = 64;

impl InvoiceFields {
    /// Overlay `update` on top of `self` (only `Some` values overwrite).
    pub fn merged_with(&self, update: &InvoiceFields) -> InvoiceFields {
        InvoiceFields {
            invoice_number: update
                .invoice_number
                .clone()
                .or_else(|| self.invoice_number.clone()),
            amount: update.amount.or(self.amount),
            invoice_date: update.invoice_date.or(self.invoice_date),
            due_date: update.due_date.or(self.due_date),
            gstin: update.gstin.clone().or_else(|| self.gstin.clone()),
        }
    }

    /// Names of the fields carrying a value.
    pub fn present(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.invoice_number.is_some() {
            names.push("invoice_number");
        }
        if self.amount.is_some() {
            names.push("amount");
        }
        if self.invoice_date.is_some() {
            names.push("invoice_date");
        }
        if self.due_date.is_some() {
            names.push("due_date");
        }
        if self.gstin.is_some() {
            names.push("gstin");
        }
        names
    }

    /// Required-for-submission fields that are still empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.invoice_number.is_none() {
            names.push("invoice_number");
        }
        if self.amount.is_none() {
            names.push("amount");
        }
        if self.invoice_date.is_none() {
            names.push("invoice_date");
        }
        if self.due_date.is_none() {
            names.push("due_date");
        }
        names
    }

    /// Validate whatever is present. Missing values are only an error on submit.
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(number) = &self.invoice_number {
            let trimmed = number.trim();
            if trimmed.is_empty() {
                return Err(DomainError::validation("invoice_number must not be blank"));
            }
            if trimmed.len() > INVOICE_NUMBER_MAX_LEN {
                return Err(DomainError::validation(format!(
                    "invoice_number must be at most {INVOICE_NUMBER_MAX_LEN} characters"
                )));
            }
        }
        if self.amount == Some(0) {
            return Err(DomainError::validation("amount must be positive"));
        }
        if let (Some(issued), Some(due)) = (self.invoice_date, self.due_date) {
            if due <= issued {
                return Err(DomainError::validation(
                    "due_date must be after invoice_date",
                ));
            }
        }
        if let Some(gstin) = &self.gstin {
            if !is_valid_gstin(gstin) {
                return Err(DomainError::validation(
                    "gstin must be 15 uppercase alphanumeric characters starting with a state code",
                ));
            }
        }
        Ok(())
    }
}

/// Structural GSTIN check: two-digit state code followed by 13 uppercase
/// alphanumerics.
pub fn is_valid_gstin(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 15
        && bytes[..2].iter().all(u8::is_ascii_digit)
        && bytes
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// Aggregate root: Invoice.
///
/// Owns its discount offers and bids so that every decision touching more
/// than one of them (accept one, reject the rest) is a single stream append.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub(crate) id: InvoiceId,
    pub(crate) tenant_id: Option<TenantId>,
    pub(crate) seller: Option<PartyId>,
    pub(crate) buyer: Option<PartyId>,
    pub(crate) fields: InvoiceFields,
    pub(crate) field_sources: BTreeMap<String, FieldSource>,
    pub(crate) status: InvoiceStatus,
    pub(crate) product_type: ProductType,
    pub(crate) policy: FinancingPolicy,
    pub(crate) offers: Vec<DiscountOffer>,
    pub(crate) negotiation_closed: bool,
    pub(crate) bids: Vec<Bid>,
    pub(crate) accepted_terms: Option<TermsRef>,
    pub(crate) financed_by: Option<DisbursementId>,
    pub(crate) repaid_by: Option<RepaymentId>,
    pub(crate) status_reason: Option<String>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            tenant_id: None,
            seller: None,
            buyer: None,
            fields: InvoiceFields::default(),
            field_sources: BTreeMap::new(),
            status: InvoiceStatus::Draft,
            product_type: ProductType::SelfFundedDiscount,
            policy: FinancingPolicy::default(),
            offers: Vec::new(),
            negotiation_closed: false,
            bids: Vec::new(),
            accepted_terms: None,
            financed_by: None,
            repaid_by: None,
            status_reason: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn seller(&self) -> Option<PartyId> {
        self.seller
    }

    pub fn buyer(&self) -> Option<PartyId> {
        self.buyer
    }

    pub fn fields(&self) -> &InvoiceFields {
        &self.fields
    }

    pub fn field_source(&self, field: &str) -> Option<FieldSource> {
        self.field_sources.get(field).copied()
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    /// Why the invoice reached its current status (cancel/default reason).
    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    pub fn policy(&self) -> FinancingPolicy {
        self.policy
    }

    pub fn amount(&self) -> Option<u64> {
        self.fields.amount
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.fields.due_date
    }

    pub fn is_gst_backed(&self) -> bool {
        self.fields.gstin.is_some()
    }

    pub fn offers(&self) -> &[DiscountOffer] {
        &self.offers
    }

    pub fn offer(&self, offer_id: OfferId) -> Option<&DiscountOffer> {
        self.offers.iter().find(|o| o.offer_id == offer_id)
    }

    /// Most recent offer in the negotiation chain.
    pub fn latest_offer(&self) -> Option<&DiscountOffer> {
        self.offers.iter().max_by_key(|o| o.sequence)
    }

    pub fn negotiation_closed(&self) -> bool {
        self.negotiation_closed
    }

    pub fn bids(&self) -> &[Bid] {
        &self.bids
    }

    pub fn bid(&self, bid_id: BidId) -> Option<&Bid> {
        self.bids.iter().find(|b| b.bid_id == bid_id)
    }

    pub fn accepted_terms(&self) -> Option<TermsRef> {
        self.accepted_terms
    }

    pub fn financed_by(&self) -> Option<DisbursementId> {
        self.financed_by
    }

    pub fn repaid_by(&self) -> Option<RepaymentId> {
        self.repaid_by
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Money flows for the accepted terms.
    pub fn settlement_plan(&self) -> DomainResult<SettlementPlan> {
        let terms = self
            .accepted_terms
            .ok_or_else(|| DomainError::conflict("invoice has no accepted terms"))?;
        let (seller, buyer) = self.parties()?;
        let amount = self
            .fields
            .amount
            .ok_or_else(|| DomainError::invariant("accepted invoice without amount"))?;
        let due = self
            .fields
            .due_date
            .ok_or_else(|| DomainError::invariant("accepted invoice without due_date"))?;

        match terms {
            TermsRef::Offer(offer_id) => {
                let offer = self
                    .offer(offer_id)
                    .ok_or_else(|| DomainError::invariant("accepted offer missing"))?;
                let split = settlement::two_party(amount, offer.discount)?;
                Ok(SettlementPlan {
                    contract_type: ContractType::TwoParty,
                    invoice_amount: amount,
                    discount: offer.discount,
                    seller_receives: split.seller_receives,
                    financier_pays: None,
                    buyer_repays: split.seller_receives,
                    repayment_due_date: due,
                    seller,
                    buyer,
                    financier: None,
                    financier_rate: None,
                    processing_fee: None,
                    haircut: None,
                })
            }
            TermsRef::Bid(bid_id) => {
                let bid = self
                    .bid(bid_id)
                    .ok_or_else(|| DomainError::invariant("accepted bid missing"))?;
                let split = bid.split(amount)?;
                Ok(SettlementPlan {
                    contract_type: ContractType::ThreeParty,
                    invoice_amount: amount,
                    discount: bid.headline_rate(),
                    seller_receives: split.financier_pays,
                    financier_pays: Some(split.financier_pays),
                    buyer_repays: split.buyer_repays,
                    repayment_due_date: due,
                    seller,
                    buyer,
                    financier: Some(bid.financier),
                    financier_rate: Some(bid.discount_rate),
                    processing_fee: Some(bid.processing_fee),
                    haircut: bid.haircut,
                })
            }
        }
    }

    /// Offers and bids whose deadline passed but are still marked pending.
    pub fn stale_entries(&self, now: DateTime<Utc>) -> (Vec<OfferId>, Vec<BidId>) {
        let offers = self
            .offers
            .iter()
            .filter(|o| o.status == OfferStatus::Pending && o.is_expired_at(now))
            .map(|o| o.offer_id)
            .collect();
        let bids = self
            .bids
            .iter()
            .filter(|b| b.status == BidStatus::Pending && b.is_expired_at(now))
            .map(|b| b.bid_id)
            .collect();
        (offers, bids)
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateDraft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDraft {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub fields: InvoiceFields,
    pub source: FieldSource,
    pub product_type: ProductType,
    pub policy: FinancingPolicy,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateDraft (partial; `None` keeps the current value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDraft {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub fields: InvoiceFields,
    pub source: FieldSource,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitInvoice.
///
/// KYC outcomes are looked up by the caller and passed in as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub seller_kyc_approved: bool,
    pub buyer_kyc_approved: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcceptInvoice (buyer acknowledges the invoice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CreateOffer (buyer opens the discount negotiation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOffer {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub actor: PartyId,
    pub discount: Rate,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReviseOffer (buyer puts a new offer on the same chain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseOffer {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub actor: PartyId,
    pub discount: Rate,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcceptOffer (seller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptOffer {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectOffer (seller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectOffer {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub actor: PartyId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FallbackToStandardPayment (seller ends negotiation, gets paid on the due date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackToStandardPayment {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: OpenForBidding (seller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenForBidding {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitBid (financier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid_id: BidId,
    pub financier: PartyId,
    pub discount_rate: Rate,
    pub processing_fee: Rate,
    pub haircut: Option<Rate>,
    pub valid_until: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: WithdrawBid (the financier who placed it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawBid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid_id: BidId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcceptBid (seller or buyer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid_id: BidId,
    pub actor: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExpireStale (mark overdue offers/bids as expired as of `occurred_at`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireStale {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordFinanced (disbursement to the seller completed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFinanced {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub disbursement_id: DisbursementId,
    pub terms: TermsRef,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordRepaid (buyer repaid the financier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRepaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub repayment_id: RepaymentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmDefault (financier, once the repayment is overdue past grace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmDefault {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub repayment_id: RepaymentId,
    pub actor: PartyId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice (seller or buyer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub actor: PartyId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateDraft(CreateDraft),
    UpdateDraft(UpdateDraft),
    SubmitInvoice(SubmitInvoice),
    AcceptInvoice(AcceptInvoice),
    CreateOffer(CreateOffer),
    ReviseOffer(ReviseOffer),
    AcceptOffer(AcceptOffer),
    RejectOffer(RejectOffer),
    FallbackToStandardPayment(FallbackToStandardPayment),
    OpenForBidding(OpenForBidding),
    SubmitBid(SubmitBid),
    WithdrawBid(WithdrawBid),
    AcceptBid(AcceptBid),
    ExpireStale(ExpireStale),
    RecordFinanced(RecordFinanced),
    RecordRepaid(RecordRepaid),
    ConfirmDefault(ConfirmDefault),
    CancelInvoice(CancelInvoice),
}

impl InvoiceCommand {
    pub fn invoice_id(&self) -> InvoiceId {
        match self {
            InvoiceCommand::CreateDraft(c) => c.invoice_id,
            InvoiceCommand::UpdateDraft(c) => c.invoice_id,
            InvoiceCommand::SubmitInvoice(c) => c.invoice_id,
            InvoiceCommand::AcceptInvoice(c) => c.invoice_id,
            InvoiceCommand::CreateOffer(c) => c.invoice_id,
            InvoiceCommand::ReviseOffer(c) => c.invoice_id,
            InvoiceCommand::AcceptOffer(c) => c.invoice_id,
            InvoiceCommand::RejectOffer(c) => c.invoice_id,
            InvoiceCommand::FallbackToStandardPayment(c) => c.invoice_id,
            InvoiceCommand::OpenForBidding(c) => c.invoice_id,
            InvoiceCommand::SubmitBid(c) => c.invoice_id,
            InvoiceCommand::WithdrawBid(c) => c.invoice_id,
            InvoiceCommand::AcceptBid(c) => c.invoice_id,
            InvoiceCommand::ExpireStale(c) => c.invoice_id,
            InvoiceCommand::RecordFinanced(c) => c.invoice_id,
            InvoiceCommand::RecordRepaid(c) => c.invoice_id,
            InvoiceCommand::ConfirmDefault(c) => c.invoice_id,
            InvoiceCommand::CancelInvoice(c) => c.invoice_id,
        }
    }
}

impl Command for InvoiceCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.invoice_id().0
    }
}

/// Event: InvoiceDrafted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDrafted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub fields: InvoiceFields,
    pub source: FieldSource,
    pub product_type: ProductType,
    pub policy: FinancingPolicy,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DraftUpdated (carries only the changed fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftUpdated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub fields: InvoiceFields,
    pub source: FieldSource,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSubmitted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub amount: u64,
    pub due_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceAccepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceAccepted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub accepted_by: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DiscountOffered (initial offer or revision).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountOffered {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer: DiscountOffer,
    /// Pending offer this revision replaces, if any.
    pub supersedes: Option<OfferId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DiscountOfferAccepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountOfferAccepted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub discount: Rate,
    pub seller_receives: u64,
    pub accepted_by: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DiscountOfferRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountOfferRejected {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offer_id: OfferId,
    pub rejected_by: PartyId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: NegotiationClosed (seller fell back to standard payment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationClosed {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub closed_by: PartyId,
    pub rejected_offer: Option<OfferId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OpenedForBidding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedForBidding {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub opened_by: PartyId,
    pub rejected_offer: Option<OfferId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BidSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidSubmitted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid: Bid,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BidWithdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidWithdrawn {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid_id: BidId,
    pub financier: PartyId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BidAccepted. Rival pending bids are rejected in the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidAccepted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub bid_id: BidId,
    pub financier: PartyId,
    pub financier_pays: u64,
    pub accepted_by: PartyId,
    pub rejected_bids: Vec<BidId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StaleEntriesExpired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEntriesExpired {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub offers: Vec<OfferId>,
    pub bids: Vec<BidId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceFinanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFinanced {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub disbursement_id: DisbursementId,
    pub terms: TermsRef,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceRepaid.
///
/// `repayment_id` is `None` for two-party settlement, where the early payment
/// by the buyer is itself the settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRepaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub repayment_id: Option<RepaymentId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceDefaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDefaulted {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub repayment_id: RepaymentId,
    pub confirmed_by: PartyId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub cancelled_by: PartyId,
    pub reason: Option<String>,
    pub rejected_offers: Vec<OfferId>,
    pub rejected_bids: Vec<BidId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceDrafted(InvoiceDrafted),
    DraftUpdated(DraftUpdated),
    InvoiceSubmitted(InvoiceSubmitted),
    InvoiceAccepted(InvoiceAccepted),
    DiscountOffered(DiscountOffered),
    DiscountOfferAccepted(DiscountOfferAccepted),
    DiscountOfferRejected(DiscountOfferRejected),
    NegotiationClosed(NegotiationClosed),
    OpenedForBidding(OpenedForBidding),
    BidSubmitted(BidSubmitted),
    BidWithdrawn(BidWithdrawn),
    BidAccepted(BidAccepted),
    StaleEntriesExpired(StaleEntriesExpired),
    InvoiceFinanced(InvoiceFinanced),
    InvoiceRepaid(InvoiceRepaid),
    InvoiceDefaulted(InvoiceDefaulted),
    InvoiceCancelled(InvoiceCancelled),
}

impl InvoiceEvent {
    pub fn invoice_id(&self) -> InvoiceId {
        match self {
            InvoiceEvent::InvoiceDrafted(e) => e.invoice_id,
            InvoiceEvent::DraftUpdated(e) => e.invoice_id,
            InvoiceEvent::InvoiceSubmitted(e) => e.invoice_id,
            InvoiceEvent::InvoiceAccepted(e) => e.invoice_id,
            InvoiceEvent::DiscountOffered(e) => e.invoice_id,
            InvoiceEvent::DiscountOfferAccepted(e) => e.invoice_id,
            InvoiceEvent::DiscountOfferRejected(e) => e.invoice_id,
            InvoiceEvent::NegotiationClosed(e) => e.invoice_id,
            InvoiceEvent::OpenedForBidding(e) => e.invoice_id,
            InvoiceEvent::BidSubmitted(e) => e.invoice_id,
            InvoiceEvent::BidWithdrawn(e) => e.invoice_id,
            InvoiceEvent::BidAccepted(e) => e.invoice_id,
            InvoiceEvent::StaleEntriesExpired(e) => e.invoice_id,
            InvoiceEvent::InvoiceFinanced(e) => e.invoice_id,
            InvoiceEvent::InvoiceRepaid(e) => e.invoice_id,
            InvoiceEvent::InvoiceDefaulted(e) => e.invoice_id,
            InvoiceEvent::InvoiceCancelled(e) => e.invoice_id,
        }
    }
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceDrafted(_) => "financing.invoice.drafted",
            InvoiceEvent::DraftUpdated(_) => "financing.invoice.draft_updated",
            InvoiceEvent::InvoiceSubmitted(_) => "financing.invoice.submitted",
            InvoiceEvent::InvoiceAccepted(_) => "financing.invoice.accepted",
            InvoiceEvent::DiscountOffered(_) => "financing.invoice.discount_offered",
            InvoiceEvent::DiscountOfferAccepted(_) => "financing.invoice.discount_offer_accepted",
            InvoiceEvent::DiscountOfferRejected(_) => "financing.invoice.discount_offer_rejected",
            InvoiceEvent::NegotiationClosed(_) => "financing.invoice.negotiation_closed",
            InvoiceEvent::OpenedForBidding(_) => "financing.invoice.opened_for_bidding",
            InvoiceEvent::BidSubmitted(_) => "financing.invoice.bid_submitted",
            InvoiceEvent::BidWithdrawn(_) => "financing.invoice.bid_withdrawn",
            InvoiceEvent::BidAccepted(_) => "financing.invoice.bid_accepted",
            InvoiceEvent::StaleEntriesExpired(_) => "financing.invoice.stale_entries_expired",
            InvoiceEvent::InvoiceFinanced(_) => "financing.invoice.financed",
            InvoiceEvent::InvoiceRepaid(_) => "financing.invoice.repaid",
            InvoiceEvent::InvoiceDefaulted(_) => "financing.invoice.defaulted",
            InvoiceEvent::InvoiceCancelled(_) => "financing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceDrafted(e) => e.occurred_at,
            InvoiceEvent::DraftUpdated(e) => e.occurred_at,
            InvoiceEvent::InvoiceSubmitted(e) => e.occurred_at,
            InvoiceEvent::InvoiceAccepted(e) => e.occurred_at,
            InvoiceEvent::DiscountOffered(e) => e.occurred_at,
            InvoiceEvent::DiscountOfferAccepted(e) => e.occurred_at,
            InvoiceEvent::DiscountOfferRejected(e) => e.occurred_at,
            InvoiceEvent::NegotiationClosed(e) => e.occurred_at,
            InvoiceEvent::OpenedForBidding(e) => e.occurred_at,
            InvoiceEvent::BidSubmitted(e) => e.occurred_at,
            InvoiceEvent::BidWithdrawn(e) => e.occurred_at,
            InvoiceEvent::BidAccepted(e) => e.occurred_at,
            InvoiceEvent::StaleEntriesExpired(e) => e.occurred_at,
            InvoiceEvent::InvoiceFinanced(e) => e.occurred_at,
            InvoiceEvent::InvoiceRepaid(e) => e.occurred_at,
            InvoiceEvent::InvoiceDefaulted(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "financing.invoice";

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceDrafted(e) => {
                self.id = e.invoice_id;
                self.tenant_id = Some(e.tenant_id);
                self.seller = Some(e.seller);
                self.buyer = Some(e.buyer);
                self.fields = e.fields.clone();
                for name in e.fields.present() {
                    self.field_sources.insert(name.to_string(), e.source);
                }
                self.product_type = e.product_type;
                self.policy = e.policy;
                self.status = InvoiceStatus::Draft;
                self.created = true;
            }
            InvoiceEvent::DraftUpdated(e) => {
                self.fields = self.fields.merged_with(&e.fields);
                for name in e.fields.present() {
                    self.field_sources.insert(name.to_string(), e.source);
                }
            }
            InvoiceEvent::InvoiceSubmitted(_) => {
                self.status = InvoiceStatus::Submitted;
            }
            InvoiceEvent::InvoiceAccepted(_) => {
                self.status = InvoiceStatus::Accepted;
            }
            InvoiceEvent::DiscountOffered(e) => {
                if let Some(prev) = e.supersedes {
                    self.close_offer(
                        prev,
                        OfferStatus::Rejected,
                        format!("superseded by revision {}", e.offer.sequence),
                    );
                }
                self.offers.push(e.offer.clone());
            }
            InvoiceEvent::DiscountOfferAccepted(e) => {
                if let Some(offer) = self.offers.iter_mut().find(|o| o.offer_id == e.offer_id) {
                    offer.status = OfferStatus::Accepted;
                }
                self.accepted_terms = Some(TermsRef::Offer(e.offer_id));
                self.status = InvoiceStatus::Accepted;
            }
            InvoiceEvent::DiscountOfferRejected(e) => {
                let reason = e
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected by seller".to_string());
                self.close_offer(e.offer_id, OfferStatus::Rejected, reason);
            }
            InvoiceEvent::NegotiationClosed(e) => {
                if let Some(id) = e.rejected_offer {
                    self.close_offer(
                        id,
                        OfferStatus::Rejected,
                        "seller chose standard payment".to_string(),
                    );
                }
                self.negotiation_closed = true;
            }
            InvoiceEvent::OpenedForBidding(e) => {
                if let Some(id) = e.rejected_offer {
                    self.close_offer(
                        id,
                        OfferStatus::Rejected,
                        "invoice opened for bidding".to_string(),
                    );
                }
                self.product_type = ProductType::FinancierBacked;
                self.status = InvoiceStatus::OpenForBidding;
            }
            InvoiceEvent::BidSubmitted(e) => {
                self.bids.push(e.bid.clone());
            }
            InvoiceEvent::BidWithdrawn(e) => {
                self.close_bid(e.bid_id, BidStatus::Withdrawn, "withdrawn by financier");
            }
            InvoiceEvent::BidAccepted(e) => {
                if let Some(bid) = self.bids.iter_mut().find(|b| b.bid_id == e.bid_id) {
                    bid.status = BidStatus::Accepted;
                }
                for rival in &e.rejected_bids {
                    self.close_bid(*rival, BidStatus::Rejected, "another bid was accepted");
                }
                self.accepted_terms = Some(TermsRef::Bid(e.bid_id));
                self.status = InvoiceStatus::BidAccepted;
            }
            InvoiceEvent::StaleEntriesExpired(e) => {
                for id in &e.offers {
                    self.close_offer(*id, OfferStatus::Expired, "expired".to_string());
                }
                for id in &e.bids {
                    self.close_bid(*id, BidStatus::Rejected, "expired");
                }
            }
            InvoiceEvent::InvoiceFinanced(e) => {
                self.financed_by = Some(e.disbursement_id);
                self.status = InvoiceStatus::Financed;
            }
            InvoiceEvent::InvoiceRepaid(e) => {
                self.repaid_by = e.repayment_id;
                self.status = InvoiceStatus::Repaid;
            }
            InvoiceEvent::InvoiceDefaulted(e) => {
                self.status_reason = e.reason.clone();
                self.status = InvoiceStatus::Defaulted;
            }
            InvoiceEvent::InvoiceCancelled(e) => {
                for id in &e.rejected_offers {
                    self.close_offer(*id, OfferStatus::Rejected, "invoice cancelled".to_string());
                }
                for id in &e.rejected_bids {
                    self.close_bid(*id, BidStatus::Rejected, "invoice cancelled");
                }
                self.status_reason = e.reason.clone();
                self.status = InvoiceStatus::Cancelled;
            }
        }

        self.updated_at = Some(event.occurred_at());
        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateDraft(cmd) => self.handle_create_draft(cmd),
            InvoiceCommand::UpdateDraft(cmd) => self.handle_update_draft(cmd),
            InvoiceCommand::SubmitInvoice(cmd) => self.handle_submit(cmd),
            InvoiceCommand::AcceptInvoice(cmd) => self.handle_accept_invoice(cmd),
            InvoiceCommand::CreateOffer(cmd) => self.handle_create_offer(cmd),
            InvoiceCommand::ReviseOffer(cmd) => self.handle_revise_offer(cmd),
            InvoiceCommand::AcceptOffer(cmd) => self.handle_accept_offer(cmd),
            InvoiceCommand::RejectOffer(cmd) => self.handle_reject_offer(cmd),
            InvoiceCommand::FallbackToStandardPayment(cmd) => self.handle_fallback(cmd),
            InvoiceCommand::OpenForBidding(cmd) => self.handle_open_for_bidding(cmd),
            InvoiceCommand::SubmitBid(cmd) => self.handle_submit_bid(cmd),
            InvoiceCommand::WithdrawBid(cmd) => self.handle_withdraw_bid(cmd),
            InvoiceCommand::AcceptBid(cmd) => self.handle_accept_bid(cmd),
            InvoiceCommand::ExpireStale(cmd) => self.handle_expire_stale(cmd),
            InvoiceCommand::RecordFinanced(cmd) => self.handle_record_financed(cmd),
            InvoiceCommand::RecordRepaid(cmd) => self.handle_record_repaid(cmd),
            InvoiceCommand::ConfirmDefault(cmd) => self.handle_confirm_default(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Invoice {
    fn close_offer(&mut self, offer_id: OfferId, status: OfferStatus, reason: String) {
        if let Some(offer) = self.offers.iter_mut().find(|o| o.offer_id == offer_id) {
            offer.status = status;
            offer.closed_reason = Some(reason);
        }
    }

    fn close_bid(&mut self, bid_id: BidId, status: BidStatus, reason: &str) {
        if let Some(bid) = self.bids.iter_mut().find(|b| b.bid_id == bid_id) {
            bid.status = status;
            bid.closed_reason = Some(reason.to_string());
        }
    }

    fn parties(&self) -> DomainResult<(PartyId, PartyId)> {
        match (self.seller, self.buyer) {
            (Some(s), Some(b)) => Ok((s, b)),
            _ => Err(DomainError::not_found()),
        }
    }

    /// Existence, tenant and id checks shared by every command on a live invoice.
    pub(crate) fn ensure_target(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
    ) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    pub(crate) fn ensure_seller(&self, actor: PartyId, action: &str) -> DomainResult<()> {
        if self.seller != Some(actor) {
            return Err(DomainError::unauthorized(format!(
                "only the seller can {action}"
            )));
        }
        Ok(())
    }

    pub(crate) fn ensure_buyer(&self, actor: PartyId, action: &str) -> DomainResult<()> {
        if self.buyer != Some(actor) {
            return Err(DomainError::unauthorized(format!(
                "only the buyer can {action}"
            )));
        }
        Ok(())
    }

    /// Reject `action` unless the invoice is in one of `allowed`.
    pub(crate) fn ensure_status_in(
        &self,
        allowed: &[InvoiceStatus],
        action: &str,
    ) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::transition("invoice", self.status, action))
        }
    }

    /// Expire whatever is stale as of `now`, for handlers that write anyway.
    pub(crate) fn stale_event(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Option<InvoiceEvent> {
        let (offers, bids) = self.stale_entries(now);
        if offers.is_empty() && bids.is_empty() {
            return None;
        }
        Some(InvoiceEvent::StaleEntriesExpired(StaleEntriesExpired {
            tenant_id,
            invoice_id: self.id,
            offers,
            bids,
            occurred_at: now,
        }))
    }

    fn handle_create_draft(&self, cmd: &CreateDraft) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }
        if cmd.seller == cmd.buyer {
            return Err(DomainError::validation(
                "seller and buyer must be different parties",
            ));
        }
        if cmd.policy.max_offer_revisions == 0 {
            return Err(DomainError::validation(
                "max_offer_revisions must allow at least one offer",
            ));
        }
        cmd.fields.validate()?;

        Ok(vec![InvoiceEvent::InvoiceDrafted(InvoiceDrafted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            seller: cmd.seller,
            buyer: cmd.buyer,
            fields: cmd.fields.clone(),
            source: cmd.source,
            product_type: cmd.product_type,
            policy: cmd.policy,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_draft(&self, cmd: &UpdateDraft) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "edit the draft")?;
        self.ensure_status_in(&[InvoiceStatus::Draft], "DRAFT")?;

        if cmd.fields.present().is_empty() {
            return Err(DomainError::validation("draft update carries no fields"));
        }
        self.fields.merged_with(&cmd.fields).validate()?;

        Ok(vec![InvoiceEvent::DraftUpdated(DraftUpdated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            fields: cmd.fields.clone(),
            source: cmd.source,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_submit(&self, cmd: &SubmitInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_seller(cmd.actor, "submit the invoice")?;
        self.status.ensure_transition(InvoiceStatus::Submitted)?;

        let missing = self.fields.missing();
        if !missing.is_empty() {
            return Err(DomainError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        self.fields.validate()?;

        let (seller, buyer) = self.parties()?;
        let (Some(amount), Some(due_date)) = (self.fields.amount, self.fields.due_date) else {
            return Err(DomainError::invariant("required fields vanished"));
        };
        if due_date <= cmd.occurred_at {
            return Err(DomainError::validation("due_date has already passed"));
        }
        if !cmd.seller_kyc_approved {
            return Err(DomainError::validation("seller KYC is not approved"));
        }
        if !cmd.buyer_kyc_approved {
            return Err(DomainError::validation("buyer KYC is not approved"));
        }

        Ok(vec![InvoiceEvent::InvoiceSubmitted(InvoiceSubmitted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            seller,
            buyer,
            amount,
            due_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_accept_invoice(
        &self,
        cmd: &AcceptInvoice,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.ensure_buyer(cmd.actor, "accept the invoice")?;
        self.status.ensure_transition(InvoiceStatus::Accepted)?;

        Ok(vec![InvoiceEvent::InvoiceAccepted(InvoiceAccepted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            accepted_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_expire_stale(&self, cmd: &ExpireStale) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        Ok(self
            .stale_event(cmd.tenant_id, cmd.occurred_at)
            .into_iter()
            .collect())
    }

    fn handle_record_financed(
        &self,
        cmd: &RecordFinanced,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;

        if self.financed_by == Some(cmd.disbursement_id) {
            return Ok(vec![]);
        }
        if self.accepted_terms != Some(cmd.terms) {
            return Err(DomainError::conflict(
                "disbursement does not match the accepted terms",
            ));
        }
        self.status.ensure_transition(InvoiceStatus::Financed)?;

        let mut events = vec![InvoiceEvent::InvoiceFinanced(InvoiceFinanced {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            disbursement_id: cmd.disbursement_id,
            terms: cmd.terms,
            occurred_at: cmd.occurred_at,
        })];
        // Buyer-funded early payment settles the invoice outright.
        if cmd.terms.contract_type() == ContractType::TwoParty {
            events.push(InvoiceEvent::InvoiceRepaid(InvoiceRepaid {
                tenant_id: cmd.tenant_id,
                invoice_id: cmd.invoice_id,
                repayment_id: None,
                occurred_at: cmd.occurred_at,
            }));
        }
        Ok(events)
    }

    fn handle_record_repaid(&self, cmd: &RecordRepaid) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;

        if self.status == InvoiceStatus::Repaid && self.repaid_by == Some(cmd.repayment_id) {
            return Ok(vec![]);
        }
        self.status.ensure_transition(InvoiceStatus::Repaid)?;
        if !matches!(self.accepted_terms, Some(TermsRef::Bid(_))) {
            return Err(DomainError::conflict(
                "only financier-backed invoices settle through a repayment",
            ));
        }

        Ok(vec![InvoiceEvent::InvoiceRepaid(InvoiceRepaid {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            repayment_id: Some(cmd.repayment_id),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm_default(
        &self,
        cmd: &ConfirmDefault,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        self.status.ensure_transition(InvoiceStatus::Defaulted)?;

        let financier = match self.accepted_terms {
            Some(TermsRef::Bid(bid_id)) => self.bid(bid_id).map(|b| b.financier),
            _ => None,
        };
        if financier != Some(cmd.actor) {
            return Err(DomainError::unauthorized(
                "only the financier can confirm a default",
            ));
        }

        Ok(vec![InvoiceEvent::InvoiceDefaulted(InvoiceDefaulted {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            repayment_id: cmd.repayment_id,
            confirmed_by: cmd.actor,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_target(cmd.tenant_id, cmd.invoice_id)?;
        if self.seller != Some(cmd.actor) && self.buyer != Some(cmd.actor) {
            return Err(DomainError::unauthorized(
                "only the seller or buyer can cancel the invoice",
            ));
        }
        self.status.ensure_transition(InvoiceStatus::Cancelled)?;

        let rejected_offers = self
            .offers
            .iter()
            .filter(|o| o.status == OfferStatus::Pending)
            .map(|o| o.offer_id)
            .collect();
        let rejected_bids = self
            .bids
            .iter()
            .filter(|b| b.status == BidStatus::Pending)
            .map(|b| b.bid_id)
            .collect();

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            cancelled_by: cmd.actor,
            reason: cmd.reason.clone(),
            rejected_offers,
            rejected_bids,
            occurred_at: cmd.occurred_at,
        })])
    }
}
