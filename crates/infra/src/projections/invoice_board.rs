use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use finflow_core::{Aggregate, AggregateId, PartyId, Rate, TenantId};
use finflow_events::EventEnvelope;
use finflow_financing::{
    Contract, ContractEvent, ContractId, ContractStatus, Disbursement, DisbursementEvent,
    DisbursementId, DisbursementStatus, Invoice, InvoiceEvent, InvoiceId, InvoiceStatus,
    OfferId, ProductType, Repayment, RepaymentEvent, RepaymentId, RepaymentStatus, TermsRef,
};

use crate::event_store::{EventStore, EventStoreError};
use crate::read_model::{InMemoryTenantStore, TenantStore};

/// One line of the invoice board: where an invoice stands in its lifecycle,
/// what is open on it, and which settlement streams belong to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceBoardRow {
    pub invoice_id: InvoiceId,
    pub invoice_number: Option<String>,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub amount: Option<u64>,
    pub due_date: Option<DateTime<Utc>>,
    pub status: InvoiceStatus,
    pub product_type: ProductType,
    pub grace_period_days: u32,
    pub pending_offer: Option<PendingOffer>,
    pub pending_bids: Vec<PendingBid>,
    pub accepted_terms: Option<TermsRef>,
    pub contract_id: Option<ContractId>,
    pub contract_status: Option<ContractStatus>,
    pub disbursement_id: Option<DisbursementId>,
    pub disbursement_status: Option<DisbursementStatus>,
    pub repayment_id: Option<RepaymentId>,
    pub repayment_status: Option<RepaymentStatus>,
    pub repayment_due: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOffer {
    pub offer_id: OfferId,
    pub discount: Rate,
    pub expires_at: DateTime<Utc>,
    pub revisions_remaining: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingBid {
    pub bid_id: finflow_financing::BidId,
    pub financier: PartyId,
    pub headline_rate: Rate,
    pub valid_until: DateTime<Utc>,
}

impl InvoiceBoardRow {
    /// Earliest offer or bid deadline still open on the board.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending_offer
            .iter()
            .map(|o| o.expires_at)
            .chain(self.pending_bids.iter().map(|b| b.valid_until))
            .min()
    }

    pub fn has_stale_entries(&self, now: DateTime<Utc>) -> bool {
        self.next_deadline().is_some_and(|deadline| deadline <= now)
    }

    pub fn live_bid_count(&self, now: DateTime<Utc>) -> usize {
        self.pending_bids.iter().filter(|b| b.valid_until > now).count()
    }

    pub fn lowest_live_rate(&self, now: DateTime<Utc>) -> Option<Rate> {
        self.pending_bids
            .iter()
            .filter(|b| b.valid_until > now)
            .map(|b| b.headline_rate)
            .min()
    }

    /// Repayment due date passed but not yet recorded as overdue.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.repayment_status == Some(RepaymentStatus::Pending)
            && self.repayment_due.is_some_and(|due| now > due)
    }

    /// Overdue past the grace period: reported, defaulted only on
    /// confirmation by the financier.
    pub fn is_default_candidate(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Financed
            && self.repayment_status == Some(RepaymentStatus::Overdue)
            && self.repayment_due.is_some_and(|due| {
                now > due + Duration::days(i64::from(self.grace_period_days))
            })
    }

    /// Settlement streams disagree with the invoice status.
    pub fn settlement_lagging(&self) -> bool {
        let Some(terms) = self.accepted_terms else {
            return false;
        };
        match self.status {
            InvoiceStatus::Accepted | InvoiceStatus::BidAccepted => {
                self.contract_id.is_none()
                    || self.disbursement_id.is_none()
                    || self.disbursement_status == Some(DisbursementStatus::Completed)
            }
            InvoiceStatus::Financed => {
                matches!(terms, TermsRef::Bid(_))
                    && (self.repayment_id.is_none()
                        || self.repayment_status == Some(RepaymentStatus::Completed))
            }
            InvoiceStatus::Repaid => self.contract_status == Some(ContractStatus::Active),
            InvoiceStatus::Cancelled => {
                self.contract_status == Some(ContractStatus::Active)
                    || matches!(
                        self.disbursement_status,
                        Some(
                            DisbursementStatus::Pending
                                | DisbursementStatus::Processing
                                | DisbursementStatus::Failed
                        )
                    )
                    || matches!(
                        self.repayment_status,
                        Some(RepaymentStatus::Pending | RepaymentStatus::Overdue)
                    )
            }
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum BoardProjectionError {
    #[error("failed to deserialize {aggregate_type} event: {message}")]
    Deserialize {
        aggregate_type: String,
        message: String,
    },

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// An event is missing before this one; the stream must be synced.
    #[error("sequence gap (last={last}, found={found})")]
    SequenceGap { last: u64, found: u64 },

    /// A settlement event arrived before its invoice row or owner link.
    #[error("no invoice known for {0}")]
    UnknownInvoice(AggregateId),

    #[error("event store failure: {0}")]
    Store(#[from] EventStoreError),
}

/// Invoice board projection over every financing stream.
///
/// Idempotent per (tenant, stream) cursor: redelivered events are skipped;
/// a gap means an event was overtaken on the bus, and [`handle`](Self::handle)
/// fills it from the event store.
#[derive(Debug)]
pub struct InvoiceBoardProjection<S = InMemoryTenantStore<InvoiceId, InvoiceBoardRow>> {
    rows: S,
    owners: RwLock<HashMap<CursorKey, InvoiceId>>,
    cursors: RwLock<HashMap<CursorKey, u64>>,
    tenants: RwLock<HashSet<TenantId>>,
}

impl InvoiceBoardProjection {
    pub fn in_memory() -> Self {
        Self::new(InMemoryTenantStore::new())
    }
}

impl<S> InvoiceBoardProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceBoardRow>,
{
    pub fn new(rows: S) -> Self {
        Self {
            rows,
            owners: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
            tenants: RwLock::new(HashSet::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> Option<InvoiceBoardRow> {
        self.rows.get(tenant_id, &invoice_id)
    }

    /// Rows of a tenant, optionally by status, most recently changed first.
    pub fn list(&self, tenant_id: TenantId, status: Option<InvoiceStatus>) -> Vec<InvoiceBoardRow> {
        let mut rows: Vec<_> = self
            .rows
            .list(tenant_id)
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.invoice_id.as_uuid().cmp(b.invoice_id.as_uuid()))
        });
        rows
    }

    /// Tenants seen so far.
    pub fn tenants(&self) -> Vec<TenantId> {
        self.tenants
            .read()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Open invoices with an offer or bid past its deadline.
    pub fn with_stale_entries(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Vec<InvoiceId> {
        self.rows
            .list(tenant_id)
            .into_iter()
            .filter(|r| !r.status.is_terminal() && r.has_stale_entries(now))
            .map(|r| r.invoice_id)
            .collect()
    }

    pub fn past_due_repayments(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Vec<RepaymentId> {
        self.rows
            .list(tenant_id)
            .into_iter()
            .filter(|r| r.is_past_due(now))
            .filter_map(|r| r.repayment_id)
            .collect()
    }

    pub fn default_candidates(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Vec<InvoiceBoardRow> {
        self.rows
            .list(tenant_id)
            .into_iter()
            .filter(|r| r.is_default_candidate(now))
            .collect()
    }

    pub fn lagging_settlements(&self, tenant_id: TenantId) -> Vec<InvoiceId> {
        self.rows
            .list(tenant_id)
            .into_iter()
            .filter(InvoiceBoardRow::settlement_lagging)
            .map(|r| r.invoice_id)
            .collect()
    }

    /// Apply a delivered envelope, syncing the stream from `store` when
    /// events were overtaken. Returns how many events were applied.
    pub fn handle<St: EventStore>(
        &self,
        store: &St,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<usize, BoardProjectionError> {
        match self.apply_envelope(envelope) {
            Ok(applied) => Ok(usize::from(applied)),
            Err(BoardProjectionError::SequenceGap { .. }) => {
                self.sync_stream(store, envelope.tenant_id(), envelope.aggregate_id())
            }
            Err(err) => Err(err),
        }
    }

    /// Apply every stored event of a stream past the cursor.
    pub fn sync_stream<St: EventStore>(
        &self,
        store: &St,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<usize, BoardProjectionError> {
        let mut applied = 0;
        for stored in store.load_stream(tenant_id, aggregate_id)? {
            if self.apply_envelope(&stored.to_envelope())? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Drop a tenant's board and replay `envelopes` (in commit order).
    pub fn rebuild_from_scratch(
        &self,
        tenant_id: TenantId,
        envelopes: &[EventEnvelope<JsonValue>],
    ) -> Result<(), BoardProjectionError> {
        self.rows.clear_tenant(tenant_id);
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.retain(|k, _| k.tenant_id != tenant_id);
        }
        if let Ok(mut owners) = self.owners.write() {
            owners.retain(|k, _| k.tenant_id != tenant_id);
        }
        for envelope in envelopes.iter().filter(|e| e.tenant_id() == tenant_id) {
            self.apply_envelope(envelope)?;
        }
        Ok(())
    }

    /// Apply one envelope. `Ok(false)` for duplicates and foreign streams.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<bool, BoardProjectionError> {
        let aggregate_type = envelope.aggregate_type();
        if ![
            Invoice::AGGREGATE_TYPE,
            Contract::AGGREGATE_TYPE,
            Disbursement::AGGREGATE_TYPE,
            Repayment::AGGREGATE_TYPE,
        ]
        .contains(&aggregate_type)
        {
            return Ok(false);
        }

        let key = CursorKey {
            tenant_id: envelope.tenant_id(),
            aggregate_id: envelope.aggregate_id(),
        };
        let last = self.cursor(key);
        let found = envelope.sequence_number();
        if found <= last {
            return Ok(false);
        }
        if found != last + 1 {
            return Err(BoardProjectionError::SequenceGap { last, found });
        }

        if payload_tenant(envelope.payload()) != Some(key.tenant_id) {
            return Err(BoardProjectionError::TenantIsolation(format!(
                "{} event {} does not belong to tenant {}",
                aggregate_type,
                envelope.event_id(),
                key.tenant_id
            )));
        }

        match aggregate_type {
            t if t == Invoice::AGGREGATE_TYPE => {
                let event: InvoiceEvent = decode(envelope)?;
                if event.invoice_id().0 != key.aggregate_id {
                    return Err(BoardProjectionError::TenantIsolation(
                        "invoice event routed to a different stream".to_string(),
                    ));
                }
                self.apply_invoice(key.tenant_id, &event)?;
            }
            t if t == Contract::AGGREGATE_TYPE => {
                let event: ContractEvent = decode(envelope)?;
                self.apply_contract(key, &event)?;
            }
            t if t == Disbursement::AGGREGATE_TYPE => {
                let event: DisbursementEvent = decode(envelope)?;
                self.apply_disbursement(key, &event)?;
            }
            _ => {
                let event: RepaymentEvent = decode(envelope)?;
                self.apply_repayment(key, &event)?;
            }
        }

        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(key, found);
        }
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.insert(key.tenant_id);
        }
        Ok(true)
    }

    fn cursor(&self, key: CursorKey) -> u64 {
        self.cursors
            .read()
            .ok()
            .and_then(|c| c.get(&key).copied())
            .unwrap_or(0)
    }

    fn link(&self, key: CursorKey, invoice_id: InvoiceId) {
        if let Ok(mut owners) = self.owners.write() {
            owners.insert(key, invoice_id);
        }
    }

    fn owner(&self, key: CursorKey) -> Result<InvoiceId, BoardProjectionError> {
        self.owners
            .read()
            .ok()
            .and_then(|o| o.get(&key).copied())
            .ok_or(BoardProjectionError::UnknownInvoice(key.aggregate_id))
    }

    /// Modify an existing row; settlement events never create rows.
    fn modify(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        at: DateTime<Utc>,
        f: impl Fn(&mut InvoiceBoardRow),
    ) -> Result<(), BoardProjectionError> {
        let mut found = false;
        self.rows.update(tenant_id, invoice_id, &mut |current| {
            let mut row = current?.clone();
            found = true;
            f(&mut row);
            row.updated_at = row.updated_at.max(at);
            Some(row)
        });
        if found {
            Ok(())
        } else {
            Err(BoardProjectionError::UnknownInvoice(invoice_id.0))
        }
    }

    fn apply_invoice(
        &self,
        tenant_id: TenantId,
        event: &InvoiceEvent,
    ) -> Result<(), BoardProjectionError> {
        let invoice_id = event.invoice_id();
        let at = finflow_events::Event::occurred_at(event);

        if let InvoiceEvent::InvoiceDrafted(e) = event {
            self.rows.upsert(
                tenant_id,
                invoice_id,
                InvoiceBoardRow {
                    invoice_id,
                    invoice_number: e.fields.invoice_number.clone(),
                    seller: e.seller,
                    buyer: e.buyer,
                    amount: e.fields.amount,
                    due_date: e.fields.due_date,
                    status: InvoiceStatus::Draft,
                    product_type: e.product_type,
                    grace_period_days: e.policy.default_grace_period_days,
                    pending_offer: None,
                    pending_bids: Vec::new(),
                    accepted_terms: None,
                    contract_id: None,
                    contract_status: None,
                    disbursement_id: None,
                    disbursement_status: None,
                    repayment_id: None,
                    repayment_status: None,
                    repayment_due: None,
                    updated_at: e.occurred_at,
                },
            );
            return Ok(());
        }

        self.modify(tenant_id, invoice_id, at, |row| match event {
            InvoiceEvent::InvoiceDrafted(_) => {}
            InvoiceEvent::DraftUpdated(e) => {
                if e.fields.invoice_number.is_some() {
                    row.invoice_number = e.fields.invoice_number.clone();
                }
                if e.fields.amount.is_some() {
                    row.amount = e.fields.amount;
                }
                if e.fields.due_date.is_some() {
                    row.due_date = e.fields.due_date;
                }
            }
            InvoiceEvent::InvoiceSubmitted(e) => {
                row.status = InvoiceStatus::Submitted;
                row.amount = Some(e.amount);
                row.due_date = Some(e.due_date);
            }
            InvoiceEvent::InvoiceAccepted(_) => row.status = InvoiceStatus::Accepted,
            InvoiceEvent::DiscountOffered(e) => {
                row.pending_offer = Some(PendingOffer {
                    offer_id: e.offer.offer_id,
                    discount: e.offer.discount,
                    expires_at: e.offer.expires_at,
                    revisions_remaining: e.offer.revisions_remaining,
                });
            }
            InvoiceEvent::DiscountOfferAccepted(e) => {
                row.pending_offer = None;
                row.accepted_terms = Some(TermsRef::Offer(e.offer_id));
                row.status = InvoiceStatus::Accepted;
            }
            InvoiceEvent::DiscountOfferRejected(e) => {
                if row.pending_offer.as_ref().is_some_and(|o| o.offer_id == e.offer_id) {
                    row.pending_offer = None;
                }
            }
            InvoiceEvent::NegotiationClosed(_) => row.pending_offer = None,
            InvoiceEvent::OpenedForBidding(_) => {
                row.pending_offer = None;
                row.status = InvoiceStatus::OpenForBidding;
            }
            InvoiceEvent::BidSubmitted(e) => row.pending_bids.push(PendingBid {
                bid_id: e.bid.bid_id,
                financier: e.bid.financier,
                headline_rate: e.bid.headline_rate(),
                valid_until: e.bid.valid_until,
            }),
            InvoiceEvent::BidWithdrawn(e) => row.pending_bids.retain(|b| b.bid_id != e.bid_id),
            InvoiceEvent::BidAccepted(e) => {
                row.pending_bids.clear();
                row.accepted_terms = Some(TermsRef::Bid(e.bid_id));
                row.status = InvoiceStatus::BidAccepted;
            }
            InvoiceEvent::StaleEntriesExpired(e) => {
                if row.pending_offer.as_ref().is_some_and(|o| e.offers.contains(&o.offer_id)) {
                    row.pending_offer = None;
                }
                row.pending_bids.retain(|b| !e.bids.contains(&b.bid_id));
            }
            InvoiceEvent::InvoiceFinanced(e) => {
                row.status = InvoiceStatus::Financed;
                row.disbursement_id = Some(e.disbursement_id);
            }
            InvoiceEvent::InvoiceRepaid(e) => {
                row.status = InvoiceStatus::Repaid;
                if e.repayment_id.is_some() {
                    row.repayment_id = e.repayment_id;
                }
            }
            InvoiceEvent::InvoiceDefaulted(_) => row.status = InvoiceStatus::Defaulted,
            InvoiceEvent::InvoiceCancelled(_) => {
                row.status = InvoiceStatus::Cancelled;
                row.pending_offer = None;
                row.pending_bids.clear();
            }
        })
    }

    fn apply_contract(
        &self,
        key: CursorKey,
        event: &ContractEvent,
    ) -> Result<(), BoardProjectionError> {
        let (invoice_id, contract_id, status, at) = match event {
            ContractEvent::ContractGenerated(e) => {
                self.link(key, e.terms.invoice_id);
                (e.terms.invoice_id, e.contract_id, ContractStatus::Active, e.occurred_at)
            }
            ContractEvent::ContractCompleted(e) => {
                (self.owner(key)?, e.contract_id, ContractStatus::Completed, e.occurred_at)
            }
            ContractEvent::ContractCancelled(e) => {
                (self.owner(key)?, e.contract_id, ContractStatus::Cancelled, e.occurred_at)
            }
        };
        self.modify(key.tenant_id, invoice_id, at, |row| {
            row.contract_id = Some(contract_id);
            row.contract_status = Some(status);
        })
    }

    fn apply_disbursement(
        &self,
        key: CursorKey,
        event: &DisbursementEvent,
    ) -> Result<(), BoardProjectionError> {
        let invoice_id = match event {
            DisbursementEvent::DisbursementInitiated(e) => {
                self.link(key, e.invoice_id);
                e.invoice_id
            }
            _ => self.owner(key)?,
        };
        let status = match event {
            DisbursementEvent::DisbursementInitiated(_)
            | DisbursementEvent::DisbursementRetried(_) => DisbursementStatus::Pending,
            DisbursementEvent::DisbursementProcessing(_) => DisbursementStatus::Processing,
            DisbursementEvent::DisbursementCompleted(_) => DisbursementStatus::Completed,
            DisbursementEvent::DisbursementFailed(_) => DisbursementStatus::Failed,
            DisbursementEvent::DisbursementCancelled(_) => DisbursementStatus::Cancelled,
        };
        let at = finflow_events::Event::occurred_at(event);
        let disbursement_id = DisbursementId::new(key.aggregate_id);
        self.modify(key.tenant_id, invoice_id, at, |row| {
            row.disbursement_id = Some(disbursement_id);
            row.disbursement_status = Some(status);
        })
    }

    fn apply_repayment(
        &self,
        key: CursorKey,
        event: &RepaymentEvent,
    ) -> Result<(), BoardProjectionError> {
        let repayment_id = RepaymentId::new(key.aggregate_id);
        match event {
            RepaymentEvent::RepaymentScheduled(e) => {
                self.link(key, e.invoice_id);
                let due = e.due_date;
                self.modify(key.tenant_id, e.invoice_id, e.occurred_at, |row| {
                    row.repayment_id = Some(repayment_id);
                    row.repayment_status = Some(RepaymentStatus::Pending);
                    row.repayment_due = Some(due);
                })
            }
            RepaymentEvent::RepaymentOverdue(e) => {
                self.modify(key.tenant_id, e.invoice_id, e.occurred_at, |row| {
                    row.repayment_id = Some(repayment_id);
                    row.repayment_status = Some(RepaymentStatus::Overdue);
                })
            }
            RepaymentEvent::RepaymentCompleted(e) => {
                self.modify(key.tenant_id, e.invoice_id, e.occurred_at, |row| {
                    row.repayment_id = Some(repayment_id);
                    row.repayment_status = Some(RepaymentStatus::Completed);
                })
            }
            RepaymentEvent::RepaymentCancelled(e) => {
                self.modify(key.tenant_id, e.invoice_id, e.occurred_at, |row| {
                    row.repayment_id = Some(repayment_id);
                    row.repayment_status = Some(RepaymentStatus::Cancelled);
                })
            }
        }
    }
}

fn decode<E: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<E, BoardProjectionError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| {
        BoardProjectionError::Deserialize {
            aggregate_type: envelope.aggregate_type().to_string(),
            message: e.to_string(),
        }
    })
}

/// `tenant_id` of an externally tagged event payload.
fn payload_tenant(payload: &JsonValue) -> Option<TenantId> {
    let body = payload.as_object()?.values().next()?;
    serde_json::from_value(body.get("tenant_id")?.clone()).ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use finflow_financing::invoice::{DiscountOffered, InvoiceDrafted};
    use finflow_financing::{DiscountOffer, FieldSource, FinancingPolicy, InvoiceFields, OfferStatus};

    use super::*;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn envelope(
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        seq: u64,
        event: &InvoiceEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            invoice_id.0,
            Invoice::AGGREGATE_TYPE.to_string(),
            seq,
            finflow_events::Event::event_type(event).to_string(),
            finflow_events::Event::occurred_at(event),
            serde_json::to_value(event).unwrap(),
        )
    }

    fn drafted(tenant_id: TenantId, invoice_id: InvoiceId) -> InvoiceEvent {
        InvoiceEvent::InvoiceDrafted(InvoiceDrafted {
            tenant_id,
            invoice_id,
            seller: PartyId::new(),
            buyer: PartyId::new(),
            fields: InvoiceFields {
                invoice_number: Some("INV-7".to_string()),
                amount: Some(1_000_000),
                ..InvoiceFields::default()
            },
            source: FieldSource::Manual,
            product_type: ProductType::SelfFundedDiscount,
            policy: FinancingPolicy::default(),
            occurred_at: at(1),
        })
    }

    fn offered(tenant_id: TenantId, invoice_id: InvoiceId, buyer: PartyId) -> InvoiceEvent {
        InvoiceEvent::DiscountOffered(DiscountOffered {
            tenant_id,
            invoice_id,
            offer: DiscountOffer {
                offer_id: OfferId::new(),
                sequence: 1,
                discount: Rate::from_bps(200),
                offered_by: buyer,
                offered_at: at(2),
                expires_at: at(5),
                status: OfferStatus::Pending,
                revisions_remaining: 2,
                closed_reason: None,
            },
            supersedes: None,
            occurred_at: at(2),
        })
    }

    #[test]
    fn redelivery_is_skipped_and_gaps_are_reported() {
        let board = InvoiceBoardProjection::in_memory();
        let tenant = TenantId::new();
        let invoice = InvoiceId::new(AggregateId::new());

        let first = envelope(tenant, invoice, 1, &drafted(tenant, invoice));
        assert!(board.apply_envelope(&first).unwrap());
        assert!(!board.apply_envelope(&first).unwrap());

        let third = envelope(tenant, invoice, 3, &offered(tenant, invoice, PartyId::new()));
        let err = board.apply_envelope(&third).unwrap_err();
        assert!(matches!(err, BoardProjectionError::SequenceGap { last: 1, found: 3 }));
    }

    #[test]
    fn pending_offer_drives_the_stale_query() {
        let board = InvoiceBoardProjection::in_memory();
        let tenant = TenantId::new();
        let invoice = InvoiceId::new(AggregateId::new());

        board
            .apply_envelope(&envelope(tenant, invoice, 1, &drafted(tenant, invoice)))
            .unwrap();
        board
            .apply_envelope(&envelope(tenant, invoice, 2, &offered(tenant, invoice, PartyId::new())))
            .unwrap();

        let row = board.get(tenant, invoice).unwrap();
        assert_eq!(row.next_deadline(), Some(at(5)));
        assert!(board.with_stale_entries(tenant, at(4)).is_empty());
        assert_eq!(board.with_stale_entries(tenant, at(6)), vec![invoice]);
        assert_eq!(board.tenants(), vec![tenant]);
    }

    #[test]
    fn payload_of_another_tenant_is_refused() {
        let board = InvoiceBoardProjection::in_memory();
        let tenant = TenantId::new();
        let invoice = InvoiceId::new(AggregateId::new());

        let foreign = envelope(tenant, invoice, 1, &drafted(TenantId::new(), invoice));
        assert!(matches!(
            board.apply_envelope(&foreign),
            Err(BoardProjectionError::TenantIsolation(_))
        ));
        assert!(board.get(tenant, invoice).is_none());
    }
}
