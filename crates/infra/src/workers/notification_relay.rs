use std::io;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument};

use finflow_core::{Aggregate, PartyId, TenantId};
use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::{
    Disbursement, DisbursementEvent, DisbursementId, Invoice, InvoiceEvent, Repayment,
    RepaymentEvent, RepaymentId, settlement,
};
use finflow_financing::invoice::{NegotiationClosed, OpenedForBidding};

use super::outbox::{Delivery, DeliveryOutbox, RedeliveryReport, RetryPolicy};
use super::{BusWorker, WorkerHandle};
use crate::engine::{EngineError, FinancingEngine};
use crate::event_store::EventStore;
use crate::external::{ExternalError, Notification, NotificationKind, NotificationSink};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to deserialize {event_type}: {message}")]
    Deserialize { event_type: String, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Sink(#[from] ExternalError),
}

/// Turns committed financing events into notifications for the party that
/// has to act on them.
///
/// Notifications are keyed by source event id, so a redelivered envelope
/// produces the same delivery key and the sink drops it. A delivery that
/// fails is parked in the outbox and retried with backoff, which makes
/// delivery at-least-once as long as the policy has attempts left.
pub struct NotificationRelay<S, B, N> {
    engine: Arc<FinancingEngine<S, B>>,
    sink: N,
    outbox: DeliveryOutbox,
}

impl<S, B, N> NotificationRelay<S, B, N>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(engine: Arc<FinancingEngine<S, B>>, sink: N) -> Self {
        Self {
            engine,
            sink,
            outbox: DeliveryOutbox::default(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.outbox = DeliveryOutbox::new(policy);
        self
    }

    pub fn outbox(&self) -> &DeliveryOutbox {
        &self.outbox
    }

    /// Relay everything published on `bus` from now on, retrying parked
    /// deliveries between envelopes.
    pub fn spawn(self: Arc<Self>, bus: &B) -> io::Result<WorkerHandle> {
        let relay = self.clone();
        BusWorker::spawn_with_tick(
            "notification-relay",
            bus,
            None,
            move |envelope| relay.handle(&envelope).map(|_| ()),
            move || {
                self.redeliver_due(Instant::now());
            },
        )
    }

    /// Notifications sent for one envelope.
    ///
    /// On error the failed part is already parked for retry, except for
    /// payloads that cannot be decoded, which are dead-lettered.
    #[instrument(skip_all, fields(event_type = envelope.event_type(), event_id = %envelope.event_id()))]
    pub fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<usize, RelayError> {
        self.attempt(Delivery::Envelope(envelope.clone()), 0, Instant::now())
    }

    /// Retry every parked delivery whose backoff has elapsed at `now`.
    pub fn redeliver_due(&self, now: Instant) -> RedeliveryReport {
        let mut report = RedeliveryReport::default();
        for (delivery, attempts) in self.outbox.take_due(now) {
            let before = self.outbox.dead_lettered();
            match self.attempt(delivery, attempts, now) {
                Ok(_) => report.delivered += 1,
                Err(_) if self.outbox.dead_lettered() > before => report.dead_lettered += 1,
                Err(_) => report.rescheduled += 1,
            }
        }
        if !report.is_empty() {
            info!(
                delivered = report.delivered,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                "notification redelivery"
            );
        }
        report
    }

    /// One attempt at `delivery`, `attempts` made before it. Whatever fails
    /// is parked with the attempt counted.
    fn attempt(
        &self,
        delivery: Delivery,
        attempts: u32,
        now: Instant,
    ) -> Result<usize, RelayError> {
        let notifications = match delivery {
            Delivery::Notification(n) => vec![n],
            Delivery::Envelope(envelope) => match self.notifications_for(&envelope) {
                Ok(notifications) => notifications,
                Err(err @ RelayError::Deserialize { .. }) => {
                    self.outbox
                        .reject(Delivery::Envelope(envelope), attempts + 1, err.to_string());
                    return Err(err);
                }
                Err(err) => {
                    self.outbox.park(
                        Delivery::Envelope(envelope),
                        attempts + 1,
                        err.to_string(),
                        now,
                    );
                    return Err(err);
                }
            },
        };

        let mut sent = 0;
        let mut failure = None;
        for n in notifications {
            match self.sink.send(&n) {
                Ok(()) => {
                    sent += 1;
                    debug!(recipient = %n.recipient, kind = n.kind.as_str(), "notification sent");
                }
                Err(err) => {
                    self.outbox
                        .park(Delivery::Notification(n), attempts + 1, err.to_string(), now);
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(sent),
        }
    }

    fn notifications_for(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<Vec<Notification>, RelayError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_type = envelope.aggregate_type();

        if aggregate_type == Invoice::AGGREGATE_TYPE {
            let event: InvoiceEvent = decode(envelope)?;
            self.for_invoice_event(envelope, &event)
        } else if aggregate_type == Disbursement::AGGREGATE_TYPE {
            let DisbursementEvent::DisbursementCompleted(e) = decode(envelope)? else {
                return Ok(Vec::new());
            };
            let disbursement = self
                .engine
                .disbursement(tenant_id, DisbursementId::new(envelope.aggregate_id()))?;
            let (Some(payer), Some(payee)) = (disbursement.payer(), disbursement.payee()) else {
                return Ok(Vec::new());
            };
            let invoice = self.engine.invoice(tenant_id, e.invoice_id)?;
            let payer_name = self.name_of(tenant_id, payer)?;
            Ok(vec![self.notification(
                envelope,
                &invoice,
                payee,
                NotificationKind::PaymentDisbursed,
                payer_name.clone(),
                Some(e.amount),
                format!(
                    "{} disbursed {} for invoice {}",
                    payer_name.as_deref().unwrap_or("The payer"),
                    e.amount,
                    number_of(&invoice)
                ),
            )])
        } else if aggregate_type == Repayment::AGGREGATE_TYPE {
            let repayment_id = RepaymentId::new(envelope.aggregate_id());
            let (invoice_id, overdue_days) = match decode(envelope)? {
                RepaymentEvent::RepaymentScheduled(e) => (e.invoice_id, None),
                RepaymentEvent::RepaymentOverdue(e) => (e.invoice_id, Some(e.days_overdue)),
                RepaymentEvent::RepaymentCompleted(_) | RepaymentEvent::RepaymentCancelled(_) => {
                    return Ok(Vec::new());
                }
            };
            let repayment = self.engine.repayment(tenant_id, repayment_id)?;
            let (Some(payer), Some(payee), Some(due)) =
                (repayment.payer(), repayment.payee(), repayment.due_date())
            else {
                return Ok(Vec::new());
            };
            let invoice = self.engine.invoice(tenant_id, invoice_id)?;
            let payee_name = self.name_of(tenant_id, payee)?;
            let message = match overdue_days {
                None => format!(
                    "Repayment of {} for invoice {} is due on {}",
                    repayment.amount(),
                    number_of(&invoice),
                    due.date_naive()
                ),
                Some(days) => format!(
                    "Repayment of {} for invoice {} is {} day(s) overdue",
                    repayment.amount(),
                    number_of(&invoice),
                    days
                ),
            };
            Ok(vec![self.notification(
                envelope,
                &invoice,
                payer,
                NotificationKind::RepaymentDue,
                payee_name,
                Some(repayment.amount()),
                message,
            )])
        } else {
            Ok(Vec::new())
        }
    }

    fn for_invoice_event(
        &self,
        envelope: &EventEnvelope<JsonValue>,
        event: &InvoiceEvent,
    ) -> Result<Vec<Notification>, RelayError> {
        let tenant_id = envelope.tenant_id();
        let relevant = matches!(
            event,
            InvoiceEvent::DiscountOffered(_)
                | InvoiceEvent::DiscountOfferAccepted(_)
                | InvoiceEvent::DiscountOfferRejected(_)
                | InvoiceEvent::BidSubmitted(_)
                | InvoiceEvent::OpenedForBidding(OpenedForBidding {
                    rejected_offer: Some(_),
                    ..
                })
                | InvoiceEvent::NegotiationClosed(NegotiationClosed {
                    rejected_offer: Some(_),
                    ..
                })
        );
        if !relevant {
            return Ok(Vec::new());
        }

        let invoice = self.engine.invoice(tenant_id, event.invoice_id())?;
        let (Some(seller), Some(buyer)) = (invoice.seller(), invoice.buyer()) else {
            return Ok(Vec::new());
        };
        let number = number_of(&invoice);

        let notification = match event {
            InvoiceEvent::DiscountOffered(e) => {
                let buyer_name = self.name_of(tenant_id, buyer)?;
                let seller_receives = invoice
                    .amount()
                    .and_then(|amount| settlement::two_party(amount, e.offer.discount).ok())
                    .map(|split| split.seller_receives);
                let message = format!(
                    "{} offered early payment on invoice {} at {}% discount, valid until {}",
                    buyer_name.as_deref().unwrap_or("The buyer"),
                    number,
                    e.offer.discount.as_percent(),
                    e.offer.expires_at.format("%Y-%m-%d %H:%M UTC")
                );
                self.notification(
                    envelope,
                    &invoice,
                    seller,
                    NotificationKind::DiscountOfferReceived,
                    buyer_name,
                    seller_receives,
                    message,
                )
            }
            InvoiceEvent::DiscountOfferAccepted(e) => {
                let seller_name = self.name_of(tenant_id, seller)?;
                let message = format!(
                    "{} accepted your discount offer on invoice {}; pay {} to settle",
                    seller_name.as_deref().unwrap_or("The seller"),
                    number,
                    e.seller_receives
                );
                self.notification(
                    envelope,
                    &invoice,
                    buyer,
                    NotificationKind::DiscountOfferAccepted,
                    seller_name,
                    Some(e.seller_receives),
                    message,
                )
            }
            InvoiceEvent::DiscountOfferRejected(e) => {
                self.offer_rejected(envelope, &invoice, seller, buyer, e.reason.as_deref())?
            }
            // Implicit rejections: the live offer closes with the seller's move.
            InvoiceEvent::OpenedForBidding(_) => self.offer_rejected(
                envelope,
                &invoice,
                seller,
                buyer,
                Some("the invoice was opened for bidding"),
            )?,
            InvoiceEvent::NegotiationClosed(_) => self.offer_rejected(
                envelope,
                &invoice,
                seller,
                buyer,
                Some("the seller chose standard payment"),
            )?,
            InvoiceEvent::BidSubmitted(e) => {
                let financier_name = self.name_of(tenant_id, e.bid.financier)?;
                let financier_pays = invoice
                    .amount()
                    .and_then(|amount| e.bid.split(amount).ok())
                    .map(|split| split.financier_pays);
                let message = format!(
                    "New bid on invoice {} at {}%",
                    number,
                    e.bid.headline_rate().as_percent()
                );
                self.notification(
                    envelope,
                    &invoice,
                    seller,
                    NotificationKind::BidReceived,
                    financier_name,
                    financier_pays,
                    message,
                )
            }
            _ => return Ok(Vec::new()),
        };
        Ok(vec![notification])
    }

    fn offer_rejected(
        &self,
        envelope: &EventEnvelope<JsonValue>,
        invoice: &Invoice,
        seller: PartyId,
        buyer: PartyId,
        reason: Option<&str>,
    ) -> Result<Notification, RelayError> {
        let seller_name = self.name_of(envelope.tenant_id(), seller)?;
        let number = number_of(invoice);
        let message = match reason {
            Some(reason) => {
                format!("Your discount offer on invoice {number} was rejected: {reason}")
            }
            None => format!("Your discount offer on invoice {number} was rejected"),
        };
        Ok(self.notification(
            envelope,
            invoice,
            buyer,
            NotificationKind::DiscountOfferRejected,
            seller_name,
            None,
            message,
        ))
    }

    fn name_of(&self, tenant_id: TenantId, party: PartyId) -> Result<Option<String>, RelayError> {
        Ok(self.engine.services().profiles.display_name(tenant_id, party)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn notification(
        &self,
        envelope: &EventEnvelope<JsonValue>,
        invoice: &Invoice,
        recipient: PartyId,
        kind: NotificationKind,
        counterparty_name: Option<String>,
        amount: Option<u64>,
        message: String,
    ) -> Notification {
        Notification {
            tenant_id: envelope.tenant_id(),
            source_event_id: envelope.event_id(),
            recipient,
            kind,
            invoice_id: invoice.id_typed(),
            invoice_number: invoice.fields().invoice_number.clone(),
            counterparty_name,
            amount,
            message,
        }
    }
}

fn number_of(invoice: &Invoice) -> String {
    invoice
        .fields()
        .invoice_number
        .clone()
        .unwrap_or_else(|| invoice.id_typed().to_string())
}

fn decode<E: serde::de::DeserializeOwned>(
    envelope: &EventEnvelope<JsonValue>,
) -> Result<E, RelayError> {
    serde_json::from_value(envelope.payload().clone()).map_err(|e| RelayError::Deserialize {
        event_type: envelope.event_type().to_string(),
        message: e.to_string(),
    })
}
