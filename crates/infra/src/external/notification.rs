use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use finflow_core::{PartyId, TenantId};
use finflow_financing::InvoiceId;

use super::ExternalError;

/// Notifications the marketplace sends to participants.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    DiscountOfferReceived,
    DiscountOfferAccepted,
    DiscountOfferRejected,
    BidReceived,
    PaymentDisbursed,
    RepaymentDue,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::DiscountOfferReceived => "discountOfferReceived",
            NotificationKind::DiscountOfferAccepted => "discountOfferAccepted",
            NotificationKind::DiscountOfferRejected => "discountOfferRejected",
            NotificationKind::BidReceived => "bidReceived",
            NotificationKind::PaymentDisbursed => "paymentDisbursed",
            NotificationKind::RepaymentDue => "repaymentDue",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tenant_id: TenantId,
    /// Committed event that caused this notification; with `recipient` and
    /// `kind` it identifies a delivery, so redelivery can be detected.
    pub source_event_id: Uuid,
    pub recipient: PartyId,
    pub kind: NotificationKind,
    pub invoice_id: InvoiceId,
    pub invoice_number: Option<String>,
    pub counterparty_name: Option<String>,
    pub amount: Option<u64>,
    pub message: String,
}

impl Notification {
    pub fn delivery_key(&self) -> (Uuid, PartyId, NotificationKind) {
        (self.source_event_id, self.recipient, self.kind)
    }
}

/// Outbound notification channel (email delivery lives behind it).
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), ExternalError>;
}

impl<N: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<N> {
    fn send(&self, notification: &Notification) -> Result<(), ExternalError> {
        (**self).send(notification)
    }
}

/// Records delivered notifications; redeliveries of the same key are dropped.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, recipient: PartyId) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.recipient == recipient)
            .collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn send(&self, notification: &Notification) -> Result<(), ExternalError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ExternalError::unavailable("notifications", "sink lock poisoned"))?;
        let key = notification.delivery_key();
        if !sent.iter().any(|n| n.delivery_key() == key) {
            sent.push(notification.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [NotificationKind; 6] = [
        NotificationKind::DiscountOfferReceived,
        NotificationKind::DiscountOfferAccepted,
        NotificationKind::DiscountOfferRejected,
        NotificationKind::BidReceived,
        NotificationKind::PaymentDisbursed,
        NotificationKind::RepaymentDue,
    ];

    #[test]
    fn event_names_on_the_wire_are_camel_case() {
        let names: Vec<_> = ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "discountOfferReceived",
                "discountOfferAccepted",
                "discountOfferRejected",
                "bidReceived",
                "paymentDisbursed",
                "repaymentDue",
            ]
        );
        for kind in ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_string()));
            let back: NotificationKind = serde_json::from_value(json).unwrap();
            assert_eq!(back, kind);
        }
        assert!(serde_json::from_str::<NotificationKind>("\"bid_received\"").is_err());
    }

    #[test]
    fn sink_drops_a_redelivered_notification() {
        let sink = InMemoryNotificationSink::new();
        let n = Notification {
            tenant_id: TenantId::new(),
            source_event_id: Uuid::now_v7(),
            recipient: PartyId::new(),
            kind: NotificationKind::BidReceived,
            invoice_id: InvoiceId::new(finflow_core::AggregateId::new()),
            invoice_number: Some("INV-9".to_string()),
            counterparty_name: None,
            amount: Some(981_500),
            message: "New bid".to_string(),
        };
        sink.send(&n).unwrap();
        sink.send(&n).unwrap();
        assert_eq!(sink.sent().len(), 1);
    }
}
