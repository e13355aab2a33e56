//! Financing identifiers.
//!
//! Invoice, disbursement, repayment and contract ids name event streams
//! (`AggregateId`). Offer and bid ids name entities inside the invoice stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use finflow_core::AggregateId;

use crate::settlement::ContractType;

macro_rules! stream_id {
    ($t:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub AggregateId);

        impl $t {
            pub fn new(id: AggregateId) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                self.0.as_uuid()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

macro_rules! entity_id {
    ($t:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub Uuid);

        impl $t {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

stream_id!(InvoiceId);
stream_id!(DisbursementId);
stream_id!(RepaymentId);
stream_id!(ContractId);

entity_id!(OfferId);
entity_id!(BidId);

/// The accepted terms an invoice was settled on: one discount offer or one bid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TermsRef {
    Offer(OfferId),
    Bid(BidId),
}

impl TermsRef {
    pub fn as_uuid(&self) -> &Uuid {
        match self {
            TermsRef::Offer(id) => &id.0,
            TermsRef::Bid(id) => &id.0,
        }
    }

    /// Offers settle buyer-to-seller; bids bring in a financier.
    pub fn contract_type(&self) -> ContractType {
        match self {
            TermsRef::Offer(_) => ContractType::TwoParty,
            TermsRef::Bid(_) => ContractType::ThreeParty,
        }
    }
}

impl DisbursementId {
    /// One disbursement per (invoice, accepted terms).
    pub fn for_terms(invoice_id: InvoiceId, terms: TermsRef) -> Self {
        Self(AggregateId::derived(
            "financing.disbursement",
            &[invoice_id.as_uuid(), terms.as_uuid()],
        ))
    }
}

impl ContractId {
    /// One contract per (invoice, accepted terms).
    pub fn for_terms(invoice_id: InvoiceId, terms: TermsRef) -> Self {
        Self(AggregateId::derived(
            "financing.contract",
            &[invoice_id.as_uuid(), terms.as_uuid()],
        ))
    }
}

impl RepaymentId {
    /// One repayment obligation per completed disbursement.
    pub fn for_disbursement(disbursement_id: DisbursementId) -> Self {
        Self(AggregateId::derived(
            "financing.repayment",
            &[disbursement_id.as_uuid()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_ids_are_keyed_by_invoice_and_terms() {
        let invoice = InvoiceId::new(AggregateId::new());
        let bid = TermsRef::Bid(BidId::new());
        let offer = TermsRef::Offer(OfferId::new());

        assert_eq!(
            DisbursementId::for_terms(invoice, bid),
            DisbursementId::for_terms(invoice, bid)
        );
        assert_ne!(
            DisbursementId::for_terms(invoice, bid),
            DisbursementId::for_terms(invoice, offer)
        );
        assert_ne!(
            DisbursementId::for_terms(invoice, bid).0,
            ContractId::for_terms(invoice, bid).0
        );
    }

    #[test]
    fn terms_ref_serializes_with_kind_tag() {
        let id = BidId::new();
        let json = serde_json::to_value(TermsRef::Bid(id)).unwrap();
        assert_eq!(json["kind"], "bid");
        assert_eq!(json["id"], serde_json::json!(id.0));
    }
}
