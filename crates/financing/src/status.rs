//! Invoice lifecycle state machine.
//!
//! ```text
//! DRAFT -> SUBMITTED -> ACCEPTED -> OPEN_FOR_BIDDING -> BID_ACCEPTED -> FINANCED -> REPAID
//!                          |                                              ^        \-> DEFAULTED
//!                          \------------- (discount accepted) ------------/
//! any non-terminal -> CANCELLED
//! ```

use serde::{Deserialize, Serialize};

use finflow_core::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Submitted,
    Accepted,
    OpenForBidding,
    BidAccepted,
    Financed,
    Repaid,
    Defaulted,
    Cancelled,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 9] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Submitted,
        InvoiceStatus::Accepted,
        InvoiceStatus::OpenForBidding,
        InvoiceStatus::BidAccepted,
        InvoiceStatus::Financed,
        InvoiceStatus::Repaid,
        InvoiceStatus::Defaulted,
        InvoiceStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Submitted => "SUBMITTED",
            InvoiceStatus::Accepted => "ACCEPTED",
            InvoiceStatus::OpenForBidding => "OPEN_FOR_BIDDING",
            InvoiceStatus::BidAccepted => "BID_ACCEPTED",
            InvoiceStatus::Financed => "FINANCED",
            InvoiceStatus::Repaid => "REPAID",
            InvoiceStatus::Defaulted => "DEFAULTED",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            InvoiceStatus::Repaid | InvoiceStatus::Defaulted | InvoiceStatus::Cancelled => true,
            InvoiceStatus::Draft
            | InvoiceStatus::Submitted
            | InvoiceStatus::Accepted
            | InvoiceStatus::OpenForBidding
            | InvoiceStatus::BidAccepted
            | InvoiceStatus::Financed => false,
        }
    }

    /// The transition table. Everything not listed is rejected.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        match self {
            Draft => matches!(next, Submitted | Cancelled),
            Submitted => matches!(next, Accepted | Cancelled),
            Accepted => matches!(next, OpenForBidding | Financed | Cancelled),
            OpenForBidding => matches!(next, BidAccepted | Cancelled),
            BidAccepted => matches!(next, Financed | Cancelled),
            Financed => matches!(next, Repaid | Defaulted | Cancelled),
            Repaid | Defaulted | Cancelled => false,
        }
    }

    pub fn ensure_transition(self, next: InvoiceStatus) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::transition("invoice", self, next))
        }
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the seller intends to be paid early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    /// Buyer pays early at a discount (two-party).
    SelfFundedDiscount,
    /// A financier pays early and the buyer repays the financier (three-party).
    FinancierBacked,
}

impl ProductType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProductType::SelfFundedDiscount => "SELF_FUNDED_DISCOUNT",
            ProductType::FinancierBacked => "FINANCIER_BACKED",
        }
    }
}
