//! Settlement arithmetic.
//!
//! Every figure is an integer number of minor currency units. Percentages are
//! applied with `Rate::remainder_of`, which floors toward the party paying out
//! early, so a seller is never credited a fraction that was never disbursed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finflow_core::{DomainError, DomainResult, PartyId, Rate, ValueObject};

/// Settlement topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractType {
    /// Buyer pays the seller early at a discount.
    TwoParty,
    /// Financier pays the seller early; buyer repays the financier at maturity.
    ThreeParty,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractType::TwoParty => "TWO_PARTY",
            ContractType::ThreeParty => "THREE_PARTY",
        }
    }

    pub fn funding_type(self) -> FundingType {
        match self {
            ContractType::TwoParty => FundingType::SelfFunded,
            ContractType::ThreeParty => FundingType::FinancierFunded,
        }
    }
}

impl core::fmt::Display for ContractType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who puts up the early payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundingType {
    SelfFunded,
    FinancierFunded,
}

/// Money flows once terms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    pub contract_type: ContractType,
    pub invoice_amount: u64,
    /// Offer discount, or the bid's headline rate.
    pub discount: Rate,
    /// What the seller receives up front.
    pub seller_receives: u64,
    /// Three-party only: what the financier disburses to the seller.
    pub financier_pays: Option<u64>,
    /// What the buyer ultimately pays.
    pub buyer_repays: u64,
    pub repayment_due_date: DateTime<Utc>,
    pub seller: PartyId,
    pub buyer: PartyId,
    pub financier: Option<PartyId>,
    pub financier_rate: Option<Rate>,
    pub processing_fee: Option<Rate>,
    pub haircut: Option<Rate>,
}

impl ValueObject for SettlementPlan {}

impl SettlementPlan {
    /// The party disbursing the early payment.
    pub fn disbursement_payer(&self) -> PartyId {
        self.financier.unwrap_or(self.buyer)
    }

    /// Amount moved by the disbursement.
    pub fn disbursement_amount(&self) -> u64 {
        self.financier_pays.unwrap_or(self.seller_receives)
    }
}

/// Two-party figures: the seller takes the discount hit, the buyer pays early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoPartySplit {
    pub seller_receives: u64,
    pub discount_amount: u64,
}

/// Three-party figures: the financier earns the gap at maturity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreePartySplit {
    pub financier_pays: u64,
    pub financier_margin: u64,
    pub buyer_repays: u64,
}

fn ensure_amount(amount: u64) -> DomainResult<()> {
    if amount == 0 {
        return Err(DomainError::validation("invoice amount must be positive"));
    }
    Ok(())
}

/// `seller_receives = amount * (1 - discount)`.
pub fn two_party(amount: u64, discount: Rate) -> DomainResult<TwoPartySplit> {
    ensure_amount(amount)?;
    if discount.is_zero() || discount >= Rate::FULL {
        return Err(DomainError::validation(
            "discount must be greater than 0% and below 100%",
        ));
    }
    let seller_receives = discount
        .remainder_of(amount)
        .ok_or_else(|| DomainError::invariant("discount exceeds invoice amount"))?;
    Ok(TwoPartySplit {
        seller_receives,
        discount_amount: amount - seller_receives,
    })
}

/// `financier_pays = amount * (1 - haircut)` for GST-backed bids, otherwise
/// `amount * (1 - (discount_rate + processing_fee))`. The buyer repays the full
/// face value.
pub fn three_party(
    amount: u64,
    discount_rate: Rate,
    processing_fee: Rate,
    haircut: Option<Rate>,
) -> DomainResult<ThreePartySplit> {
    ensure_amount(amount)?;
    let deduction = match haircut {
        Some(h) => {
            if h.is_zero() || h >= Rate::FULL {
                return Err(DomainError::validation(
                    "haircut must be greater than 0% and below 100%",
                ));
            }
            h
        }
        None => {
            let total = discount_rate
                .checked_add(processing_fee)
                .filter(|t| *t < Rate::FULL)
                .ok_or_else(|| {
                    DomainError::validation(
                        "discount rate plus processing fee must stay below 100%",
                    )
                })?;
            if total.is_zero() {
                return Err(DomainError::validation(
                    "bid must carry a discount rate or processing fee",
                ));
            }
            total
        }
    };
    let financier_pays = deduction
        .remainder_of(amount)
        .ok_or_else(|| DomainError::invariant("bid deduction exceeds invoice amount"))?;
    Ok(ThreePartySplit {
        financier_pays,
        financier_margin: amount - financier_pays,
        buyer_repays: amount,
    })
}

/// Whole days from `from` to `due`, negative if `due` already passed.
pub fn tenure_days(from: DateTime<Utc>, due: DateTime<Utc>) -> i64 {
    due.signed_duration_since(from).num_days()
}

/// Simple annualized yield in percent: `(rate / tenure_days) * 365`.
///
/// Display only; never feeds back into settlement amounts. `None` when the
/// tenure is not positive.
pub fn annualized_yield(rate: Rate, tenure_days: i64) -> Option<f64> {
    if tenure_days <= 0 {
        return None;
    }
    Some(rate.as_percent() / tenure_days as f64 * 365.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn two_party_discount_of_two_percent() {
        let split = two_party(1_000_000, Rate::from_bps(200)).unwrap();
        assert_eq!(split.seller_receives, 980_000);
        assert_eq!(split.discount_amount, 20_000);
    }

    #[test]
    fn three_party_rate_plus_fee() {
        let split = three_party(1_000_000, Rate::from_bps(160), Rate::from_bps(25), None).unwrap();
        assert_eq!(split.financier_pays, 981_500);
        assert_eq!(split.financier_margin, 18_500);
        assert_eq!(split.buyer_repays, 1_000_000);
    }

    #[test]
    fn haircut_replaces_rate_and_fee() {
        let split = three_party(
            1_000_000,
            Rate::from_bps(160),
            Rate::from_bps(25),
            Some(Rate::from_bps(300)),
        )
        .unwrap();
        assert_eq!(split.financier_pays, 970_000);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(two_party(0, Rate::from_bps(200)).is_err());
        assert!(two_party(1_000, Rate::ZERO).is_err());
        assert!(two_party(1_000, Rate::FULL).is_err());
        assert!(three_party(1_000, Rate::from_bps(9_990), Rate::from_bps(10), None).is_err());
        assert!(three_party(1_000, Rate::ZERO, Rate::ZERO, None).is_err());
        assert!(three_party(1_000, Rate::ZERO, Rate::ZERO, Some(Rate::FULL)).is_err());
    }

    #[test]
    fn yield_is_annualized_over_tenure() {
        let y = annualized_yield(Rate::from_bps(160), 30).unwrap();
        assert!((y - 19.4666).abs() < 0.001);
        assert_eq!(annualized_yield(Rate::from_bps(160), 0), None);
        assert_eq!(annualized_yield(Rate::from_bps(160), -3), None);
    }

    proptest! {
        #[test]
        fn two_party_never_overpays(amount in 1u64..=1_000_000_000_000, bps in 1u32..10_000) {
            let split = two_party(amount, Rate::from_bps(bps)).unwrap();
            prop_assert!(split.seller_receives <= amount);
            prop_assert_eq!(split.seller_receives + split.discount_amount, amount);
        }

        #[test]
        fn three_party_financier_pays_at_most_face_value(
            amount in 1u64..=1_000_000_000_000,
            rate in 0u32..5_000,
            fee in 1u32..5_000,
        ) {
            let split = three_party(amount, Rate::from_bps(rate), Rate::from_bps(fee), None).unwrap();
            prop_assert!(split.financier_pays <= amount);
            prop_assert_eq!(split.buyer_repays, amount);
            prop_assert_eq!(split.financier_pays + split.financier_margin, amount);
        }

        #[test]
        fn higher_rate_never_pays_more(amount in 1u64..=1_000_000_000, a in 1u32..9_999, b in 1u32..9_999) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let at_lo = two_party(amount, Rate::from_bps(lo)).unwrap().seller_receives;
            let at_hi = two_party(amount, Rate::from_bps(hi)).unwrap().seller_receives;
            prop_assert!(at_hi <= at_lo);
        }
    }
}
