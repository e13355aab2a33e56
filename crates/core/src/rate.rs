//! Percentages stored as integer basis points.
//!
//! All money math in the engine runs on integer minor units; percentages are
//! basis points (1.6% == 160 bps) so `amount * (10_000 - bps) / 10_000` is exact
//! wherever the inputs allow it.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Basis points in 100%.
pub const BPS_PER_UNIT: u32 = 10_000;

/// A percentage with two decimal places of precision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(u32);

impl ValueObject for Rate {}

impl Rate {
    pub const ZERO: Rate = Rate(0);
    pub const FULL: Rate = Rate(BPS_PER_UNIT);

    pub const fn from_bps(bps: u32) -> Self {
        Self(bps)
    }

    /// Parse a percentage such as `1.6` or `0.25`.
    ///
    /// Rejects non-finite values, negatives, values above 100 and anything
    /// with more than two decimal places.
    pub fn from_percent(percent: f64) -> DomainResult<Self> {
        if !percent.is_finite() {
            return Err(DomainError::validation("percentage must be a finite number"));
        }
        if percent < 0.0 {
            return Err(DomainError::validation("percentage must not be negative"));
        }
        if percent > 100.0 {
            return Err(DomainError::validation("percentage must not exceed 100"));
        }
        let scaled = percent * 100.0;
        let rounded = scaled.round();
        if (scaled - rounded).abs() > 1e-6 {
            return Err(DomainError::validation(
                "percentage supports at most two decimal places",
            ));
        }
        Ok(Self(rounded as u32))
    }

    pub fn bps(self) -> u32 {
        self.0
    }

    /// Percentage as a float, for display and yield figures only.
    pub fn as_percent(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Rate) -> Option<Rate> {
        self.0.checked_add(other.0).map(Rate)
    }

    /// `amount * (1 - rate)`, rounded down to the minor unit.
    ///
    /// Returns `None` when the rate is above 100%.
    pub fn remainder_of(self, amount: u64) -> Option<u64> {
        let keep = BPS_PER_UNIT.checked_sub(self.0)?;
        let scaled = u128::from(amount) * u128::from(keep) / u128::from(BPS_PER_UNIT);
        u64::try_from(scaled).ok()
    }
}

impl core::fmt::Display for Rate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
