use serde::{Deserialize, Serialize};

/// Negotiation and default rules fixed per invoice when it is drafted.
///
/// The values are captured in the `InvoiceDrafted` event, so a configuration
/// change never rewrites the rules of a negotiation that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancingPolicy {
    /// Maximum number of discount offers (initial offer + revisions) per invoice.
    pub max_offer_revisions: u8,
    /// Days after the repayment due date before a default may be confirmed.
    pub default_grace_period_days: u32,
}

impl Default for FinancingPolicy {
    fn default() -> Self {
        Self {
            max_offer_revisions: 3,
            default_grace_period_days: 30,
        }
    }
}
