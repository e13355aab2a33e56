use chrono::{DateTime, Utc};

/// A domain event: an immutable, versioned, append-only fact.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "financing.invoice.bid_accepted").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time, taken from the command).
    fn occurred_at(&self) -> DateTime<Utc>;
}
