//! Parked deliveries for the notification relay.
//!
//! A delivery that fails is kept with its attempt count and retried with
//! backoff until it succeeds or the policy gives up, at which point it moves
//! to the dead letters.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::warn;

use finflow_events::EventEnvelope;

use crate::external::Notification;

/// Backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Wait after the given failed attempt (1-indexed): base * 2^(attempt-1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// What still has to happen for a delivery to complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Notifications could not be derived from the envelope yet.
    Envelope(EventEnvelope<JsonValue>),
    /// Derived, but the sink refused it.
    Notification(Notification),
}

impl Delivery {
    fn describe(&self) -> String {
        match self {
            Delivery::Envelope(env) => format!("{} {}", env.event_type(), env.event_id()),
            Delivery::Notification(n) => {
                format!("{} to {} for {}", n.kind.as_str(), n.recipient, n.source_event_id)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Parked {
    delivery: Delivery,
    attempts: u32,
    next_attempt_at: Instant,
    last_error: String,
}

/// A delivery the policy gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

impl RedeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.rescheduled == 0 && self.dead_lettered == 0
    }
}

#[derive(Debug, Default)]
struct Queues {
    pending: Vec<Parked>,
    dead: Vec<DeadLetter>,
}

/// Failed deliveries waiting for their next attempt.
#[derive(Debug, Default)]
pub struct DeliveryOutbox {
    policy: RetryPolicy,
    queues: Mutex<Queues>,
}

impl DeliveryOutbox {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            queues: Mutex::new(Queues::default()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record a failed attempt. `attempts` counts the one that just failed.
    pub fn park(&self, delivery: Delivery, attempts: u32, error: String, now: Instant) -> bool {
        let mut queues = self.lock();
        if self.policy.should_retry(attempts) {
            queues.pending.push(Parked {
                next_attempt_at: now + self.policy.delay_for_attempt(attempts),
                delivery,
                attempts,
                last_error: error,
            });
            true
        } else {
            warn!(
                delivery = %delivery.describe(),
                attempts,
                error = %error,
                "notification dead-lettered"
            );
            queues.dead.push(DeadLetter {
                delivery,
                attempts,
                error,
            });
            false
        }
    }

    /// Remove and return every delivery whose next attempt is due, with the
    /// attempts made so far.
    pub fn take_due(&self, now: Instant) -> Vec<(Delivery, u32)> {
        let mut queues = self.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut queues.pending)
            .into_iter()
            .partition(|p| p.next_attempt_at <= now);
        queues.pending = waiting;
        due.into_iter().map(|p| (p.delivery, p.attempts)).collect()
    }

    /// Dead-letter a delivery that can never succeed, whatever the policy.
    pub fn reject(&self, delivery: Delivery, attempts: u32, error: String) {
        warn!(delivery = %delivery.describe(), attempts, error = %error, "notification dropped");
        self.lock().dead.push(DeadLetter {
            delivery,
            attempts,
            error,
        });
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Last error of each waiting delivery.
    pub fn pending_errors(&self) -> Vec<String> {
        self.lock()
            .pending
            .iter()
            .map(|p| p.last_error.clone())
            .collect()
    }

    pub fn dead_lettered(&self) -> usize {
        self.lock().dead.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        // Every mutation is a push or a whole-vector swap, so a poisoned lock
        // still guards consistent queues.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use finflow_core::{AggregateId, PartyId, TenantId};
    use finflow_financing::InvoiceId;

    use super::*;
    use crate::external::NotificationKind;

    fn notification() -> Notification {
        Notification {
            tenant_id: TenantId::new(),
            source_event_id: Uuid::now_v7(),
            recipient: PartyId::new(),
            kind: NotificationKind::BidReceived,
            invoice_id: InvoiceId::new(AggregateId::new()),
            invoice_number: None,
            counterparty_name: None,
            amount: None,
            message: "bid".to_string(),
        }
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1));
    }

    #[test]
    fn parked_delivery_waits_for_its_backoff() {
        let outbox = DeliveryOutbox::new(RetryPolicy::exponential(
            3,
            Duration::from_secs(2),
            Duration::from_secs(30),
        ));
        let now = Instant::now();
        assert!(outbox.park(
            Delivery::Notification(notification()),
            1,
            "smtp down".to_string(),
            now
        ));

        assert!(outbox.take_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(outbox.pending_errors(), vec!["smtp down".to_string()]);

        let due = outbox.take_due(now + Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, 1);
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn last_allowed_failure_goes_to_the_dead_letters() {
        let outbox = DeliveryOutbox::new(RetryPolicy::exponential(
            2,
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));
        let now = Instant::now();
        let n = notification();

        assert!(outbox.park(Delivery::Notification(n.clone()), 1, "first".into(), now));
        let (delivery, attempts) = outbox.take_due(now + Duration::from_secs(1)).remove(0);
        assert!(!outbox.park(delivery, attempts + 1, "second".into(), now));

        assert_eq!(outbox.pending(), 0);
        assert_eq!(
            outbox.dead_letters(),
            vec![DeadLetter {
                delivery: Delivery::Notification(n),
                attempts: 2,
                error: "second".to_string(),
            }]
        );
    }
}
