//! Read-only event history queries (audit trail, debugging).
//!
//! All queries are tenant-scoped and paginated.

use chrono::{DateTime, Utc};
use finflow_core::{AggregateId, TenantId};
use serde::{Deserialize, Serialize};

use crate::event_store::{EventStoreError, StoredEvent};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 1000;

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based.
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria; `None` fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    /// e.g. "financing.disbursement".
    pub aggregate_type: Option<String>,
    /// e.g. "financing.invoice.bid_accepted".
    pub event_type: Option<String>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_aggregate(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id: Some(aggregate_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.aggregate_id.is_none_or(|id| event.aggregate_id == id)
            && self
                .aggregate_type
                .as_deref()
                .is_none_or(|t| event.aggregate_type == t)
            && self.event_type.as_deref().is_none_or(|t| event.event_type == t)
            && self.occurred_after.is_none_or(|t| event.occurred_at > t)
            && self.occurred_before.is_none_or(|t| event.occurred_at < t)
    }
}

/// One page of matching events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueryResult {
    pub events: Vec<StoredEvent>,
    /// Matches across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl EventQueryResult {
    /// Slice an already filtered and ordered match list.
    pub fn page(matching: Vec<StoredEvent>, pagination: Pagination) -> Self {
        let total = matching.len() as u64;
        let start = (pagination.offset as usize).min(matching.len());
        let events: Vec<StoredEvent> = matching
            .into_iter()
            .skip(start)
            .take(pagination.limit as usize)
            .collect();
        let has_more = (start + events.len()) < total as usize;
        Self {
            events,
            total,
            pagination,
            has_more,
        }
    }
}

/// Query interface for event inspection, ordered oldest first.
pub trait EventQuery: Send + Sync {
    fn query_events(
        &self,
        tenant_id: TenantId,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    /// Every event of one stream, oldest first.
    fn aggregate_history(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        pagination: Option<Pagination>,
    ) -> Result<EventQueryResult, EventStoreError> {
        self.query_events(
            tenant_id,
            &EventFilter::for_aggregate(aggregate_id),
            pagination.unwrap_or_default(),
        )
    }
}

impl<Q> EventQuery for std::sync::Arc<Q>
where
    Q: EventQuery + ?Sized,
{
    fn query_events(
        &self,
        tenant_id: TenantId,
        filter: &EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        (**self).query_events(tenant_id, filter, pagination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn stream(n: u64) -> Vec<StoredEvent> {
        let tenant_id = TenantId::new();
        let aggregate_id = AggregateId::new();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap();
        (1..=n)
            .map(|seq| StoredEvent {
                event_id: Uuid::now_v7(),
                tenant_id,
                aggregate_id,
                aggregate_type: "financing.invoice".to_string(),
                sequence_number: seq,
                event_type: if seq % 2 == 0 {
                    "financing.invoice.bid_submitted".to_string()
                } else {
                    "financing.invoice.offer_created".to_string()
                },
                event_version: 1,
                occurred_at: t0 + chrono::Duration::minutes(seq as i64),
                payload: serde_json::Value::Null,
            })
            .collect()
    }

    #[test]
    fn limit_is_capped() {
        assert_eq!(Pagination::new(Some(5_000), None).limit, MAX_LIMIT);
        assert_eq!(Pagination::new(None, None), Pagination::default());
    }

    #[test]
    fn filter_combines_type_and_time_window() {
        let events = stream(6);
        let filter = EventFilter {
            event_type: Some("financing.invoice.bid_submitted".to_string()),
            occurred_after: Some(events[1].occurred_at),
            ..EventFilter::for_aggregate(events[0].aggregate_id)
        };
        let seqs: Vec<u64> = events
            .iter()
            .filter(|e| filter.matches(e))
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![4, 6]);
    }

    #[test]
    fn offset_past_the_end_is_an_empty_last_page() {
        let page = EventQueryResult::page(stream(3), Pagination::new(Some(10), Some(7)));
        assert!(page.events.is_empty());
        assert_eq!(page.total, 3);
        assert!(!page.has_more);
    }

    proptest! {
        #[test]
        fn walking_pages_visits_every_event_once(n in 0u64..80, limit in 1u32..25) {
            let events = stream(n);
            let mut seen = Vec::new();
            let mut offset = 0u32;
            loop {
                let page = EventQueryResult::page(events.clone(), Pagination::new(Some(limit), Some(offset)));
                prop_assert_eq!(page.total, n);
                seen.extend(page.events.iter().map(|e| e.sequence_number));
                if !page.has_more {
                    break;
                }
                offset += limit;
            }
            prop_assert_eq!(seen, (1..=n).collect::<Vec<_>>());
        }
    }
}
