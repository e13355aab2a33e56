use std::io;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use finflow_events::{EventBus, EventEnvelope};
use finflow_financing::InvoiceId;

use super::WorkerHandle;
use crate::engine::FinancingEngine;
use crate::event_store::EventStore;
use crate::projections::{InvoiceBoardProjection, InvoiceBoardRow};
use crate::read_model::TenantStore;

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Invoices whose stale offers or bids were expired.
    pub expired: usize,
    /// Repayments marked overdue.
    pub overdue: usize,
    /// Invoices whose settlement needed a follow-up step.
    pub resumed: usize,
    /// Invoices overdue past grace, awaiting the financier's confirmation.
    pub default_candidates: usize,
    pub failures: usize,
}

/// Timer-driven maintenance over the invoice board.
///
/// Deadlines are enforced at command time; the sweeper only persists what
/// already lapsed so readers see it, and finishes settlement follow-ups a
/// crash interrupted. Everything it calls is idempotent.
pub struct ExpirySweeper<S, B, R> {
    engine: Arc<FinancingEngine<S, B>>,
    board: Arc<InvoiceBoardProjection<R>>,
}

impl<S, B, R> ExpirySweeper<S, B, R>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
    R: TenantStore<InvoiceId, InvoiceBoardRow> + Send + Sync + 'static,
{
    pub fn new(
        engine: Arc<FinancingEngine<S, B>>,
        board: Arc<InvoiceBoardProjection<R>>,
    ) -> Self {
        Self { engine, board }
    }

    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.engine.now();

        for tenant_id in self.board.tenants() {
            for invoice_id in self.board.with_stale_entries(tenant_id, now) {
                match self.engine.expire_stale(tenant_id, invoice_id) {
                    Ok(_) => report.expired += 1,
                    Err(err) => {
                        report.failures += 1;
                        warn!(%tenant_id, %invoice_id, error = %err, "expiry failed");
                    }
                }
            }

            for repayment_id in self.board.past_due_repayments(tenant_id, now) {
                match self.engine.mark_overdue(tenant_id, repayment_id) {
                    Ok(_) => report.overdue += 1,
                    Err(err) => {
                        report.failures += 1;
                        warn!(%tenant_id, %repayment_id, error = %err, "overdue mark failed");
                    }
                }
            }

            for invoice_id in self.board.lagging_settlements(tenant_id) {
                match self.engine.resume_settlement(tenant_id, invoice_id) {
                    Ok(outcome) if !outcome.is_empty() => report.resumed += 1,
                    Ok(_) => {}
                    Err(err) => {
                        report.failures += 1;
                        warn!(%tenant_id, %invoice_id, error = %err, "settlement resume failed");
                    }
                }
            }

            report.default_candidates += self.board.default_candidates(tenant_id, now).len();
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                overdue = report.overdue,
                resumed = report.resumed,
                default_candidates = report.default_candidates,
                failures = report.failures,
                "sweep finished"
            );
        }
        report
    }

    /// Sweep every `interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> io::Result<WorkerHandle> {
        WorkerHandle::start("expiry-sweeper", move |shutdown| {
            loop {
                match shutdown.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        self.sweep_once();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }
}
