//! Background workers fed by the event bus or a timer.
//!
//! - [`BusWorker`]: generic subscription loop with tenant filtering
//! - [`NotificationRelay`]: turns committed events into party notifications,
//!   parking failed deliveries in a [`DeliveryOutbox`] for retry
//! - [`ExpirySweeper`]: persists expiry, overdue marks and settlement resumes

pub mod expiry_sweeper;
pub mod notification_relay;
pub mod outbox;

pub use expiry_sweeper::{ExpirySweeper, SweepReport};
pub use notification_relay::NotificationRelay;
pub use outbox::{DeadLetter, Delivery, DeliveryOutbox, RedeliveryReport, RetryPolicy};

use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::warn;

use finflow_core::TenantId;
use finflow_events::{EventBus, EventEnvelope, Subscription};
use finflow_financing::InvoiceId;

use crate::event_store::EventStore;
use crate::projections::{InvoiceBoardProjection, InvoiceBoardRow};
use crate::read_model::TenantStore;

/// Handle to stop and join a background worker. Dropping it stops the
/// worker too, without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    fn start(
        name: &'static str,
        body: impl FnOnce(mpsc::Receiver<()>) + Send + 'static,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shutdown_rx))?;
        Ok(Self {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = self.name, "worker thread panicked");
            }
        }
    }
}

/// Subscription loop over committed envelopes.
///
/// The handler must be idempotent: the bus delivers at least once.
#[derive(Debug)]
pub struct BusWorker;

impl BusWorker {
    /// Subscribe now and process on a named thread.
    ///
    /// With `tenant_id` set, envelopes of other tenants are skipped.
    pub fn spawn<B, H, E>(
        name: &'static str,
        bus: &B,
        tenant_id: Option<TenantId>,
        handler: H,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
        H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        Self::spawn_with_tick(name, bus, tenant_id, handler, || {})
    }

    /// Like [`BusWorker::spawn`], also running `tick` after every received
    /// envelope and every idle poll.
    pub fn spawn_with_tick<B, H, E, T>(
        name: &'static str,
        bus: &B,
        tenant_id: Option<TenantId>,
        mut handler: H,
        mut tick: T,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
        H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
        T: FnMut() + Send + 'static,
    {
        let sub = bus.subscribe();
        WorkerHandle::start(name, move |shutdown| {
            worker_loop(name, sub, shutdown, tenant_id, &mut handler, &mut tick)
        })
    }
}

/// Keep `board` current from `bus`, filling sequence gaps from `store`.
pub fn spawn_board_worker<St, B, R>(
    board: std::sync::Arc<InvoiceBoardProjection<R>>,
    store: St,
    bus: &B,
) -> io::Result<WorkerHandle>
where
    St: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>>,
    R: TenantStore<InvoiceId, InvoiceBoardRow> + Send + Sync + 'static,
{
    BusWorker::spawn("invoice-board", bus, None, move |envelope| {
        board.handle(&store, &envelope).map(|_| ())
    })
}

fn worker_loop<H, E, T>(
    name: &'static str,
    sub: Subscription<EventEnvelope<JsonValue>>,
    shutdown: mpsc::Receiver<()>,
    tenant_id: Option<TenantId>,
    handler: &mut H,
    tick: &mut T,
) where
    H: FnMut(EventEnvelope<JsonValue>) -> Result<(), E>,
    E: core::fmt::Display,
    T: FnMut(),
{
    let poll = Duration::from_millis(250);

    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match sub.recv_timeout(poll) {
            Ok(envelope) => {
                if tenant_id.is_none_or(|t| envelope.tenant_id() == t) {
                    let event_type = envelope.event_type().to_string();
                    if let Err(err) = handler(envelope) {
                        warn!(worker = name, %event_type, error = %err, "worker handler failed");
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        tick();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use chrono::Utc;
    use uuid::Uuid;

    use finflow_core::AggregateId;
    use finflow_events::InMemoryEventBus;

    use super::*;

    fn envelope(tenant_id: TenantId) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            AggregateId::new(),
            "financing.invoice",
            1,
            "financing.invoice.drafted",
            Utc::now(),
            JsonValue::Null,
        )
    }

    #[test]
    fn worker_skips_other_tenants_and_stops_on_shutdown() {
        let bus = InMemoryEventBus::new();
        let tenant = TenantId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = BusWorker::spawn("test-worker", &bus, Some(tenant), move |env| {
            sink.lock().unwrap().push(env.tenant_id());
            Ok::<_, String>(())
        })
        .unwrap();

        bus.publish(envelope(TenantId::new())).unwrap();
        bus.publish(envelope(tenant)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![tenant]);
    }
}
