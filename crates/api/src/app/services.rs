use std::{
    convert::Infallible,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{info, warn};

use finflow_core::TenantId;
use finflow_events::{EventEnvelope, InMemoryEventBus};
use finflow_infra::{
    command_dispatcher::CommandDispatcher,
    config::EngineConfig,
    engine::{EngineServices, FinancingEngine},
    event_store::{EventLog, EventStoreError, InMemoryEventStore, PostgresEventStore},
    external::{
        InMemoryAuditLog, InMemoryKycService, InMemoryNotificationSink, InMemoryProfileService,
    },
    projections::InvoiceBoardProjection,
    workers::{BusWorker, ExpirySweeper, NotificationRelay, WorkerHandle, spawn_board_worker},
};

pub type Store = Arc<dyn EventLog>;
pub type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type Engine = FinancingEngine<Store, Bus>;

const REALTIME_CAPACITY: usize = 1024;

/// A committed event as pushed to `/stream` subscribers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RealtimeMessage {
    pub tenant_id: TenantId,
    pub topic: String,
    pub payload: JsonValue,
}

impl RealtimeMessage {
    fn from_envelope(envelope: &EventEnvelope<JsonValue>) -> Self {
        Self {
            tenant_id: envelope.tenant_id(),
            topic: envelope.event_type().to_string(),
            payload: serde_json::json!({
                "event_id": envelope.event_id(),
                "aggregate_type": envelope.aggregate_type(),
                "aggregate_id": envelope.aggregate_id(),
                "sequence_number": envelope.sequence_number(),
                "occurred_at": envelope.occurred_at(),
                "data": envelope.payload(),
            }),
        }
    }
}

/// Everything the handlers need. Events live in Postgres when a database
/// URL is configured, in memory otherwise; the collaborators are in memory.
///
/// The collaborator adapters are exposed so a host process (or a test) can
/// seed KYC decisions and bank accounts; the API itself does not manage them.
pub struct AppServices {
    pub engine: Arc<Engine>,
    pub store: Store,
    pub bus: Bus,
    pub board: Arc<InvoiceBoardProjection>,
    pub kyc: Arc<InMemoryKycService>,
    pub profiles: Arc<InMemoryProfileService>,
    pub audit: Arc<InMemoryAuditLog>,
    pub notifications: Arc<InMemoryNotificationSink>,
    pub config: EngineConfig,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_store(Arc::new(InMemoryEventStore::new()), config)
    }

    /// Pick the event store backend from `config.database_url`.
    pub fn from_config(config: EngineConfig) -> Result<Self, EventStoreError> {
        let Some(url) = config.database_url.as_deref() else {
            info!("no database configured; events are kept in memory");
            return Ok(Self::in_memory(config));
        };
        let store = PostgresEventStore::connect(url, config.database_max_connections)?;
        store.migrate()?;
        info!(
            max_connections = config.database_max_connections,
            "events are persisted in postgres"
        );
        Ok(Self::with_store(Arc::new(store), config))
    }

    fn with_store(store: Store, config: EngineConfig) -> Self {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let kyc = Arc::new(InMemoryKycService::new());
        let profiles = Arc::new(InMemoryProfileService::new());
        let audit = Arc::new(InMemoryAuditLog::new());

        let engine = FinancingEngine::new(
            CommandDispatcher::new(store.clone(), bus.clone()),
            EngineServices {
                kyc: kyc.clone(),
                profiles: profiles.clone(),
                audit: audit.clone(),
            },
            config.clone(),
        );
        let (realtime_tx, _rx) = broadcast::channel(REALTIME_CAPACITY);

        Self {
            engine: Arc::new(engine),
            store,
            bus,
            board: Arc::new(InvoiceBoardProjection::in_memory()),
            kyc,
            profiles,
            audit,
            notifications: Arc::new(InMemoryNotificationSink::new()),
            config,
            realtime_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start the board projection, the notification relay, the realtime
    /// bridge and the expiry sweeper. They run until [`Self::shutdown`].
    pub fn start_workers(&self) -> io::Result<()> {
        let mut started = Vec::with_capacity(4);

        started.push(spawn_board_worker(
            self.board.clone(),
            self.store.clone(),
            &self.bus,
        )?);

        let relay = Arc::new(
            NotificationRelay::new(self.engine.clone(), self.notifications.clone())
                .with_retry(self.config.notification_retry()),
        );
        started.push(relay.spawn(&self.bus)?);

        let tx = self.realtime_tx.clone();
        started.push(BusWorker::spawn("realtime-bridge", &self.bus, None, move |envelope| {
            // No subscribers is fine; the message is simply dropped.
            let _ = tx.send(RealtimeMessage::from_envelope(&envelope));
            Ok::<_, Infallible>(())
        })?);

        let sweeper = Arc::new(ExpirySweeper::new(self.engine.clone(), self.board.clone()));
        started.push(sweeper.spawn(self.config.sweep_interval)?);

        info!(workers = started.len(), "background workers started");
        match self.workers.lock() {
            Ok(mut workers) => workers.extend(started),
            Err(_) => warn!("worker registry poisoned; workers stop when dropped"),
        }
        Ok(())
    }

    /// Stop and join every background worker.
    pub fn shutdown(&self) {
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            let name = worker.name();
            worker.shutdown();
            info!(worker = name, "worker stopped");
        }
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        &self.realtime_tx
    }
}

/// SSE stream of the tenant's committed events. Lossy for slow readers.
pub fn tenant_sse_stream(
    services: Arc<AppServices>,
    tenant_id: TenantId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(m) if m.tenant_id == tenant_id => {
            let data = serde_json::to_string(&m.payload).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.topic).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
