//! Web server and service lifecycle.

pub mod router;
pub mod types;

pub use router::create_router;
pub use types::{ServerState, MAX_REQUEST_BODY_SIZE};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fieldlink_core::{FieldLinkConfig, SharedGateway};
use fieldlink_devices::{
    CommandRelay, CommandVocabulary, ConnectionState, IngestQueue, IngestStats, IngestWorkers,
    IngestionPipeline, MqttTransport,
};
use fieldlink_storage::RedbStore;

/// Running background components behind the HTTP surface.
pub struct Services {
    pub state: ServerState,
    transport: Arc<MqttTransport>,
    workers: IngestWorkers,
    sweeper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    drain_timeout: Duration,
}

impl Services {
    /// Open the store and start ingestion, the broker session and the
    /// optional redelivery sweeper.
    ///
    /// A broker that is down at startup is not fatal: the transport keeps
    /// retrying in the background and commands fail until it is back.
    pub async fn start(config: &FieldLinkConfig) -> anyhow::Result<Self> {
        let store = RedbStore::open(&config.storage.path)
            .with_context(|| format!("failed to open store at {}", config.storage.path))?
            .with_op_timeout(config.storage.op_timeout());
        tracing::info!(path = %config.storage.path, "reading store opened");
        let gateway: SharedGateway = Arc::new(store);

        let stats = Arc::new(IngestStats::default());
        let queue = IngestQueue::with_stats(
            config.ingest.queue_capacity,
            config.ingest.overflow_policy,
            Arc::clone(&stats),
        );
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&gateway),
            config.ingest.retry_policy(),
            Arc::clone(&stats),
        ));
        let workers = IngestWorkers::spawn(queue.clone(), pipeline, config.ingest.workers);
        tracing::info!(workers = workers.len(), capacity = queue.capacity(), "ingest workers started");

        let transport = Arc::new(MqttTransport::start(&config.mqtt, queue));
        if !transport
            .wait_for_state(ConnectionState::Connected, config.mqtt.connect_timeout())
            .await
        {
            tracing::warn!(
                broker = %transport.broker(),
                "MQTT broker not reachable yet, retrying in background"
            );
        }

        let relay = Arc::new(
            CommandRelay::new(
                Arc::clone(&gateway),
                transport.clone(),
                config.mqtt.command_topic.clone(),
            )
            .with_vocabulary(CommandVocabulary::from(&config.relay)),
        );

        let cancel = CancellationToken::new();
        let sweeper = config.relay.sweep_interval_secs.map(|secs| {
            tracing::info!(interval_secs = secs, "redelivery sweeper enabled");
            Arc::clone(&relay).spawn_sweeper(
                Duration::from_secs(secs),
                Duration::from_secs(config.relay.sweep_window_secs),
                cancel.clone(),
            )
        });

        let state = ServerState::new(gateway, relay, transport.clone(), stats)
            .with_transport(Arc::clone(&transport));

        Ok(Self {
            state,
            transport,
            workers,
            sweeper,
            cancel,
            drain_timeout: config.ingest.drain_timeout(),
        })
    }

    /// Stop intake, drain queued readings, then disconnect from the broker.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(sweeper) = self.sweeper {
            let _ = sweeper.await;
        }

        let report = self.workers.shutdown(self.drain_timeout).await;
        if report.completed {
            tracing::info!("ingest queue drained");
        }

        self.transport.shutdown().await;
        let stats = self.state.ingest_stats.snapshot();
        tracing::info!(
            received = stats.received,
            persisted = stats.persisted,
            dropped = stats.dropped,
            "services stopped"
        );
    }
}

/// Start the service and serve HTTP until a shutdown signal arrives.
/// This is the main entry point for running the server.
pub async fn run(config: FieldLinkConfig) -> anyhow::Result<()> {
    config.validate()?;

    let services = Services::start(&config).await?;

    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;
    tracing::info!(addr = %config.http.bind, "HTTP server listening");

    let app = create_router(services.state.clone());

    // Run with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown::shutdown_signal())
        .await;

    services.shutdown().await;
    tracing::info!("Server shutdown complete");

    served.context("HTTP server error")
}
