//! Server state and types.

use std::sync::Arc;

use fieldlink_core::SharedGateway;
use fieldlink_devices::{
    CommandPublisher, CommandRelay, ConnectionState, IngestStats, MqttTransport, TransportStatus,
};

/// Maximum request body size (64 KB)
pub const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

/// Server state shared across all handlers.
#[derive(Clone)]
pub struct ServerState {
    /// Read access to readings and commands
    pub gateway: SharedGateway,
    pub relay: Arc<CommandRelay>,
    /// Session state source for health reporting
    pub publisher: Arc<dyn CommandPublisher>,
    /// Present when running against a real broker
    pub transport: Option<Arc<MqttTransport>>,
    pub ingest_stats: Arc<IngestStats>,
    /// Unix timestamp of server start
    pub started_at: i64,
}

impl ServerState {
    pub fn new(
        gateway: SharedGateway,
        relay: Arc<CommandRelay>,
        publisher: Arc<dyn CommandPublisher>,
        ingest_stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            gateway,
            relay,
            publisher,
            transport: None,
            ingest_stats,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<MqttTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn mqtt_state(&self) -> ConnectionState {
        self.publisher.state()
    }

    pub fn transport_status(&self) -> Option<TransportStatus> {
        self.transport.as_ref().map(|t| t.status())
    }
}
