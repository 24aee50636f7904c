//! FieldLink field-side components.
//!
//! - [`transport`]: the broker session (MQTT) with reconnect supervision
//! - [`queue`]: bounded hand-off from the broker loop to ingestion
//! - [`ingest`]: parsing and persisting sensor telemetry
//! - [`relay`]: validating, persisting and publishing operator commands

pub mod ingest;
pub mod queue;
pub mod relay;
pub mod transport;

pub use ingest::{parse_reading, DrainReport, IngestWorkers, IngestionPipeline};
pub use queue::{InboundMessage, IngestQueue, IngestStats, IngestStatsSnapshot, OfferOutcome};
pub use relay::{CommandRelay, CommandVocabulary, RedeliveryReport, SubmitReceipt};
pub use transport::{
    CommandPublisher, ConnectionState, ConnectionSupervisor, TransportStats, TransportStatus,
};

#[cfg(feature = "mqtt")]
pub use transport::MqttTransport;
