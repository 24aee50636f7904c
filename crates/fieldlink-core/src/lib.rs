//! Core traits and types for FieldLink.
//!
//! This crate defines the domain model shared by the relay crates: sensor
//! readings, actuator commands, the error taxonomy, the persistence gateway
//! contract, configuration and retry policies.

pub mod config;
pub mod error;
pub mod model;
pub mod retry;
pub mod storage;

pub use config::{
    FieldLinkConfig, HttpSettings, IngestSettings, MqttSettings, OverflowPolicy, QosLevel,
    RelaySettings, StorageSettings,
};
pub use error::{CommandError, ConfigError, ConnectionError, IngestError, PublishError, StoreError};
pub use model::{Command, DeliveryOutcome, PublishResult, SensorReading, StoredCommand};
pub use retry::{Jitter, RetryPolicy};
pub use storage::{PersistenceGateway, SharedGateway};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::FieldLinkConfig;
    pub use crate::error::{CommandError, IngestError, PublishError, StoreError};
    pub use crate::model::{Command, DeliveryOutcome, SensorReading, StoredCommand};
    pub use crate::storage::{PersistenceGateway, SharedGateway};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
