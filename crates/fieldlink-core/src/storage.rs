//! Persistence gateway contract.
//!
//! The gateway is the only path to the durable store. It is append-only from
//! the relay's point of view: readings and commands are never updated or
//! deleted here, and delivery confirmations are appended as separate records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Command, SensorReading, StoredCommand};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Shared handle to a gateway, constructed once at startup.
pub type SharedGateway = Arc<dyn PersistenceGateway>;

/// Append-only access to readings and commands.
///
/// Implementations must be safe for concurrent use from the ingestion
/// workers, the command relay and the HTTP handlers.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Persist one sensor reading.
    async fn append_reading(&self, reading: &SensorReading) -> Result<()>;

    /// Persist one command. Must be durable before the command is published.
    async fn append_command(&self, command: &Command) -> Result<()>;

    /// Most recently persisted reading, optionally restricted to one device.
    async fn latest_reading(&self, device: Option<&str>) -> Result<Option<SensorReading>>;

    /// Record that the broker acknowledged a command. Idempotent.
    async fn confirm_delivery(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Commands issued at or after `since` with no delivery confirmation,
    /// oldest first.
    async fn unconfirmed_commands(&self, since: DateTime<Utc>) -> Result<Vec<Command>>;

    /// All commands with their confirmation state, oldest first.
    async fn list_commands(&self, device: Option<&str>) -> Result<Vec<StoredCommand>>;
}
