//! Error taxonomy shared across the relay.
//!
//! Each kind maps to one recovery action:
//!
//! | Error | Nature | Handling |
//! |-------|--------|----------|
//! | [`ConnectionError`] | transient | reconnect loop with backoff |
//! | [`PublishError`] | transient | surfaced to the caller, redelivered by the sweeper |
//! | [`IngestError::MalformedPayload`] / [`IngestError::SchemaViolation`] | permanent | logged, counted, dropped |
//! | [`StoreError`] | transient | bounded retry, then dropped or reported |
//! | [`CommandError`] | caller error | surfaced as a 400, never retried |

use thiserror::Error;

/// Failure to establish a broker session.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Network-level failure reaching the broker.
    #[error("Broker unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    /// Broker answered but refused the session (bad credentials, bad client id).
    #[error("Broker refused connection: {0}")]
    Refused(String),

    /// No CONNACK within the configured connect timeout.
    #[error("Timed out connecting to broker at {0}")]
    Timeout(String),

    /// Transport was shut down before a session could be established.
    #[error("Transport shut down")]
    Shutdown,
}

/// Failure to hand a message to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// No live broker session.
    #[error("Not connected to broker")]
    NotConnected,

    /// The client or broker rejected the publish request.
    #[error("Publish rejected: {0}")]
    Rejected(String),

    /// The client's outgoing request queue is full.
    #[error("Outgoing request queue is full")]
    QueueFull,

    /// No acknowledgement within the publish timeout.
    #[error("Publish acknowledgement timed out")]
    Timeout,

    /// Session dropped while waiting for the acknowledgement.
    #[error("Connection lost before acknowledgement")]
    ConnectionLost,
}

impl PublishError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PublishError::Rejected(_))
    }
}

/// Persistence gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or the operation failed inside it.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation exceeded the configured store timeout.
    #[error("Store operation timed out")]
    Timeout,
}

impl StoreError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Serialization(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failure to turn an inbound sensor message into a persisted reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Payload is not UTF-8 JSON.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Payload parsed but lacks required structure.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Persisting failed after every retry.
    #[error("Store failed after {attempts} attempt(s): {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// Permanent errors are dropped without retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedPayload(_) | IngestError::SchemaViolation(_)
        )
    }
}

/// Rejected command request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Device or command missing, malformed or outside the allowed vocabulary.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is present but unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
