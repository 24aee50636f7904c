//! Service configuration.
//!
//! Values are resolved in order: built-in defaults, an optional TOML file,
//! environment variables, then command-line flags applied by the binary.
//!
//! ```toml
//! [mqtt]
//! host = "broker.local"
//! port = 1883
//!
//! [storage]
//! path = "/var/lib/fieldlink/fieldlink.redb"
//!
//! [ingest]
//! queue_capacity = 1024
//! overflow_policy = "drop_oldest"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default MQTT topics, as used by the deployed field devices.
pub mod topics {
    pub const SENSORS: &str = "agriculture/sensors";
    pub const COMMANDS: &str = "agriculture/commands";
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "FIELDLINK_CONFIG";
    pub const MQTT_HOST: &str = "MQTT_BROKER_ADDRESS";
    pub const MQTT_PORT: &str = "MQTT_BROKER_PORT";
    pub const MQTT_KEEPALIVE: &str = "MQTT_KEEPALIVE";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const DB_PATH: &str = "FIELDLINK_DB_PATH";
    pub const HTTP_BIND: &str = "FIELDLINK_HTTP_BIND";
    pub const LOG_JSON: &str = "FIELDLINK_LOG_JSON";
}

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// What the ingest queue does when a message arrives while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room; fresh telemetry wins.
    #[default]
    DropOldest,
    /// Reject the arriving message.
    DropNewest,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Client id; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Topic carrying sensor telemetry
    pub sensor_topic: String,
    /// Topic carrying actuator commands
    pub command_topic: String,
    /// QoS for the subscription and for command publishes
    pub qos: QosLevel,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 60,
            client_id: None,
            username: None,
            password: None,
            sensor_topic: topics::SENSORS.to_string(),
            command_topic: topics::COMMANDS.to_string(),
            qos: QosLevel::AtLeastOnce,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl MqttSettings {
    /// Create settings for a broker, other fields defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set authentication.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Reconnect backoff: unbounded attempts, exponential, capped.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            ..RetryPolicy::reconnect()
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Database file path (the store connection string)
    pub path: String,
    /// Per-operation timeout in seconds
    pub op_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: "./data/fieldlink.redb".to_string(),
            op_timeout_secs: 5,
        }
    }
}

impl StorageSettings {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Bounded queue capacity between the broker loop and the workers
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Number of ingestion workers
    pub workers: usize,
    /// Store attempts per reading, including the first
    pub max_store_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// How long shutdown waits for the queue to drain
    pub drain_timeout_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            workers: 1,
            max_store_attempts: 3,
            retry_base_ms: 200,
            retry_max_ms: 5000,
            drain_timeout_secs: 5,
        }
    }
}

impl IngestSettings {
    /// Store retry policy for readings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_store_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Command relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Restrict commands to this vocabulary; any well-formed verb when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_commands: Option<Vec<String>>,
    /// Redelivery sweep interval; sweeper disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,
    /// How far back the sweeper looks for unconfirmed commands
    pub sweep_window_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            allowed_commands: None,
            sweep_interval_secs: None,
            sweep_window_secs: 3600,
        }
    }
}

/// HTTP query surface settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Listen address
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLinkConfig {
    pub mqtt: MqttSettings,
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
    pub relay: RelaySettings,
    pub http: HttpSettings,
}

impl FieldLinkConfig {
    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Defaults, optional file, then process environment.
    ///
    /// Without an explicit path the file named by `FIELDLINK_CONFIG` is
    /// read, if set. The result is not validated so callers can layer their
    /// own overrides first.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) against an arbitrary environment lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match lookup(env_vars::CONFIG_PATH) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };
        config.apply_env_from(lookup)?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = parse_env(env_vars::MQTT_PORT, &port)?;
        }
        if let Some(keep_alive) = lookup(env_vars::MQTT_KEEPALIVE) {
            self.mqtt.keep_alive_secs = parse_env(env_vars::MQTT_KEEPALIVE, &keep_alive)?;
        }
        if let Some(username) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(password);
        }
        if let Some(path) = lookup(env_vars::DB_PATH) {
            self.storage.path = path;
        }
        if let Some(bind) = lookup(env_vars::HTTP_BIND) {
            self.http.bind = bind;
        }
        Ok(())
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.mqtt.host.trim().is_empty() {
            return invalid("mqtt.host must not be empty");
        }
        if self.mqtt.port == 0 {
            return invalid("mqtt.port must be greater than zero");
        }
        if self.mqtt.sensor_topic.is_empty() || self.mqtt.command_topic.is_empty() {
            return invalid("mqtt topics must not be empty");
        }
        if self.mqtt.command_topic.contains(['+', '#']) {
            return invalid("mqtt.command_topic must not contain wildcards");
        }
        if self.mqtt.connect_timeout_secs == 0 || self.mqtt.publish_timeout_secs == 0 {
            return invalid("mqtt timeouts must be greater than zero");
        }
        if self.mqtt.reconnect_base_ms == 0 || self.mqtt.reconnect_max_ms < self.mqtt.reconnect_base_ms {
            return invalid("mqtt.reconnect_max_ms must be >= reconnect_base_ms > 0");
        }
        if self.storage.path.trim().is_empty() {
            return invalid("storage.path must not be empty");
        }
        if self.storage.op_timeout_secs == 0 {
            return invalid("storage.op_timeout_secs must be greater than zero");
        }
        if self.ingest.queue_capacity == 0 {
            return invalid("ingest.queue_capacity must be greater than zero");
        }
        if self.ingest.workers == 0 {
            return invalid("ingest.workers must be greater than zero");
        }
        if self.ingest.max_store_attempts == 0 {
            return invalid("ingest.max_store_attempts must be greater than zero");
        }
        if self.ingest.retry_max_ms < self.ingest.retry_base_ms {
            return invalid("ingest.retry_max_ms must be >= retry_base_ms");
        }
        if let Some(allowed) = &self.relay.allowed_commands {
            if allowed.iter().any(|c| c.trim().is_empty()) {
                return invalid("relay.allowed_commands must not contain empty entries");
            }
        }
        if self.relay.sweep_interval_secs == Some(0) {
            return invalid("relay.sweep_interval_secs must be greater than zero");
        }
        if self.http.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "http.bind is not a socket address: {}",
                self.http.bind
            )));
        }
        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, raw)))
}
