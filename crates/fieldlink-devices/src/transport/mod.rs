//! Broker transport.
//!
//! The transport owns the single broker session: it feeds inbound sensor
//! messages into the ingest queue and publishes commands for the relay.

pub mod supervisor;

#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use fieldlink_core::{PublishError, PublishResult};

pub use supervisor::{ConnectionSupervisor, SupervisorAction};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// Broker session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Session established and subscription requested.
    Connected,
    /// Session lost, waiting to retry.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishing side of the transport, as seen by the command relay.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish `payload` on `topic`, resolving once the broker acknowledged
    /// it at the configured QoS.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishResult, PublishError>;

    /// Current session state.
    fn state(&self) -> ConnectionState;
}

/// Transport counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub reconnects: AtomicU64,
    /// Sensor subscriptions acknowledged by the broker, one per session
    pub subscriptions: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`] plus the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub reconnects: u64,
    pub subscriptions: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
}

impl TransportStats {
    pub fn status(&self, state: ConnectionState) -> TransportStatus {
        TransportStatus {
            state,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Match an MQTT topic name against a subscription filter (`+` and `#`).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
