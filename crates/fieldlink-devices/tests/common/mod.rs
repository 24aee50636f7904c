//! Test doubles for the gateway and the broker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use fieldlink_core::{
    Command, PersistenceGateway, PublishError, PublishResult, SensorReading, StoreError,
    StoredCommand,
};
use fieldlink_devices::{CommandPublisher, ConnectionState};
use fieldlink_storage::RedbStore;

/// A real store with switchable failures.
pub struct FlakyGateway {
    pub inner: RedbStore,
    /// Reading appends still to fail
    pub reading_failures: AtomicU32,
    pub fail_commands: AtomicBool,
    /// Extra latency on every reading append
    pub reading_delay: Mutex<Option<Duration>>,
    pub reading_attempts: AtomicU32,
    /// Latency after a command append has committed
    pub command_delay: Mutex<Option<Duration>>,
}

impl FlakyGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RedbStore::memory().expect("Failed to create store"),
            reading_failures: AtomicU32::new(0),
            fail_commands: AtomicBool::new(false),
            reading_delay: Mutex::new(None),
            reading_attempts: AtomicU32::new(0),
            command_delay: Mutex::new(None),
        })
    }

    pub fn fail_next_readings(&self, n: u32) {
        self.reading_failures.store(n, Ordering::SeqCst);
    }

    pub fn slow_readings(&self, delay: Duration) {
        *self.reading_delay.lock() = Some(delay);
    }

    pub fn slow_command_acks(&self, delay: Duration) {
        *self.command_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn append_reading(&self, reading: &SensorReading) -> Result<(), StoreError> {
        self.reading_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.reading_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .reading_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.append_reading(reading).await
    }

    async fn append_command(&self, command: &Command) -> Result<(), StoreError> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.append_command(command).await?;
        let delay = *self.command_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn latest_reading(&self, device: Option<&str>) -> Result<Option<SensorReading>, StoreError> {
        self.inner.latest_reading(device).await
    }

    async fn confirm_delivery(&self, command_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.confirm_delivery(command_id, at).await
    }

    async fn unconfirmed_commands(&self, since: DateTime<Utc>) -> Result<Vec<Command>, StoreError> {
        self.inner.unconfirmed_commands(since).await
    }

    async fn list_commands(&self, device: Option<&str>) -> Result<Vec<StoredCommand>, StoreError> {
        self.inner.list_commands(device).await
    }
}

/// Records publishes instead of talking to a broker.
pub struct MockPublisher {
    pub state: Mutex<ConnectionState>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockPublisher {
    pub fn connected() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectionState::Connected),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn disconnected() -> Arc<Self> {
        let publisher = Self::connected();
        publisher.set_state(ConnectionState::Reconnecting);
        publisher
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl CommandPublisher for MockPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishResult, PublishError> {
        if !self.state().is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(PublishResult::Acknowledged)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}
