//! Common test utilities for API tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use fieldlink_core::{
    Command, PersistenceGateway, PublishError, PublishResult, SensorReading, SharedGateway,
    StoreError, StoredCommand,
};
use fieldlink_devices::{CommandPublisher, CommandRelay, ConnectionState, IngestStats};
use fieldlink_storage::RedbStore;

use fieldlink_api::handlers::ServerState;

/// Publisher that acknowledges everything while "connected".
pub struct StubPublisher {
    pub state: Mutex<ConnectionState>,
    pub published: Mutex<Vec<Vec<u8>>>,
}

impl StubPublisher {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            published: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CommandPublisher for StubPublisher {
    async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<PublishResult, PublishError> {
        if !self.state().is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.published.lock().push(payload);
        Ok(PublishResult::Acknowledged)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Gateway whose every operation fails.
pub struct BrokenGateway;

#[async_trait]
impl PersistenceGateway for BrokenGateway {
    async fn append_reading(&self, _: &SensorReading) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn append_command(&self, _: &Command) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn latest_reading(&self, _: Option<&str>) -> Result<Option<SensorReading>, StoreError> {
        Err(StoreError::Timeout)
    }

    async fn confirm_delivery(&self, _: Uuid, _: DateTime<Utc>) -> Result<(), StoreError> {
        Err(StoreError::Timeout)
    }

    async fn unconfirmed_commands(&self, _: DateTime<Utc>) -> Result<Vec<Command>, StoreError> {
        Err(StoreError::Timeout)
    }

    async fn list_commands(&self, _: Option<&str>) -> Result<Vec<StoredCommand>, StoreError> {
        Err(StoreError::Timeout)
    }
}

pub struct TestContext {
    pub state: ServerState,
    pub gateway: SharedGateway,
    pub publisher: Arc<StubPublisher>,
}

fn build(gateway: SharedGateway, publisher: Arc<StubPublisher>) -> TestContext {
    let relay = Arc::new(CommandRelay::new(
        gateway.clone(),
        publisher.clone(),
        "agriculture/commands",
    ));
    let state = ServerState::new(
        gateway.clone(),
        relay,
        publisher.clone(),
        Arc::new(IngestStats::default()),
    );
    TestContext {
        state,
        gateway,
        publisher,
    }
}

/// State over a fresh store and a connected broker stub.
pub fn create_test_context() -> TestContext {
    let store = RedbStore::memory().expect("Failed to create store");
    build(Arc::new(store), StubPublisher::new(ConnectionState::Connected))
}

/// State over a fresh store and a broker stub that is down.
pub fn create_disconnected_context() -> TestContext {
    let store = RedbStore::memory().expect("Failed to create store");
    build(Arc::new(store), StubPublisher::new(ConnectionState::Reconnecting))
}

/// State whose store fails every operation.
pub fn create_broken_store_context() -> TestContext {
    build(Arc::new(BrokenGateway), StubPublisher::new(ConnectionState::Connected))
}
