//! Testing utilities for FieldLink
//!
//! This crate provides:
//! - An in-process MQTT broker (or an external one via `FIELDLINK_TEST_BROKER`)
//! - A TCP link whose connections can be cut to simulate broker restarts
//! - A field device simulator publishing readings and collecting commands

pub mod broker;
pub mod device;
pub mod link;

pub use broker::TestBroker;
pub use device::FieldDevice;
pub use link::BrokerLink;

use std::future::Future;
use std::time::Duration;

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
