//! Tests for basic handlers.

use axum::extract::State;
use fieldlink_api::handlers::basic::*;
use fieldlink_devices::ConnectionState;

use crate::common::{create_disconnected_context, create_test_context};

#[tokio::test]
async fn test_health_handler() {
    let ctx = create_test_context();
    let result = health_handler(State(ctx.state)).await;
    assert_eq!(result.0.status, "ok");
    assert_eq!(result.0.service, "fieldlink");
    assert!(!result.0.version.is_empty());
    assert_eq!(result.0.mqtt, ConnectionState::Connected);
    assert!(result.0.transport.is_none());
}

#[tokio::test]
async fn test_health_reports_broker_outage() {
    let ctx = create_disconnected_context();
    let result = health_handler(State(ctx.state)).await;
    assert_eq!(result.0.status, "ok");
    assert_eq!(result.0.mqtt, ConnectionState::Reconnecting);

    let json = serde_json::to_value(&result.0).unwrap();
    assert_eq!(json["mqtt"], "reconnecting");
    assert_eq!(json["ingest"]["received"], 0);
}
