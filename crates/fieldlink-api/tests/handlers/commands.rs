//! Tests for command relay handlers.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use fieldlink_api::handlers::commands::*;
use fieldlink_core::PersistenceGateway;
use serde_json::Value;

use crate::common::{create_broken_store_context, create_disconnected_context, create_test_context};

fn body(raw: &str) -> Bytes {
    Bytes::from(raw.to_string())
}

#[tokio::test]
async fn test_relay_publishes_and_confirms() {
    let ctx = create_test_context();
    let result = relay_command_handler(
        State(ctx.state.clone()),
        body(r#"{"device":"pump-1","command":"on"}"#),
    )
    .await
    .unwrap();
    assert_eq!(result.0["message"], "Command 'on' sent to 'pump-1'");

    let published = ctx.publisher.published.lock().clone();
    assert_eq!(published.len(), 1);
    let wire: Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(wire["device"], "pump-1");
    assert_eq!(wire["command"], "on");

    let listed = list_commands_handler(State(ctx.state), Query(CommandQuery::default()))
        .await
        .unwrap();
    assert_eq!(listed.0.len(), 1);
    assert!(listed.0[0].delivered);
}

#[tokio::test]
async fn test_relay_rejects_invalid_payload() {
    let ctx = create_test_context();
    for raw in ["", "{", r#"{"device":"pump-1"}"#, r#"{"device":"","command":"on"}"#] {
        let err = relay_command_handler(State(ctx.state.clone()), body(raw))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid payload");
    }
    assert!(ctx.publisher.published.lock().is_empty());
    assert!(ctx.gateway.list_commands(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_rejects_malformed_command() {
    let ctx = create_test_context();
    let err = relay_command_handler(
        State(ctx.state.clone()),
        body(r#"{"device":"pump/#","command":"on"}"#),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
    assert_ne!(err.message, "Invalid payload");
    assert!(ctx.gateway.list_commands(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_reports_undelivered_command() {
    let ctx = create_disconnected_context();
    let err = relay_command_handler(
        State(ctx.state.clone()),
        body(r#"{"device":"valve-3","command":"off"}"#),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.message, "Command stored but not delivered");

    let query = CommandQuery {
        device: Some("valve-3".to_string()),
    };
    let listed = list_commands_handler(State(ctx.state), Query(query))
        .await
        .unwrap();
    assert_eq!(listed.0.len(), 1);
    assert!(!listed.0[0].delivered);
    assert!(listed.0[0].delivered_at.is_none());
}

#[tokio::test]
async fn test_relay_store_failure() {
    let ctx = create_broken_store_context();
    let err = relay_command_handler(
        State(ctx.state),
        body(r#"{"device":"pump-1","command":"on"}"#),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.message, "Failed to store command");
    assert!(ctx.publisher.published.lock().is_empty());
}
