//! Tests for sensor query handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use fieldlink_api::handlers::sensors::*;
use fieldlink_core::model::now;
use fieldlink_core::{PersistenceGateway, SensorReading};
use serde_json::json;

use crate::common::{create_broken_store_context, create_test_context};

fn reading(device: &str, moisture: i64) -> SensorReading {
    SensorReading::new(
        device,
        json!({ "moisture": moisture, "temperature": 21.5 })
            .as_object()
            .unwrap()
            .clone(),
        now(),
    )
}

#[tokio::test]
async fn test_empty_store_returns_empty_object() {
    let ctx = create_test_context();
    let result = latest_sensor_handler(State(ctx.state), Query(SensorQuery::default()))
        .await
        .unwrap();
    assert_eq!(result.0, json!({}));
}

#[tokio::test]
async fn test_returns_latest_reading_flat() {
    let ctx = create_test_context();
    let first = reading("soil-1", 10);
    let second = reading("soil-2", 20);
    ctx.gateway.append_reading(&first).await.unwrap();
    ctx.gateway.append_reading(&second).await.unwrap();

    let result = latest_sensor_handler(State(ctx.state), Query(SensorQuery::default()))
        .await
        .unwrap();
    let body = result.0;
    assert_eq!(body["device"], "soil-2");
    assert_eq!(body["moisture"], 20);
    assert_eq!(body["temperature"], 21.5);
    let ts = body["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z'));
    assert_eq!(body.as_object().unwrap().len(), 4);
    assert!(body.get("_id").is_none());
}

#[tokio::test]
async fn test_filters_by_device() {
    let ctx = create_test_context();
    ctx.gateway.append_reading(&reading("soil-1", 10)).await.unwrap();
    ctx.gateway.append_reading(&reading("soil-2", 20)).await.unwrap();

    let query = SensorQuery {
        device: Some("soil-1".to_string()),
    };
    let result = latest_sensor_handler(State(ctx.state.clone()), Query(query))
        .await
        .unwrap();
    assert_eq!(result.0["moisture"], 10);

    let query = SensorQuery {
        device: Some("unknown".to_string()),
    };
    let result = latest_sensor_handler(State(ctx.state), Query(query))
        .await
        .unwrap();
    assert_eq!(result.0, json!({}));
}

#[tokio::test]
async fn test_store_failure_is_sanitized() {
    let ctx = create_broken_store_context();
    let err = latest_sensor_handler(State(ctx.state), Query(SensorQuery::default()))
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.message, "Failed to read sensor data");
}
