//! Sensor reading queries.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ServerState;
use crate::models::ErrorResponse;

#[derive(Debug, Default, Deserialize)]
pub struct SensorQuery {
    /// Restrict to one device
    pub device: Option<String>,
}

/// Latest reading, flat, or `{}` when nothing has been stored yet.
///
/// GET /agriculture/sensors[?device=ID]
pub async fn latest_sensor_handler(
    State(state): State<ServerState>,
    Query(query): Query<SensorQuery>,
) -> Result<Json<Value>, ErrorResponse> {
    let device = query
        .device
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    match state.gateway.latest_reading(device).await {
        Ok(Some(reading)) => Ok(Json(reading.to_json())),
        Ok(None) => Ok(Json(json!({}))),
        Err(e) => {
            tracing::error!(device = ?device, error = %e, "failed to read latest sensor data");
            Err(ErrorResponse::internal("Failed to read sensor data"))
        }
    }
}
