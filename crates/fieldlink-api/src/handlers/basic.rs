//! Basic handlers - health check.

use axum::{extract::State, Json};
use serde::Serialize;

use fieldlink_devices::{ConnectionState, IngestStatsSnapshot, TransportStatus};

use super::ServerState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub mqtt: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportStatus>,
    pub ingest: IngestStatsSnapshot,
}

/// Health check with broker state and ingestion counters.
///
/// Always 200: a broker outage is reported, not treated as unhealthy.
pub async fn health_handler(State(state): State<ServerState>) -> Json<HealthStatus> {
    let uptime = chrono::Utc::now().timestamp() - state.started_at;

    Json(HealthStatus {
        status: "ok",
        service: "fieldlink",
        version: fieldlink_core::VERSION,
        uptime: uptime.max(0) as u64,
        mqtt: state.mqtt_state(),
        transport: state.transport_status(),
        ingest: state.ingest_stats.snapshot(),
    })
}
