//! Route table.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{basic, commands, sensors};

use super::{ServerState, MAX_REQUEST_BODY_SIZE};

/// Build the application router.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/agriculture/sensors", get(sensors::latest_sensor_handler))
        .route("/agriculture/relay", post(commands::relay_command_handler))
        .route("/agriculture/commands", get(commands::list_commands_handler))
        .route("/api/health", get(basic::health_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_SIZE))
        // Any origin may call the API
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
