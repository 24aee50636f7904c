//! Command relay handlers.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fieldlink_core::model::iso8601;
use fieldlink_core::{CommandError, DeliveryOutcome, StoredCommand};

use super::ServerState;
use crate::models::ErrorResponse;

/// Body of a relay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub device: String,
    pub command: String,
}

/// Parse a relay body. Anything that is not a JSON object with non-blank
/// string `device` and `command` fields is an invalid payload.
pub fn parse_relay_request(body: &[u8]) -> Result<RelayRequest, ErrorResponse> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ErrorResponse::invalid_payload())?;

    let field = |name: &str| -> Result<String, ErrorResponse> {
        match value.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            _ => Err(ErrorResponse::invalid_payload()),
        }
    };

    Ok(RelayRequest {
        device: field("device")?,
        command: field("command")?,
    })
}

/// Persist a command and publish it to the field.
///
/// POST /agriculture/relay
pub async fn relay_command_handler(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Value>, ErrorResponse> {
    let request = parse_relay_request(&body)?;

    let receipt = match state.relay.submit(&request.device, &request.command).await {
        Ok(receipt) => receipt,
        Err(CommandError::InvalidCommand(message)) => {
            tracing::debug!(device = %request.device, reason = %message, "command rejected");
            return Err(ErrorResponse::bad_request(message));
        }
    };

    match receipt.outcome {
        DeliveryOutcome::Published => Ok(Json(json!({
            "message": format!(
                "Command '{}' sent to '{}'",
                receipt.command.command, receipt.command.device
            )
        }))),
        DeliveryOutcome::PersistedOnly(_) => {
            Err(ErrorResponse::internal("Command stored but not delivered"))
        }
        DeliveryOutcome::Failed(_) => Err(ErrorResponse::internal("Failed to store command")),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandQuery {
    pub device: Option<String>,
}

/// One command as listed to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub device: String,
    pub command: String,
    pub timestamp: String,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
}

impl From<StoredCommand> for CommandRecord {
    fn from(stored: StoredCommand) -> Self {
        Self {
            delivered: stored.is_delivered(),
            delivered_at: stored.delivered_at.as_ref().map(iso8601::format),
            timestamp: iso8601::format(&stored.command.timestamp),
            device: stored.command.device,
            command: stored.command.command,
        }
    }
}

/// Issued commands, oldest first, with delivery state.
///
/// GET /agriculture/commands[?device=ID]
pub async fn list_commands_handler(
    State(state): State<ServerState>,
    Query(query): Query<CommandQuery>,
) -> Result<Json<Vec<CommandRecord>>, ErrorResponse> {
    let device = query
        .device
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    let commands = state.gateway.list_commands(device).await.map_err(|e| {
        tracing::error!(error = %e, "failed to list commands");
        ErrorResponse::internal("Failed to read commands")
    })?;

    Ok(Json(commands.into_iter().map(CommandRecord::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_request() {
        let req = parse_relay_request(br#"{"device":"pump-1","command":"on"}"#).unwrap();
        assert_eq!(req.device, "pump-1");
        assert_eq!(req.command, "on");
    }

    #[test]
    fn test_parse_rejects_bad_bodies() {
        for body in [
            &b""[..],
            &b"not json"[..],
            &br#"[]"#[..],
            &br#"{"device":"pump-1"}"#[..],
            &br#"{"command":"on"}"#[..],
            &br#"{"device":"","command":"on"}"#[..],
            &br#"{"device":"pump-1","command":"  "}"#[..],
            &br#"{"device":1,"command":"on"}"#[..],
        ] {
            assert_eq!(parse_relay_request(body).unwrap_err(), ErrorResponse::invalid_payload());
        }
    }
}
