//! Domain records: sensor readings, actuator commands and delivery outcomes.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PublishError, StoreError};

/// Field carrying the originating device identifier.
pub const DEVICE_FIELD: &str = "device";

/// Field carrying the server-stamped timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Current UTC time at the precision timestamps are persisted with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// ISO 8601 timestamps in UTC with microseconds and a `Z` suffix,
/// e.g. `2024-05-01T12:00:00.123456Z`.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Render a timestamp in wire format.
    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parse any RFC 3339 timestamp into UTC.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Same format for optional timestamps.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&super::format(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| super::parse(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// One telemetry sample, stamped with the time it was received.
///
/// Serialized flat: `{"device": "soil-1", "moisture": 42, "timestamp": "..."}`.
/// The measurement map is open; `device` and `timestamp` are reserved keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Originating device identifier
    pub device: String,
    /// Measurement name to value
    #[serde(flatten)]
    pub values: Map<String, Value>,
    /// Receipt time, stamped by the ingestion pipeline
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Create a reading from a measurement map.
    ///
    /// Reserved keys are stripped from `values`; the receipt time always wins
    /// over any device-supplied timestamp.
    pub fn new(
        device: impl Into<String>,
        mut values: Map<String, Value>,
        received_at: DateTime<Utc>,
    ) -> Self {
        values.remove(DEVICE_FIELD);
        values.remove(TIMESTAMP_FIELD);
        Self {
            device: device.into(),
            values,
            timestamp: received_at,
        }
    }

    /// Flat JSON object as served by the query surface.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::with_capacity(self.values.len() + 2);
        obj.insert(DEVICE_FIELD.to_string(), Value::String(self.device.clone()));
        for (k, v) in &self.values {
            obj.insert(k.clone(), v.clone());
        }
        obj.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(iso8601::format(&self.timestamp)),
        );
        Value::Object(obj)
    }
}

/// An operator instruction for a field actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Internal record id, never sent to the field
    pub id: Uuid,
    /// Target device identifier
    pub device: String,
    /// Command verb, e.g. "on" / "off"
    pub command: String,
    /// Issuance time, stamped by the relay
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

/// Command as published on the command topic.
#[derive(Serialize)]
struct CommandMessage<'a> {
    device: &'a str,
    command: &'a str,
    timestamp: String,
}

impl Command {
    /// Create a command stamped with the current time.
    pub fn new(device: impl Into<String>, command: impl Into<String>) -> Self {
        Self::issued_at(device, command, now())
    }

    /// Create a command with an explicit issuance time.
    pub fn issued_at(
        device: impl Into<String>,
        command: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device: device.into(),
            command: command.into(),
            timestamp,
        }
    }

    /// Wire payload: `{"device","command","timestamp"}`.
    pub fn wire_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&CommandMessage {
            device: &self.device,
            command: &self.command,
            timestamp: iso8601::format(&self.timestamp),
        })
    }
}

/// A persisted command joined with its delivery confirmation, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCommand {
    #[serde(flatten)]
    pub command: Command,
    #[serde(with = "iso8601::option", default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl StoredCommand {
    /// Whether the broker acknowledged the command.
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Successful hand-off to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    Acknowledged,
}

/// Result of the store-then-publish commit for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Durable record written and broker acknowledged the publish.
    Published,
    /// Durable record written, publish failed; eligible for redelivery.
    PersistedOnly(PublishError),
    /// Nothing written, nothing published.
    Failed(StoreError),
}

impl DeliveryOutcome {
    pub fn is_persisted(&self) -> bool {
        !matches!(self, DeliveryOutcome::Failed(_))
    }

    pub fn is_published(&self) -> bool {
        matches!(self, DeliveryOutcome::Published)
    }

    /// Lowercase label for logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Published => "published",
            DeliveryOutcome::PersistedOnly(_) => "persisted_only",
            DeliveryOutcome::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
