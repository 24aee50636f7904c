//! Sensor ingestion: parse, stamp and persist inbound telemetry.
//!
//! [`IngestionPipeline::handle`] is the unit of work for one message. The
//! worker pool pulls messages off the [`IngestQueue`] and feeds them through
//! the pipeline; on shutdown it drains what is left within a deadline.
//!
//! Readings are routed to workers by device, so one device's readings are
//! always stored by the same worker, in the order they were received.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fieldlink_core::model::DEVICE_FIELD;
use fieldlink_core::{IngestError, RetryPolicy, SensorReading, SharedGateway};

use crate::queue::{IngestQueue, IngestStats};

/// Readings buffered per worker ahead of the store.
const SHARD_BUFFER: usize = 64;

/// Parse a raw payload into a reading stamped with `received_at`.
///
/// The payload must be a UTF-8 JSON object with a non-empty string
/// `device`. Any device-supplied `timestamp` is discarded.
pub fn parse_reading(raw: &[u8], received_at: DateTime<Utc>) -> Result<SensorReading, IngestError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| IngestError::MalformedPayload(format!("not UTF-8: {}", e)))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::MalformedPayload(format!("not JSON: {}", e)))?;

    let Value::Object(mut values) = value else {
        return Err(IngestError::SchemaViolation(
            "payload must be a JSON object".to_string(),
        ));
    };

    let device = match values.remove(DEVICE_FIELD) {
        Some(Value::String(device)) if !device.trim().is_empty() => device,
        Some(Value::String(_)) => {
            return Err(IngestError::SchemaViolation(
                "device must not be empty".to_string(),
            ))
        }
        Some(_) => {
            return Err(IngestError::SchemaViolation(
                "device must be a string".to_string(),
            ))
        }
        None => {
            return Err(IngestError::SchemaViolation(
                "missing device field".to_string(),
            ))
        }
    };

    Ok(SensorReading::new(device, values, received_at))
}

/// Turns inbound sensor messages into persisted readings.
pub struct IngestionPipeline {
    gateway: SharedGateway,
    retry: RetryPolicy,
    stats: Arc<IngestStats>,
}

impl IngestionPipeline {
    pub fn new(gateway: SharedGateway, retry: RetryPolicy, stats: Arc<IngestStats>) -> Self {
        Self {
            gateway,
            retry,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Process one raw message.
    ///
    /// Malformed payloads produce no write and no side effect beyond the
    /// counters. A valid payload yields exactly one persisted reading, or a
    /// [`IngestError::Store`] once the retry policy is exhausted.
    pub async fn handle(&self, raw: &[u8], received_at: DateTime<Utc>) -> Result<(), IngestError> {
        let reading = self.parse(raw, received_at)?;
        self.store(&reading).await
    }

    /// Parse a payload, counting rejects.
    pub fn parse(&self, raw: &[u8], received_at: DateTime<Utc>) -> Result<SensorReading, IngestError> {
        parse_reading(raw, received_at).inspect_err(|e| {
            match e {
                IngestError::MalformedPayload(_) => IngestStats::incr(&self.stats.malformed),
                _ => IngestStats::incr(&self.stats.schema_violations),
            };
        })
    }

    /// Persist a parsed reading, retrying transient store errors.
    pub async fn store(&self, reading: &SensorReading) -> Result<(), IngestError> {
        self.persist(reading).await?;
        IngestStats::incr(&self.stats.persisted);
        tracing::debug!(device = %reading.device, "sensor reading stored");
        Ok(())
    }

    async fn persist(&self, reading: &SensorReading) -> Result<(), IngestError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.gateway.append_reading(reading).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && self.retry.should_retry(attempts) => {
                    IngestStats::incr(&self.stats.store_retries);
                    let delay = self.retry.delay_for_attempt(attempts);
                    tracing::warn!(
                        device = %reading.device,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed to store reading, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    IngestStats::incr(&self.stats.store_failures);
                    return Err(IngestError::Store {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}

/// Result of draining the worker pool on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether every worker finished before the deadline
    pub completed: bool,
    /// Messages still queued or in progress when the workers were aborted
    pub abandoned: usize,
}

/// A pool of ingestion workers fed from one queue.
///
/// A dispatcher task parses each message and hands the reading to the
/// worker owning its device.
pub struct IngestWorkers {
    queue: IngestQueue,
    dispatcher: JoinHandle<()>,
    handles: Vec<JoinHandle<()>>,
    /// Readings handed to a worker and not yet finished
    pending: Arc<AtomicUsize>,
}

impl IngestWorkers {
    /// Spawn `count` workers (at least one).
    pub fn spawn(queue: IngestQueue, pipeline: Arc<IngestionPipeline>, count: usize) -> Self {
        let pending = Arc::new(AtomicUsize::new(0));
        let (shards, handles): (Vec<_>, Vec<_>) = (0..count.max(1))
            .map(|id| {
                let (tx, rx) = mpsc::channel(SHARD_BUFFER);
                let handle = tokio::spawn(run_worker(
                    id,
                    rx,
                    Arc::clone(&pipeline),
                    Arc::clone(&pending),
                ));
                (tx, handle)
            })
            .unzip();
        let dispatcher = tokio::spawn(run_dispatcher(
            queue.clone(),
            pipeline,
            shards,
            Arc::clone(&pending),
        ));
        Self {
            queue,
            dispatcher,
            handles,
            pending,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Close the queue and let the workers finish what is queued.
    ///
    /// Workers still running at the deadline are aborted and the remaining
    /// messages are discarded and logged.
    pub async fn shutdown(self, drain_timeout: Duration) -> DrainReport {
        self.queue.close();
        let pending = self.queue.len() + self.pending.load(Ordering::SeqCst);
        if pending > 0 {
            tracing::info!(pending, "draining ingest queue");
        }

        let mut tasks = self.handles;
        tasks.push(self.dispatcher);
        let aborts: Vec<_> = tasks.iter().map(|h| h.abort_handle()).collect();
        let joined =
            tokio::time::timeout(drain_timeout, futures::future::join_all(tasks)).await;

        match joined {
            Ok(_) => DrainReport {
                completed: true,
                abandoned: 0,
            },
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                let abandoned = self.queue.clear() + self.pending.swap(0, Ordering::SeqCst);
                tracing::warn!(
                    abandoned,
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "ingest drain timed out, discarding queued messages"
                );
                DrainReport {
                    completed: false,
                    abandoned,
                }
            }
        }
    }
}

/// Worker index owning `device`.
fn shard_for(device: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_dispatcher(
    queue: IngestQueue,
    pipeline: Arc<IngestionPipeline>,
    shards: Vec<mpsc::Sender<SensorReading>>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(message) = queue.recv().await {
        let reading = match pipeline.parse(&message.payload, message.received_at) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "dropping sensor message");
                continue;
            }
        };

        let shard = &shards[shard_for(&reading.device, shards.len())];
        pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(reading)) = shard.send(reading).await {
            pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(device = %reading.device, "ingest worker gone, reading lost");
        }
    }
    // Dropping the senders lets each worker finish its backlog and exit
}

async fn run_worker(
    id: usize,
    mut readings: mpsc::Receiver<SensorReading>,
    pipeline: Arc<IngestionPipeline>,
    pending: Arc<AtomicUsize>,
) {
    tracing::debug!(worker = id, "ingest worker started");
    while let Some(reading) = readings.recv().await {
        if let Err(e) = pipeline.store(&reading).await {
            tracing::error!(device = %reading.device, error = %e, "sensor reading lost");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!(worker = id, "ingest worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_core::model::now;
    use serde_json::json;

    #[test]
    fn test_parse_valid_reading() {
        let at = now();
        let reading = parse_reading(br#"{"device":"soil-1","moisture":42}"#, at).unwrap();
        assert_eq!(reading.device, "soil-1");
        assert_eq!(reading.values["moisture"], json!(42));
        assert_eq!(reading.timestamp, at);
    }

    #[test]
    fn test_client_timestamp_is_replaced() {
        let at = now();
        let raw = br#"{"device":"soil-1","timestamp":"1999-01-01T00:00:00Z","ph":6.5}"#;
        let reading = parse_reading(raw, at).unwrap();
        assert_eq!(reading.timestamp, at);
        assert!(!reading.values.contains_key("timestamp"));
    }

    #[test]
    fn test_malformed_payloads() {
        let at = now();
        for raw in [&b"not json"[..], &[0xff, 0xfe, 0x00][..], &b""[..], &b"{\"device\":"[..]] {
            assert!(matches!(
                parse_reading(raw, at),
                Err(IngestError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_device_always_maps_to_same_shard() {
        for shards in 1..8 {
            let first = shard_for("soil-1", shards);
            assert!(first < shards);
            assert_eq!(shard_for("soil-1", shards), first);
        }
        assert_eq!(shard_for("anything", 1), 0);
    }

    #[test]
    fn test_schema_violations() {
        let at = now();
        for raw in [
            &br#"[1,2,3]"#[..],
            &br#""soil-1""#[..],
            &br#"{"moisture":42}"#[..],
            &br#"{"device":""}"#[..],
            &br#"{"device":7}"#[..],
        ] {
            assert!(matches!(
                parse_reading(raw, at),
                Err(IngestError::SchemaViolation(_))
            ));
        }
    }
}
