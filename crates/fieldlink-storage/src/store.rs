//! Reading and command storage using redb.
//!
//! Layout:
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `readings` | sequence (u64, ascending) | reading JSON |
//! | `latest_by_device` | device id | sequence of its newest reading |
//! | `commands` | `<issued micros:020>-<uuid>` | command JSON |
//! | `command_deliveries` | command uuid | delivery timestamp |
//!
//! Every append is a single write transaction. Sequence keys are assigned
//! inside that transaction, so persisted order equals append order.
//!
//! A write that outlives its operation timeout is rolled back rather than
//! committed late: once a caller has been told `Timeout`, the record is not
//! in the store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use uuid::Uuid;

use fieldlink_core::model::iso8601;
use fieldlink_core::{Command, PersistenceGateway, SensorReading, StoreError, StoredCommand};

use crate::{Error, Result};

const READINGS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("readings");
const LATEST_TABLE: TableDefinition<&str, u64> = TableDefinition::new("latest_by_device");
const COMMANDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("commands");
const DELIVERIES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("command_deliveries");

/// Default per-operation timeout.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

fn command_key(command: &Command) -> String {
    format!("{}-{}", time_prefix(&command.timestamp), command.id)
}

fn time_prefix(ts: &DateTime<Utc>) -> String {
    format!("{:020}", ts.timestamp_micros().max(0))
}

const GATE_PENDING: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_ABANDONED: u8 = 2;

/// Decides, between a blocking write and the caller waiting on it, whether
/// the write commits or is abandoned. Exactly one side wins.
#[derive(Clone, Default)]
struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    /// Writer side, right before commit. False once the caller gave up.
    fn enter(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side, on timeout. False when the commit is already running.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn commit(write_txn: WriteTransaction, gate: &CommitGate) -> Result<()> {
    if !gate.enter() {
        write_txn.abort()?;
        return Err(Error::Storage("write abandoned after timeout".to_string()));
    }
    write_txn.commit()?;
    Ok(())
}

/// redb-backed persistence gateway.
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
    op_timeout: Duration,
    /// Backing file of a throwaway store, removed on drop.
    temp_path: Option<PathBuf>,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;
        Self::init_tables(&db)?;
        tracing::debug!(path = %path.display(), "opened reading store");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            op_timeout: DEFAULT_OP_TIMEOUT,
            temp_path: None,
        })
    }

    /// Create a throwaway store for tests.
    pub fn memory() -> Result<Self> {
        // redb doesn't have true in-memory mode, so use a temp file
        let temp_path =
            std::env::temp_dir().join(format!("fieldlink_{}.redb", Uuid::new_v4()));
        let mut store = Self::open(&temp_path)?;
        store.temp_path = Some(temp_path);
        Ok(store)
    }

    /// Set the per-operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Get the storage path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_tables(db: &Database) -> Result<()> {
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(READINGS_TABLE)?;
            write_txn.open_table(LATEST_TABLE)?;
            write_txn.open_table(COMMANDS_TABLE)?;
            write_txn.open_table(DELIVERIES_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Run a blocking database operation off the async runtime, bounded by
    /// the operation timeout.
    ///
    /// Writes pass through the [`CommitGate`]: on timeout the write is
    /// abandoned unless its commit already started, in which case the commit
    /// is awaited and its result returned.
    async fn run<T, F>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: FnOnce(&Database, &CommitGate) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let gate = CommitGate::default();
        let op_gate = gate.clone();
        let mut task = tokio::task::spawn_blocking(move || op(&db, &op_gate));

        let joined = match tokio::time::timeout(self.op_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => return Err(StoreError::Timeout),
            Err(_) => {
                tracing::debug!("store operation timed out during commit, waiting for it");
                task.await
            }
        };
        let result = joined.map_err(Error::from)?;
        result.map_err(StoreError::from)
    }

    fn insert_reading(db: &Database, gate: &CommitGate, reading: &SensorReading) -> Result<u64> {
        let json = serde_json::to_string(reading)?;

        let write_txn = db.begin_write()?;
        let seq = {
            let mut readings = write_txn.open_table(READINGS_TABLE)?;
            let seq = readings.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
            readings.insert(seq, json.as_str())?;

            let mut latest = write_txn.open_table(LATEST_TABLE)?;
            latest.insert(reading.device.as_str(), seq)?;
            seq
        };
        commit(write_txn, gate)?;
        Ok(seq)
    }

    fn read_latest(db: &Database, device: Option<&str>) -> Result<Option<SensorReading>> {
        let read_txn = db.begin_read()?;
        let readings = read_txn.open_table(READINGS_TABLE)?;

        let json = match device {
            None => readings.last()?.map(|(_, v)| v.value().to_string()),
            Some(device) => {
                let latest = read_txn.open_table(LATEST_TABLE)?;
                let seq = match latest.get(device)? {
                    Some(seq) => seq.value(),
                    None => return Ok(None),
                };
                readings.get(seq)?.map(|v| v.value().to_string())
            }
        };

        json.map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    /// Insert a command unless its key is already stored.
    fn insert_command(db: &Database, gate: &CommitGate, command: &Command) -> Result<()> {
        let json = serde_json::to_string(command)?;
        let key = command_key(command);

        let write_txn = db.begin_write()?;
        {
            let mut commands = write_txn.open_table(COMMANDS_TABLE)?;
            let exists = commands.get(key.as_str())?.is_some();
            if !exists {
                commands.insert(key.as_str(), json.as_str())?;
            }
        }
        commit(write_txn, gate)
    }

    fn insert_delivery(
        db: &Database,
        gate: &CommitGate,
        command_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let id = command_id.to_string();
        let ts = iso8601::format(&at);

        let write_txn = db.begin_write()?;
        {
            let mut deliveries = write_txn.open_table(DELIVERIES_TABLE)?;
            // First confirmation wins
            let exists = deliveries.get(id.as_str())?.is_some();
            if !exists {
                deliveries.insert(id.as_str(), ts.as_str())?;
            }
        }
        commit(write_txn, gate)
    }

    fn scan_commands(
        db: &Database,
        since: Option<DateTime<Utc>>,
        device: Option<&str>,
    ) -> Result<Vec<StoredCommand>> {
        let read_txn = db.begin_read()?;
        let commands = read_txn.open_table(COMMANDS_TABLE)?;
        let deliveries = read_txn.open_table(DELIVERIES_TABLE)?;

        let start = since.map(|ts| time_prefix(&ts)).unwrap_or_default();
        let mut out = Vec::new();
        for entry in commands.range(start.as_str()..)? {
            let (_, value) = entry?;
            let command: Command = serde_json::from_str(value.value())?;
            if device.is_some_and(|d| d != command.device) {
                continue;
            }
            let delivered_at = match deliveries.get(command.id.to_string().as_str())? {
                Some(ts) => Some(
                    iso8601::parse(ts.value())
                        .map_err(|e| Error::Serialization(e.to_string()))?,
                ),
                None => None,
            };
            out.push(StoredCommand {
                command,
                delivered_at,
            });
        }
        Ok(out)
    }
}

impl Drop for RedbStore {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[async_trait]
impl PersistenceGateway for RedbStore {
    async fn append_reading(&self, reading: &SensorReading) -> std::result::Result<(), StoreError> {
        let reading = reading.clone();
        let seq = self
            .run(move |db, gate| Self::insert_reading(db, gate, &reading))
            .await?;
        tracing::trace!(seq, "reading appended");
        Ok(())
    }

    async fn append_command(&self, command: &Command) -> std::result::Result<(), StoreError> {
        let command = command.clone();
        self.run(move |db, gate| Self::insert_command(db, gate, &command))
            .await
    }

    async fn latest_reading(
        &self,
        device: Option<&str>,
    ) -> std::result::Result<Option<SensorReading>, StoreError> {
        let device = device.map(str::to_string);
        self.run(move |db, _| Self::read_latest(db, device.as_deref()))
            .await
    }

    async fn confirm_delivery(
        &self,
        command_id: Uuid,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        self.run(move |db, gate| Self::insert_delivery(db, gate, command_id, at))
            .await
    }

    async fn unconfirmed_commands(
        &self,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<Command>, StoreError> {
        let stored = self
            .run(move |db, _| Self::scan_commands(db, Some(since), None))
            .await?;
        Ok(stored
            .into_iter()
            .filter(|c| !c.is_delivered() && c.command.timestamp >= since)
            .map(|c| c.command)
            .collect())
    }

    async fn list_commands(
        &self,
        device: Option<&str>,
    ) -> std::result::Result<Vec<StoredCommand>, StoreError> {
        let device = device.map(str::to_string);
        self.run(move |db, _| Self::scan_commands(db, None, device.as_deref()))
            .await
    }
}
