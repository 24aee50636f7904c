//! Command relay: validate, persist, then publish operator commands.
//!
//! A command is written to the store before it is published, and its
//! delivery is confirmed with a separate append once the broker has
//! acknowledged it. A command that was stored but never confirmed is picked
//! up again by [`CommandRelay::redeliver_unconfirmed`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fieldlink_core::model::now;
use fieldlink_core::{
    Command, CommandError, DeliveryOutcome, PublishError, RelaySettings, SharedGateway, StoreError,
};

use crate::transport::CommandPublisher;

/// Longest accepted command verb.
pub const MAX_COMMAND_LEN: usize = 64;

/// Longest accepted device identifier.
pub const MAX_DEVICE_LEN: usize = 128;

/// Result of a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub command: Command,
    pub outcome: DeliveryOutcome,
}

/// Result of one redelivery sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedeliveryReport {
    /// Unconfirmed commands found in the window
    pub examined: usize,
    pub redelivered: usize,
    pub failed: usize,
    /// Already being delivered by another task
    pub skipped: usize,
}

/// Which command verbs are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandVocabulary {
    /// Any well-formed verb.
    #[default]
    Open,
    /// Only these verbs, compared case-insensitively.
    Restricted(HashSet<String>),
}

impl CommandVocabulary {
    pub fn restricted<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Restricted(
            verbs
                .into_iter()
                .map(|v| v.as_ref().trim().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn allows(&self, verb: &str) -> bool {
        match self {
            CommandVocabulary::Open => true,
            CommandVocabulary::Restricted(verbs) => verbs.contains(&verb.to_ascii_lowercase()),
        }
    }
}

impl From<&RelaySettings> for CommandVocabulary {
    fn from(settings: &RelaySettings) -> Self {
        match &settings.allowed_commands {
            Some(verbs) => Self::restricted(verbs),
            None => Self::Open,
        }
    }
}

/// Validate and normalize a command request. Returns trimmed
/// `(device, command)`.
pub fn validate_command(
    device: &str,
    command: &str,
    vocabulary: &CommandVocabulary,
) -> Result<(String, String), CommandError> {
    let device = device.trim();
    let command = command.trim();

    if device.is_empty() {
        return Err(CommandError::InvalidCommand("device is required".to_string()));
    }
    if command.is_empty() {
        return Err(CommandError::InvalidCommand("command is required".to_string()));
    }
    if device.chars().count() > MAX_DEVICE_LEN {
        return Err(CommandError::InvalidCommand(format!(
            "device must be at most {} characters",
            MAX_DEVICE_LEN
        )));
    }
    if device
        .chars()
        .any(|c| c == '+' || c == '#' || c.is_control())
    {
        return Err(CommandError::InvalidCommand(
            "device contains reserved characters".to_string(),
        ));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(CommandError::InvalidCommand(format!(
            "command must be at most {} characters",
            MAX_COMMAND_LEN
        )));
    }
    if !command
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CommandError::InvalidCommand(
            "command may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    if !vocabulary.allows(command) {
        return Err(CommandError::InvalidCommand(format!(
            "command '{}' is not allowed",
            command
        )));
    }

    Ok((device.to_string(), command.to_string()))
}

/// Marks a command id as being delivered; cleared on drop.
struct InFlight<'a> {
    map: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl<'a> InFlight<'a> {
    fn acquire(map: &'a DashMap<Uuid, ()>, id: Uuid) -> Option<Self> {
        match map.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { map, id })
            }
        }
    }

    /// Mark a command this task just created. Its id cannot be held yet.
    fn claim(map: &'a DashMap<Uuid, ()>, id: Uuid) -> Self {
        map.insert(id, ());
        Self { map, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

/// Relays operator commands to field devices.
pub struct CommandRelay {
    gateway: SharedGateway,
    publisher: Arc<dyn CommandPublisher>,
    command_topic: String,
    vocabulary: CommandVocabulary,
    in_flight: DashMap<Uuid, ()>,
}

impl CommandRelay {
    pub fn new(
        gateway: SharedGateway,
        publisher: Arc<dyn CommandPublisher>,
        command_topic: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            publisher,
            command_topic: command_topic.into(),
            vocabulary: CommandVocabulary::Open,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: CommandVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Number of commands currently being published.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Validate, persist and publish one command.
    ///
    /// Validation failures are returned as errors with nothing written.
    /// Everything after validation is reported through the receipt's
    /// [`DeliveryOutcome`]: a failed store means nothing was published, a
    /// failed publish leaves the stored command for redelivery.
    pub async fn submit(&self, device: &str, command: &str) -> Result<SubmitReceipt, CommandError> {
        let (device, verb) = validate_command(device, command, &self.vocabulary)?;
        let command = Command::new(device, verb);

        // Held from before the store write until delivery settles, so a sweep
        // cannot publish the command in between
        let guard = InFlight::claim(&self.in_flight, command.id);

        if let Err(e) = self.gateway.append_command(&command).await {
            tracing::error!(
                device = %command.device,
                command = %command.command,
                error = %e,
                "failed to store command, not publishing"
            );
            return Ok(SubmitReceipt {
                command,
                outcome: DeliveryOutcome::Failed(e),
            });
        }

        let outcome = match self.deliver(&command).await {
            Ok(()) => DeliveryOutcome::Published,
            Err(e) => {
                tracing::warn!(
                    device = %command.device,
                    command = %command.command,
                    error = %e,
                    "command stored but not delivered"
                );
                DeliveryOutcome::PersistedOnly(e)
            }
        };
        drop(guard);

        tracing::info!(
            device = %command.device,
            command = %command.command,
            outcome = %outcome,
            "command submitted"
        );
        Ok(SubmitReceipt { command, outcome })
    }

    /// Publish a stored command and record the broker acknowledgement.
    async fn deliver(&self, command: &Command) -> Result<(), PublishError> {
        let payload = command
            .wire_payload()
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        self.publisher.publish(&self.command_topic, payload).await?;

        // A lost confirmation only means the sweeper may publish it again
        if let Err(e) = self.gateway.confirm_delivery(command.id, now()).await {
            tracing::warn!(command_id = %command.id, error = %e, "failed to record delivery");
        }
        Ok(())
    }

    /// Publish every unconfirmed command issued at or after `since`.
    pub async fn redeliver_unconfirmed(
        &self,
        since: DateTime<Utc>,
    ) -> Result<RedeliveryReport, StoreError> {
        let pending = self.gateway.unconfirmed_commands(since).await?;
        let mut report = RedeliveryReport {
            examined: pending.len(),
            ..Default::default()
        };

        for command in &pending {
            let Some(_guard) = InFlight::acquire(&self.in_flight, command.id) else {
                report.skipped += 1;
                continue;
            };
            match self.deliver(command).await {
                Ok(()) => {
                    report.redelivered += 1;
                    tracing::info!(
                        command_id = %command.id,
                        device = %command.device,
                        "command redelivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!(command_id = %command.id, error = %e, "redelivery failed");
                    if e == PublishError::NotConnected {
                        // The rest would fail the same way
                        let processed = report.redelivered + report.failed + report.skipped;
                        report.failed += pending.len() - processed;
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Periodically redeliver commands from the last `window` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        window: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !self.publisher.state().is_connected() {
                    continue;
                }
                let since = now()
                    - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
                match self.redeliver_unconfirmed(since).await {
                    Ok(report) if report.examined > 0 => {
                        tracing::info!(
                            examined = report.examined,
                            redelivered = report.redelivered,
                            failed = report.failed,
                            skipped = report.skipped,
                            "redelivery sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "redelivery sweep failed"),
                }
            }
            tracing::debug!("redelivery sweeper stopped");
        })
    }
}
