//! Bounded hand-off between the broker event loop and the ingestion workers.
//!
//! The broker loop must never block on storage, so [`IngestQueue::offer`] is
//! synchronous and always returns immediately. When the queue is full the
//! configured [`OverflowPolicy`] decides which message is lost, and every loss
//! is counted in [`IngestStats::dropped`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use fieldlink_core::OverflowPolicy;

/// Log every n-th drop so a flood does not flood the log as well.
const DROP_LOG_EVERY: u64 = 100;

/// A raw message received on the sensor topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Stamped by the broker loop on receipt
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: fieldlink_core::model::now(),
        }
    }
}

/// Counters for the ingestion path.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected_after_close: AtomicU64,
    pub persisted: AtomicU64,
    pub malformed: AtomicU64,
    pub schema_violations: AtomicU64,
    pub store_failures: AtomicU64,
    pub store_retries: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub rejected_after_close: u64,
    pub persisted: u64,
    pub malformed: u64,
    pub schema_violations: u64,
    pub store_failures: u64,
    pub store_retries: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected_after_close: self.rejected_after_close.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            schema_violations: self.schema_violations.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// What happened to an offered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting the oldest message.
    EvictedOldest,
    /// Not queued: the queue was full.
    Rejected,
    /// Not queued: the queue is closed.
    Closed,
}

struct QueueState {
    items: VecDeque<InboundMessage>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    stats: Arc<IngestStats>,
}

/// Bounded multi-producer, multi-consumer queue. Cloning shares the queue.
#[derive(Clone)]
pub struct IngestQueue {
    shared: Arc<Shared>,
}

impl IngestQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_stats(capacity, policy, Arc::new(IngestStats::default()))
    }

    /// Create a queue that records into existing counters.
    pub fn with_stats(capacity: usize, policy: OverflowPolicy, stats: Arc<IngestStats>) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(capacity.min(4096)),
                    closed: false,
                }),
                notify: Notify::new(),
                capacity,
                policy,
                stats,
            }),
        }
    }

    /// Enqueue a message without blocking.
    pub fn offer(&self, message: InboundMessage) -> OfferOutcome {
        let stats = &self.shared.stats;
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.closed {
                IngestStats::incr(&stats.rejected_after_close);
                return OfferOutcome::Closed;
            }
            IngestStats::incr(&stats.received);

            if state.items.len() < self.shared.capacity {
                state.items.push_back(message);
                OfferOutcome::Queued
            } else {
                match self.shared.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(message);
                        OfferOutcome::EvictedOldest
                    }
                    OverflowPolicy::DropNewest => OfferOutcome::Rejected,
                }
            }
        };

        match outcome {
            OfferOutcome::Queued => self.shared.notify.notify_one(),
            OfferOutcome::EvictedOldest | OfferOutcome::Rejected => {
                let dropped = IngestStats::incr(&stats.dropped);
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    tracing::warn!(
                        dropped,
                        capacity = self.shared.capacity,
                        policy = ?self.shared.policy,
                        "ingest queue full, dropping sensor messages"
                    );
                }
                if outcome == OfferOutcome::EvictedOldest {
                    self.shared.notify.notify_one();
                }
            }
            OfferOutcome::Closed => {}
        }
        outcome
    }

    /// Wait for the next message. Returns `None` once the queue is closed
    /// and fully drained.
    pub async fn recv(&self) -> Option<InboundMessage> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take a message if one is queued.
    pub fn try_recv(&self) -> Option<InboundMessage> {
        self.shared.state.lock().items.pop_front()
    }

    /// Stop accepting messages. Queued messages remain receivable.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Discard everything still queued, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        let n = state.items.len();
        state.items.clear();
        n
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.shared.stats
    }
}
