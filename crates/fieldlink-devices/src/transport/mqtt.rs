//! MQTT transport built on rumqttc.
//!
//! One background task polls the rumqttc event loop. It keeps the session
//! alive across broker outages, re-subscribes to the sensor topic on every
//! CONNACK and routes inbound sensor messages into the [`IngestQueue`].
//!
//! Publish acknowledgements are correlated by order: rumqttc processes
//! requests FIFO and reports `Outgoing::Publish(pkid)` for each, so every
//! publish registers a waiter before its request is queued and the loop
//! binds the oldest unbound waiter to the next packet id it sees.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fieldlink_core::{
    ConnectionError, MqttSettings, PublishError, PublishResult, QosLevel,
};

use super::{
    topic_matches, CommandPublisher, ConnectionState, ConnectionSupervisor, SupervisorAction,
    TransportStats, TransportStatus,
};
use crate::queue::{InboundMessage, IngestQueue, OfferOutcome};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 64;

/// Max MQTT packet size in both directions.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// How long shutdown waits for DISCONNECT to go out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

type AckSender = oneshot::Sender<Result<(), PublishError>>;
type AckReceiver = oneshot::Receiver<Result<(), PublishError>>;

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn map_connection_error(broker: &str, e: &rumqttc::ConnectionError) -> ConnectionError {
    match e {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            ConnectionError::Refused(format!("{:?}", code))
        }
        rumqttc::ConnectionError::NetworkTimeout => ConnectionError::Timeout(broker.to_string()),
        other => ConnectionError::Unreachable {
            addr: broker.to_string(),
            reason: other.to_string(),
        },
    }
}

fn map_client_error(e: ClientError) -> PublishError {
    match e {
        ClientError::TryRequest(_) => PublishError::QueueFull,
        other => PublishError::Rejected(other.to_string()),
    }
}

/// Waiters for publish acknowledgements.
#[derive(Default)]
struct AckTracker {
    /// Whether a session is up and new publishes may register
    accepting: bool,
    /// Registered waiters whose packet id is not known yet, in request order
    unbound: VecDeque<AckSender>,
    /// Waiters keyed by packet id, awaiting PUBACK / PUBCOMP
    in_flight: HashMap<u16, AckSender>,
    /// Packet ids failed on session loss that rumqttc may retransmit
    abandoned: HashSet<u16>,
}

impl AckTracker {
    fn register(&mut self) -> Result<AckReceiver, PublishError> {
        if !self.accepting {
            return Err(PublishError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.unbound.push_back(tx);
        Ok(rx)
    }

    /// Undo the last `register` when its request never reached rumqttc.
    fn cancel_last(&mut self) {
        self.unbound.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        // Retransmission of a packet we already bound or gave up on
        if pkid != 0 && (self.in_flight.contains_key(&pkid) || self.abandoned.remove(&pkid)) {
            return;
        }
        let Some(waiter) = self.unbound.pop_front() else {
            return;
        };
        if pkid == 0 {
            // QoS 0: done once it is on the wire
            let _ = waiter.send(Ok(()));
        } else {
            self.in_flight.insert(pkid, waiter);
        }
    }

    fn acknowledge(&mut self, pkid: u16) {
        self.abandoned.remove(&pkid);
        if let Some(waiter) = self.in_flight.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn resume(&mut self) {
        self.accepting = true;
    }

    fn fail_all(&mut self, error: PublishError) {
        self.accepting = false;
        for waiter in self.unbound.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for (pkid, waiter) in self.in_flight.drain() {
            self.abandoned.insert(pkid);
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// Broker transport over MQTT 3.1.1.
pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
    broker: String,
    publish_timeout: Duration,
    state: watch::Receiver<ConnectionState>,
    acks: Arc<Mutex<AckTracker>>,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Start the session in the background without waiting for the broker.
    ///
    /// The transport keeps retrying with backoff until [`shutdown`] is
    /// called, so the service can come up while the broker is down.
    ///
    /// [`shutdown`]: MqttTransport::shutdown
    pub fn start(settings: &MqttSettings, inbound: IngestQueue) -> Self {
        Self::spawn(settings, inbound, None)
    }

    /// Establish a session, failing if the broker cannot be reached or
    /// refuses within the connect timeout.
    pub async fn connect(
        settings: &MqttSettings,
        inbound: IngestQueue,
    ) -> Result<Self, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        let transport = Self::spawn(settings, inbound, Some(tx));

        let error = match tokio::time::timeout(settings.connect_timeout(), rx).await {
            Ok(Ok(Ok(()))) => return Ok(transport),
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => ConnectionError::Shutdown,
            Err(_) => ConnectionError::Timeout(settings.broker_addr()),
        };
        transport.shutdown().await;
        Err(error)
    }

    fn spawn(
        settings: &MqttSettings,
        inbound: IngestQueue,
        first_outcome: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    ) -> Self {
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("fieldlink-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let mut options = MqttOptions::new(client_id.clone(), &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive());
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let (Some(u), Some(p)) = (&settings.username, &settings.password) {
            options.set_credentials(u, p);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let stats = Arc::new(TransportStats::default());
        let cancel = CancellationToken::new();
        let broker = settings.broker_addr();
        let qos = to_qos(settings.qos);

        tracing::info!(
            broker = %broker,
            client_id = %client_id,
            topic = %settings.sensor_topic,
            "starting MQTT transport"
        );

        let task = EventLoopTask {
            eventloop,
            client: client.clone(),
            broker: broker.clone(),
            sensor_topic: settings.sensor_topic.clone(),
            qos,
            inbound,
            supervisor: ConnectionSupervisor::new(settings.reconnect_policy()),
            state_tx,
            acks: Arc::clone(&acks),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
            first_outcome,
        };
        let handle = tokio::spawn(task.run());

        Self {
            client,
            qos,
            broker,
            publish_timeout: settings.publish_timeout(),
            state: state_rx,
            acks,
            stats,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Wait until the session reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn status(&self) -> TransportStatus {
        self.stats.status(*self.state.borrow())
    }

    /// Send DISCONNECT and stop the event loop.
    pub async fn shutdown(&self) {
        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        let connected = self.state.borrow().is_connected();
        if connected && self.client.try_disconnect().is_ok() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_ok() {
                return;
            }
            tracing::warn!(broker = %self.broker, "DISCONNECT not sent in time, closing anyway");
        }

        self.cancel.cancel();
        let _ = handle.await;
    }

    async fn publish_inner(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let connected = self.state.borrow().is_connected();
        if !connected {
            return Err(PublishError::NotConnected);
        }

        // Register and enqueue under one lock so waiter order equals request order
        let ack = {
            let mut acks = self.acks.lock();
            let ack = acks.register()?;
            if let Err(e) = self.client.try_publish(topic, self.qos, false, payload) {
                acks.cancel_last();
                return Err(map_client_error(e));
            }
            ack
        };

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::ConnectionLost),
            Err(_) => Err(PublishError::Timeout),
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishResult, PublishError> {
        match self.publish_inner(topic, payload).await {
            Ok(()) => {
                self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
                Ok(PublishResult::Acknowledged)
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the background polling task.
struct EventLoopTask {
    eventloop: EventLoop,
    client: AsyncClient,
    broker: String,
    sensor_topic: String,
    qos: QoS,
    inbound: IngestQueue,
    supervisor: ConnectionSupervisor,
    state_tx: watch::Sender<ConnectionState>,
    acks: Arc<Mutex<AckTracker>>,
    stats: Arc<TransportStats>,
    cancel: CancellationToken,
    first_outcome: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

impl EventLoopTask {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            let action = match event {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(event) => {
                    self.on_event(event);
                    continue;
                }
                Err(e) => self.on_error(&e),
            };

            match action {
                SupervisorAction::Backoff(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                SupervisorAction::Stop => break,
                SupervisorAction::Subscribe => {}
            }
        }

        self.supervisor.on_shutdown();
        self.acks.lock().fail_all(PublishError::ConnectionLost);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if let Some(tx) = self.first_outcome.take() {
            let _ = tx.send(Err(ConnectionError::Shutdown));
        }
        tracing::info!(broker = %self.broker, "MQTT transport stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => self.on_connected(),
            Event::Incoming(Packet::Publish(publish)) => {
                if !topic_matches(&self.sensor_topic, &publish.topic) {
                    tracing::debug!(topic = %publish.topic, "ignoring message on unexpected topic");
                    return;
                }
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    topic = %publish.topic,
                    bytes = publish.payload.len(),
                    "sensor message received"
                );
                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                if self.inbound.offer(message) == OfferOutcome::Closed {
                    tracing::debug!("ingest queue closed, sensor message discarded");
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    tracing::error!(
                        topic = %self.sensor_topic,
                        "broker rejected sensor subscription"
                    );
                } else {
                    self.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(topic = %self.sensor_topic, "subscription acknowledged");
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acks.lock().acknowledge(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.acks.lock().acknowledge(comp.pkid),
            Event::Outgoing(Outgoing::Publish(pkid)) => self.acks.lock().on_outgoing(pkid),
            _ => {}
        }
    }

    fn on_connected(&mut self) {
        if self.supervisor.on_connected() != SupervisorAction::Subscribe {
            return;
        }
        self.acks.lock().resume();
        self.state_tx.send_replace(ConnectionState::Connected);
        self.stats
            .reconnects
            .store(self.supervisor.reconnects(), Ordering::Relaxed);

        // Clean session: the broker forgot our subscription
        match self.client.try_subscribe(self.sensor_topic.as_str(), self.qos) {
            Ok(()) => tracing::info!(
                broker = %self.broker,
                topic = %self.sensor_topic,
                "connected to MQTT broker, subscribing"
            ),
            Err(e) => tracing::error!(
                topic = %self.sensor_topic,
                error = %e,
                "failed to queue subscription"
            ),
        }

        if let Some(tx) = self.first_outcome.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn on_error(&mut self, e: &rumqttc::ConnectionError) -> SupervisorAction {
        let error = map_connection_error(&self.broker, e);
        self.acks.lock().fail_all(PublishError::ConnectionLost);
        if let Some(tx) = self.first_outcome.take() {
            let _ = tx.send(Err(error.clone()));
        }

        let action = self.supervisor.on_error();
        self.state_tx.send_replace(self.supervisor.state());
        match action {
            SupervisorAction::Backoff(delay) => tracing::warn!(
                broker = %self.broker,
                attempt = self.supervisor.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "MQTT connection error, retrying"
            ),
            _ => tracing::error!(
                broker = %self.broker,
                error = %error,
                "MQTT connection error, giving up"
            ),
        }
        action
    }
}
