//! Field device simulator.
//!
//! A [`FieldDevice`] is an independent MQTT client standing in for sensors
//! and actuators: it publishes readings and records every command it
//! receives on the command topic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::TestBroker;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FieldDevice {
    client: AsyncClient,
    commands: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FieldDevice {
    /// Connect to `broker` and subscribe to `command_topic`. Returns once
    /// the subscription is acknowledged.
    pub async fn connect(broker: &TestBroker, command_topic: &str) -> Result<Self> {
        let client_id = format!("field-device-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, broker.host(), broker.port());
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (subscribed_tx, mut subscribed) = watch::channel(false);

        let task = tokio::spawn({
            let commands = Arc::clone(&commands);
            async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            subscribed_tx.send_replace(true);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            match serde_json::from_slice(&publish.payload) {
                                Ok(command) => commands.lock().push(command),
                                Err(e) => tracing::warn!(error = %e, "device got non-JSON command"),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "field device connection error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });

        client.subscribe(command_topic, QoS::AtLeastOnce).await?;
        let acked = tokio::time::timeout(SUBSCRIBE_TIMEOUT, subscribed.wait_for(|s| *s)).await;
        if !matches!(acked, Ok(Ok(_))) {
            task.abort();
            bail!("field device was not subscribed to {}", command_topic);
        }

        Ok(Self {
            client,
            commands,
            task,
        })
    }

    /// Publish one reading at QoS 1.
    pub async fn publish_reading(&self, topic: &str, reading: &Value) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, serde_json::to_vec(reading)?)
            .await?;
        Ok(())
    }

    /// Commands received so far, oldest first.
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl Drop for FieldDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}
