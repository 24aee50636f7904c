//! In-process MQTT broker for tests.
//!
//! Each [`TestBroker`] runs its own rumqttd instance on a free local port,
//! so tests never share subscriptions. Setting `FIELDLINK_TEST_BROKER` to
//! `host:port` points every test at an external broker instead.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use uuid::Uuid;

/// External broker override, `host:port`.
pub const TEST_BROKER_ENV: &str = "FIELDLINK_TEST_BROKER";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker reachable from the test process.
#[derive(Debug, Clone)]
pub struct TestBroker {
    host: String,
    port: u16,
    /// Unique per broker so tests on a shared external broker stay apart
    namespace: String,
}

impl TestBroker {
    /// Use `FIELDLINK_TEST_BROKER` if set, otherwise start an embedded broker.
    pub fn start() -> Result<Self> {
        let namespace = format!("fieldlink-test/{}", Uuid::new_v4().simple());
        if let Ok(addr) = std::env::var(TEST_BROKER_ENV) {
            let (host, port) = addr
                .rsplit_once(':')
                .with_context(|| format!("{} must be host:port", TEST_BROKER_ENV))?;
            return Ok(Self {
                host: host.to_string(),
                port: port.parse().context("invalid broker port")?,
                namespace,
            });
        }

        let port = free_port()?;
        let listen: SocketAddr = ([127, 0, 0, 1], port).into();
        std::thread::Builder::new()
            .name(format!("test-broker-{}", port))
            .spawn(move || {
                let mut broker = rumqttd::Broker::new(embedded_config(listen));
                // Blocks for the life of the process
                if let Err(e) = broker.start() {
                    tracing::error!(error = %e, "embedded test broker stopped");
                }
            })?;

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while TcpStream::connect(listen).is_err() {
            if Instant::now() >= deadline {
                bail!("embedded broker did not start on {}", listen);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        tracing::debug!(%listen, "embedded test broker started");

        Ok(Self {
            host: "127.0.0.1".to_string(),
            port,
            namespace,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A topic private to this broker handle.
    pub fn topic(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn embedded_config(listen: SocketAddr) -> rumqttd::Config {
    let mut v4 = HashMap::new();
    v4.insert(
        "test".to_string(),
        rumqttd::ServerSettings {
            name: "fieldlink-test-broker".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: rumqttd::ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 1024 * 1024,
                max_inflight_count: 100,
                auth: None,
                external_auth: None,
                dynamic_filters: true,
            },
        },
    );

    rumqttd::Config {
        id: 0,
        router: rumqttd::RouterConfig {
            max_connections: 100,
            max_outgoing_packet_count: 200,
            max_segment_size: 1024 * 1024,
            max_segment_count: 10,
            custom_segment: None,
            initialized_filters: None,
            ..Default::default()
        },
        v4: Some(v4),
        v5: None,
        ws: None,
        cluster: None,
        console: None,
        bridge: None,
        prometheus: None,
        metrics: None,
    }
}
