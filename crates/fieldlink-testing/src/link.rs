//! A TCP hop between a client and the broker.
//!
//! Cutting the link drops every live connection the way a broker restart
//! does, while the broker itself keeps running and new connections are
//! accepted straight away.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};

pub struct BrokerLink {
    port: u16,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
    accept: JoinHandle<()>,
}

impl BrokerLink {
    /// Listen on a free local port and forward to `upstream` (`host:port`).
    pub async fn start(upstream: impl Into<String>) -> Result<Self> {
        let upstream = upstream.into();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept = tokio::spawn({
            let connections = Arc::clone(&connections);
            async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    let upstream = upstream.clone();
                    let forward = tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(upstream.as_str()).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    });
                    connections.lock().push(forward.abort_handle());
                }
            }
        });

        Ok(Self {
            port,
            connections,
            accept,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drop every live connection. Returns how many were cut.
    pub fn cut(&self) -> usize {
        let live = std::mem::take(&mut *self.connections.lock());
        for connection in &live {
            connection.abort();
        }
        tracing::debug!(cut = live.len(), "broker link cut");
        live.len()
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        self.accept.abort();
        self.cut();
    }
}
