use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use trove_core::Username;

/// Change-notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    AccessesChanged,
    StreamsChanged,
    EventsChanged,
    FollowedSlicesChanged,
    ServerReady,
    /// User-scoped cache invalidation, forwarded across processes.
    CacheInvalidate,
}

/// One notification on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: Topic,
    /// Absent for process-wide topics such as `server-ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Username>,
}

impl Notification {
    #[must_use]
    pub fn for_user(topic: Topic, username: &Username) -> Self {
        Self {
            topic,
            username: Some(username.clone()),
        }
    }

    #[must_use]
    pub fn server_ready() -> Self {
        Self {
            topic: Topic::ServerReady,
            username: None,
        }
    }
}

/// Optional out-of-process delivery for notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn forward(&self, notification: &Notification) -> Result<(), String>;
}

/// Single-producer, multi-consumer notification bus.
///
/// In-process consumers subscribe to a broadcast channel (at-most-once,
/// per-topic FIFO for one producer; consumers must be idempotent). When a
/// transport is configured, every notification is additionally forwarded
/// out-of-process, best-effort.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Notification>,
    transport: Option<Arc<dyn Transport>>,
}

impl Bus {
    #[must_use]
    pub fn new(capacity: usize, transport: Option<Arc<dyn Transport>>) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, transport }
    }

    /// Publish a notification. Never fails: lagging in-process consumers
    /// drop messages, transport failures are logged and swallowed.
    pub fn publish(&self, notification: Notification) {
        debug!(topic = ?notification.topic, user = ?notification.username, "bus publish");
        let _ = self.tx.send(notification.clone());
        if let Some(transport) = self.transport.clone() {
            tokio::spawn(async move {
                if let Err(e) = transport.forward(&notification).await {
                    warn!(error = %e, "notification transport forward failed");
                }
            });
        }
    }

    /// Subscribe to all notifications from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256, None)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// TCP pub/sub transport: binds a port and fans every notification out to
/// all connected subscribers as newline-delimited JSON. Broken peers are
/// dropped on the next send.
pub struct TcpFanout {
    peers: parking_lot::Mutex<Vec<TcpStream>>,
}

impl TcpFanout {
    /// Bind the pub socket and start accepting subscribers.
    pub async fn bind(host: &str, port: u16) -> std::io::Result<Arc<Self>> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let fanout = Arc::new(Self {
            peers: parking_lot::Mutex::new(Vec::new()),
        });
        let accept = fanout.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "messaging subscriber connected");
                        accept.peers.lock().push(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "messaging accept failed");
                        break;
                    }
                }
            }
        });
        Ok(fanout)
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl Transport for TcpFanout {
    async fn forward(&self, notification: &Notification) -> Result<(), String> {
        let mut line = serde_json::to_vec(notification).map_err(|e| e.to_string())?;
        line.push(b'\n');

        let mut peers = {
            let mut guard = self.peers.lock();
            std::mem::take(&mut *guard)
        };
        let mut alive = Vec::with_capacity(peers.len());
        for mut peer in peers.drain(..) {
            match peer.write_all(&line).await {
                Ok(()) => alive.push(peer),
                Err(e) => debug!(error = %e, "dropping broken messaging subscriber"),
            }
        }
        self.peers.lock().append(&mut alive);
        Ok(())
    }
}

/// Test transport collecting forwarded notifications in memory.
#[derive(Debug, Default)]
pub struct TestTransport {
    pub seen: parking_lot::Mutex<Vec<Notification>>,
}

#[async_trait]
impl Transport for TestTransport {
    async fn forward(&self, notification: &Notification) -> Result<(), String> {
        self.seen.lock().push(notification.clone());
        Ok(())
    }
}
