//! Connection Hub actor
//!
//! The hub owns the set of live connections. Every access goes through a
//! [`HubHandle`], which turns calls into [`HubCommand`]s processed one at a
//! time by [`Hub::run`]. No locks: the actor loop is the only owner.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::connection::{Connection, Frame};
use crate::error::{AppError, DeliveryError};
use crate::message::{unix_millis, ServerMessage};
use crate::types::ConnectionId;

/// Commands sent from handles to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// New connection upgraded
    Accept {
        connection_id: ConnectionId,
        sender: mpsc::Sender<Frame>,
    },
    /// Connection ended or must be dropped
    Remove { connection_id: ConnectionId },
    /// Deliver a frame to every connection
    Broadcast { frame: Frame },
    /// Deliver a frame to one connection
    SendTo {
        connection_id: ConnectionId,
        frame: Frame,
    },
    /// Client answered a heartbeat
    HeartbeatAck { connection_id: ConnectionId },
    /// Evict stale connections and ping the rest
    Heartbeat,
    /// Outbound channel of one connection, for waiting senders
    Sender {
        connection_id: ConnectionId,
        reply: oneshot::Sender<Option<mpsc::Sender<Frame>>>,
    },
    /// Number of live connections
    Count { reply: oneshot::Sender<usize> },
    /// IDs of live connections
    Ids { reply: oneshot::Sender<Vec<ConnectionId>> },
}

/// Serialize a message once for fan-out
pub fn encode(message: &ServerMessage) -> Result<Frame, DeliveryError> {
    Ok(Frame::from(serde_json::to_string(message)?))
}

/// The Hub actor
pub struct Hub {
    /// All live connections: ConnectionId -> Connection
    connections: HashMap<ConnectionId, Connection>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub and the handle that feeds it
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (sender, receiver) = mpsc::channel(config.command_buffer);
        let handle = HubHandle {
            sender,
            connection_buffer: config.connection_buffer,
            refresh_timeout: config.refresh_timeout,
        };
        let hub = Self {
            connections: HashMap::new(),
            receiver,
            config,
        };
        (hub, handle)
    }

    /// Run the Hub event loop
    ///
    /// Processes commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("Hub shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Accept {
                connection_id,
                sender,
            } => self.handle_accept(connection_id, sender),
            HubCommand::Remove { connection_id } => self.handle_remove(connection_id),
            HubCommand::Broadcast { frame } => self.handle_broadcast(frame),
            HubCommand::SendTo {
                connection_id,
                frame,
            } => self.handle_send_to(connection_id, frame),
            HubCommand::HeartbeatAck { connection_id } => {
                if let Some(conn) = self.connections.get_mut(&connection_id) {
                    conn.record_ack();
                }
            }
            HubCommand::Heartbeat => self.handle_heartbeat(),
            HubCommand::Sender {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.connections.get(&connection_id).map(Connection::sender));
            }
            HubCommand::Count { reply } => {
                let _ = reply.send(self.connections.len());
            }
            HubCommand::Ids { reply } => {
                let _ = reply.send(self.connections.keys().copied().collect());
            }
        }
    }

    fn handle_accept(&mut self, connection_id: ConnectionId, sender: mpsc::Sender<Frame>) {
        let conn = Connection::new(connection_id, sender);

        match encode(&ServerMessage::Connected { connection_id }) {
            Ok(frame) => {
                if let Err(e) = conn.deliver(frame) {
                    warn!("Could not greet connection {}: {}", connection_id, e);
                    return;
                }
            }
            Err(e) => warn!("Failed to encode greeting: {}", e),
        }

        info!("Connection {} accepted", connection_id);
        self.connections.insert(connection_id, conn);
        debug!("Total connections: {}", self.connections.len());
    }

    fn handle_remove(&mut self, connection_id: ConnectionId) {
        // Dropping the connection drops its sender, which ends the write task
        // and closes the socket.
        if let Some(conn) = self.connections.remove(&connection_id) {
            info!(
                "Connection {} removed after {:?}",
                connection_id,
                conn.connected_at.elapsed()
            );
            debug!("Total connections: {}", self.connections.len());
        }
    }

    fn handle_broadcast(&mut self, frame: Frame) {
        let mut failed = Vec::new();
        for conn in self.connections.values() {
            if let Err(e) = conn.deliver(frame.clone()) {
                warn!("Broadcast to {} failed: {}", conn.id, e);
                failed.push(conn.id);
            }
        }
        for connection_id in failed {
            self.handle_remove(connection_id);
        }
    }

    fn handle_send_to(&mut self, connection_id: ConnectionId, frame: Frame) {
        let Some(conn) = self.connections.get(&connection_id) else {
            debug!("Send to unknown connection {} dropped", connection_id);
            return;
        };
        if let Err(e) = conn.deliver(frame) {
            warn!("Send to {} failed: {}", connection_id, e);
            self.handle_remove(connection_id);
        }
    }

    fn handle_heartbeat(&mut self) {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout;
        let stale: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.is_stale(timeout, now))
            .map(|conn| conn.id)
            .collect();

        for connection_id in stale {
            warn!("Connection {} missed heartbeats, evicting", connection_id);
            self.handle_remove(connection_id);
        }

        match encode(&ServerMessage::Heartbeat {
            timestamp: unix_millis(),
        }) {
            Ok(frame) => self.handle_broadcast(frame),
            Err(e) => warn!("Failed to encode heartbeat: {}", e),
        }
    }
}

/// Cloneable entry point to the Hub actor
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
    connection_buffer: usize,
    refresh_timeout: Duration,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| DeliveryError::HubClosed.into())
    }

    /// Capacity to use for a new connection's outbound channel
    pub fn connection_buffer(&self) -> usize {
        self.connection_buffer
    }

    /// How long a targeted refresh may wait for queue space
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout
    }

    /// Add a connection to the live set
    pub async fn accept(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Frame>,
    ) -> Result<(), AppError> {
        self.send(HubCommand::Accept {
            connection_id,
            sender,
        })
        .await
    }

    /// Drop a connection; idempotent
    pub async fn remove(&self, connection_id: ConnectionId) -> Result<(), AppError> {
        self.send(HubCommand::Remove { connection_id }).await
    }

    /// Serialize once and deliver to every connection
    ///
    /// Waits when the hub queue is full.
    pub async fn broadcast(&self, message: &ServerMessage) -> Result<(), AppError> {
        let frame = encode(message)?;
        self.send(HubCommand::Broadcast { frame }).await
    }

    /// Deliver to a single connection
    pub async fn send_to(
        &self,
        connection_id: ConnectionId,
        message: &ServerMessage,
    ) -> Result<(), AppError> {
        let frame = encode(message)?;
        self.send(HubCommand::SendTo {
            connection_id,
            frame,
        })
        .await
    }

    pub async fn heartbeat_ack(&self, connection_id: ConnectionId) -> Result<(), AppError> {
        self.send(HubCommand::HeartbeatAck { connection_id }).await
    }

    /// Evict stale connections, then broadcast a heartbeat
    pub async fn heartbeat(&self) -> Result<(), AppError> {
        self.send(HubCommand::Heartbeat).await
    }

    /// Outbound channel of a live connection
    ///
    /// Answered in command order: every broadcast queued before this call has
    /// already been handed to the connection.
    pub async fn connection_sender(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<mpsc::Sender<Frame>>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Sender {
            connection_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DeliveryError::HubClosed.into())
    }

    pub async fn connection_count(&self) -> Result<usize, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Count { reply }).await?;
        rx.await.map_err(|_| DeliveryError::HubClosed.into())
    }

    pub async fn connection_ids(&self) -> Result<Vec<ConnectionId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Ids { reply }).await?;
        rx.await.map_err(|_| DeliveryError::HubClosed.into())
    }
}

/// Spawn the heartbeat timer
///
/// Ends when the hub is gone.
pub fn spawn_heartbeat(handle: HubHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if handle.heartbeat().await.is_err() {
                debug!("Hub closed, stopping heartbeat");
                break;
            }
        }
    })
}
