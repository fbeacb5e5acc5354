//! Connection struct definition
//!
//! Represents an accepted socket as the hub sees it: its ID, the outbound
//! frame channel feeding its write task, and liveness bookkeeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::DeliveryError;
use crate::types::ConnectionId;

/// A serialized message, shared between every connection it is sent to
pub type Frame = Arc<str>;

/// Live client connection
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Hub → write task frame channel
    sender: mpsc::Sender<Frame>,
    /// Accept time
    pub connected_at: Instant,
    /// Last heartbeat ack (accept time until the first ack)
    pub last_ack: Instant,
}

impl Connection {
    /// Create a new connection with the given ID and sender channel
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            connected_at: now,
            last_ack: now,
        }
    }

    /// Queue a frame without waiting
    ///
    /// A full queue means the client is not keeping up; a closed one means
    /// its write task is gone.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull(self.id),
            TrySendError::Closed(_) => DeliveryError::ConnectionClosed(self.id),
        })
    }

    /// Handle for senders that wait for queue space
    pub fn sender(&self) -> mpsc::Sender<Frame> {
        self.sender.clone()
    }

    /// Record a heartbeat ack
    pub fn record_ack(&mut self) {
        self.last_ack = Instant::now();
    }

    /// Whether no ack arrived within `timeout` before `now`
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ack) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), tx);

        conn.deliver(Frame::from("one")).unwrap();
        assert!(matches!(
            conn.deliver(Frame::from("two")),
            Err(DeliveryError::QueueFull(_))
        ));
        assert_eq!(&*rx.recv().await.unwrap(), "one");

        drop(rx);
        assert!(matches!(
            conn.deliver(Frame::from("three")),
            Err(DeliveryError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_staleness() {
        let (tx, _rx) = mpsc::channel(1);
        let mut conn = Connection::new(ConnectionId::new(), tx);
        let later = Instant::now() + Duration::from_secs(10);

        assert!(conn.is_stale(Duration::from_secs(5), later));
        assert!(!conn.is_stale(Duration::from_secs(60), later));

        conn.record_ack();
        assert!(!conn.is_stale(Duration::from_secs(5), conn.last_ack));
    }
}
