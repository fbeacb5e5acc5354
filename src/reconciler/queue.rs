//! Outbound queue used while the socket is down

use std::collections::VecDeque;

use crate::message::ClientMessage;

/// FIFO of messages waiting for a connection
///
/// Refresh requests are not stored in the FIFO: at most one is pending, and
/// it is sent after everything else on flush.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<ClientMessage>,
    refresh_pending: bool,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StateRefreshRequest => self.refresh_pending = true,
            other => self.messages.push_back(other),
        }
    }

    /// Put back a message that could not be sent
    pub fn push_front(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StateRefreshRequest => self.refresh_pending = true,
            other => self.messages.push_front(other),
        }
    }

    pub fn pop(&mut self) -> Option<ClientMessage> {
        self.messages.pop_front()
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    pub fn take_refresh(&mut self) -> bool {
        std::mem::take(&mut self.refresh_pending)
    }

    /// Queued messages, refresh excluded
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && !self.refresh_pending
    }
}
