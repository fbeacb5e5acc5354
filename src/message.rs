//! Message protocol definitions
//!
//! JSON envelope protocol using Serde's adjacently tagged enums:
//! `{"type": "<snake_case>", "payload": {...}}`. Unit messages carry no payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ComponentId, ConnectionId, Params};

/// Kind of a key-level state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Value stored or replaced
    #[default]
    Update,
    /// Key removed
    Delete,
    /// Computed entry (re)registered
    Compute,
}

/// A single key-level state delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub component_id: ComponentId,
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub kind: UpdateKind,
}

impl StateUpdate {
    pub fn update(component_id: ComponentId, key: impl Into<String>, value: Value) -> Self {
        Self {
            component_id,
            key: key.into(),
            value,
            kind: UpdateKind::Update,
        }
    }

    pub fn delete(component_id: ComponentId, key: impl Into<String>) -> Self {
        Self {
            component_id,
            key: key.into(),
            value: Value::Null,
            kind: UpdateKind::Delete,
        }
    }
}

/// Request to run a named action on a component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub component_id: ComponentId,
    pub action: String,
    #[serde(default)]
    pub params: Params,
}

/// Client → Server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Client-side state change to apply and fan out
    StateUpdate(StateUpdate),
    /// Run a component action
    Action(ActionMessage),
    /// Resend the full state to this connection only
    StateRefreshRequest,
    /// Reply to a server heartbeat
    HeartbeatAck { client_time: u64, server_time: u64 },
    /// Application-defined event
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
}

impl ClientMessage {
    /// Wire tag of this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StateUpdate(_) => "state_update",
            ClientMessage::Action(_) => "action",
            ClientMessage::StateRefreshRequest => "state_refresh_request",
            ClientMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ClientMessage::Event { .. } => "event",
        }
    }
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted, ID issued
    Connected { connection_id: ConnectionId },
    /// State delta
    StateUpdate(StateUpdate),
    /// Liveness check, answered with `heartbeat_ack`
    Heartbeat { timestamp: u64 },
}

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
