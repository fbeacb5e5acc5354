//! Error types for the sync engine
//!
//! Defines application-level errors and delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::{ComponentId, ConnectionId};

/// Application-level errors
///
/// Errors from direct API calls (register, remove, render, set) are returned
/// to the caller. Errors caused by client traffic are logged and dropped by
/// the state manager.
#[derive(Debug, Error)]
pub enum AppError {
    /// A component with this ID is already registered
    #[error("Duplicate component ID: {0}")]
    DuplicateId(ComponentId),

    /// No component registered under this ID
    #[error("Component not found: {0}")]
    ComponentNotFound(ComponentId),

    /// Component exists but has no such action
    #[error("Action '{action}' not found on component {component}")]
    ActionNotFound {
        component: ComponentId,
        action: String,
    },

    /// Template binds an action the component does not declare
    #[error("Template of component {component} references undeclared action '{action}'")]
    UnknownAction {
        component: ComponentId,
        action: String,
    },

    /// Action declaration rejected by the component builder
    #[error("Invalid action declaration: {0}")]
    InvalidAction(String),

    /// Malformed wire message
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Template compile or execute failure
    #[error("Template error in '{template}': {message}")]
    Template { template: String, message: String },

    /// Lifecycle hook returned an error
    #[error("{hook} hook failed for component {component}: {message}")]
    Lifecycle {
        hook: &'static str,
        component: ComponentId,
        message: String,
    },

    /// Action handler returned an error
    #[error("Action failed: {0}")]
    Action(String),

    /// Marshal or write failure on the broadcast path
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Build a template error
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Build a lifecycle error for the given hook
    pub fn lifecycle(
        hook: &'static str,
        component: &ComponentId,
        message: impl std::fmt::Display,
    ) -> Self {
        AppError::Lifecycle {
            hook,
            component: component.clone(),
            message: message.to_string(),
        }
    }
}

/// Delivery errors
///
/// Occurs when a message cannot be serialized or pushed towards a connection.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message could not be serialized
    #[error("Failed to serialize message: {0}")]
    Marshal(#[from] serde_json::Error),

    /// The hub actor is no longer running
    #[error("Hub closed")]
    HubClosed,

    /// The receiving end of the connection channel has been closed
    #[error("Connection {0} closed")]
    ConnectionClosed(ConnectionId),

    /// The connection's outbound queue is full
    #[error("Connection {0} outbound queue full")]
    QueueFull(ConnectionId),
}
