//! Reactive Component State Synchronization Library
//!
//! Server-held component state kept in sync with every connected client
//! over WebSockets, built with tokio-tungstenite using the Actor pattern for
//! the connection set.
//!
//! # Features
//! - Components with reactive state, computed entries and watchers
//! - Typed actions checked against the template at registration
//! - Rendering through a pluggable template engine
//! - Fan-out of every state change to all connections, in order per store
//! - Targeted full-state refresh for (re)connecting clients
//! - Heartbeats with eviction of unresponsive connections
//! - A sans-IO client reconciler with reconnect, queueing and deferred replay
//!
//! # Architecture
//! - `Hub` is the actor owning all live connections
//! - Each connection has read and write tasks; reads dispatch to a
//!   `MessageHandler` on the connection's own task
//! - `StateManager` wires the `Registry` to the hub and handles client traffic
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use statesync::{Component, Hub, HubConfig, PlaceholderEngine, StateManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), statesync::AppError> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let (hub, handle) = Hub::new(HubConfig::default());
//!     tokio::spawn(hub.run());
//!
//!     let manager = StateManager::new(handle, Arc::new(PlaceholderEngine));
//!     manager.register(Component::builder("counter").state("count", 0).build()?)?;
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let manager = manager.clone();
//!         tokio::spawn(async move { manager.accept_tcp(stream).await });
//!     }
//!     Ok(())
//! }
//! ```

pub mod component;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod template;
pub mod types;

// Re-export main types for convenience
pub use component::{Action, Component, ComponentBuilder, FnAction};
pub use config::{Config, HubConfig};
pub use connection::{Connection, Frame};
pub use error::{AppError, DeliveryError};
pub use handler::{accept_tcp, serve_socket, MessageHandler};
pub use hub::{spawn_heartbeat, Hub, HubCommand, HubHandle};
pub use manager::{HubBroadcaster, StateManager};
pub use message::{ActionMessage, ClientMessage, ServerMessage, StateUpdate, UpdateKind};
pub use reconciler::{
    ConnectionState, DomAdapter, MemoryDom, Reconciler, ReconcilerEvent, ReconnectConfig,
    Transport,
};
pub use registry::Registry;
pub use store::{Broadcaster, StateStore};
pub use template::{CompiledTemplate, PlaceholderEngine, RenderContext, TemplateEngine};
pub use types::{ComponentId, ConnectionId, Params, Props, StateMap};
