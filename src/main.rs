//! State Sync Server - Entry Point
//!
//! Starts the hub actor, the heartbeat and the TCP listener, registers a demo
//! counter component and accepts WebSocket connections.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use statesync::{
    spawn_heartbeat, AppError, Component, Config, Hub, Params, PlaceholderEngine, Props,
    StateManager, StateStore,
};

const COUNTER_TEMPLATE: &str = r#"<h1>{{ props.title }}</h1>
<p>Count: {{ bind count }} (doubled: {{ bind doubled }})</p>
<button {{ action increment }}>+</button>
<button {{ action reset }}>reset</button>"#;

fn counter() -> Result<Component, AppError> {
    Component::builder("counter")
        .id("counter")
        .template(COUNTER_TEMPLATE)
        .state("count", 0)
        .computed("doubled", |state| {
            let count = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
            (count * 2).into()
        })
        .action_fn("increment", |state: Arc<StateStore>, params: Params| async move {
            let by = match params.get("by") {
                None => 1,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| AppError::Action(format!("'by' must be an integer, got {}", v)))?,
            };
            let count = state.get("count").await.and_then(|v| v.as_i64()).unwrap_or(0);
            state.set("count", count + by).await
        })
        .action_fn("reset", |state: Arc<StateStore>, _: Params| async move {
            state.set("count", 0).await
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=statesync=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statesync=info")),
        )
        .init();

    let config = Config::from_env();

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("State sync server listening on {}", config.addr);

    // Start the hub actor and its heartbeat
    let (hub, handle) = Hub::new(config.hub.clone());
    tokio::spawn(hub.run());
    spawn_heartbeat(handle.clone(), config.hub.heartbeat_interval);

    info!("Hub actor started");

    let manager = StateManager::new(handle, Arc::new(PlaceholderEngine));
    let component = manager.register(counter()?)?;

    let mut props = Props::new();
    props.insert("title".to_string(), "Counter".into());
    let markup = manager.render_component(component.id(), &props).await?;
    info!("Registered {}:\n{}", component.id(), markup);

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let manager = manager.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = manager.accept_tcp(stream).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
