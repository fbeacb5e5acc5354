//! State Manager
//!
//! Composition root: builds the registry on top of a broadcaster that feeds
//! the hub, and routes inbound client messages back into the registry.
//! Client-originated failures are logged and dropped; nothing is sent back.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use crate::component::Component;
use crate::error::{AppError, DeliveryError};
use crate::handler::{self, MessageHandler};
use crate::hub::{encode, HubHandle};
use crate::message::{ActionMessage, ServerMessage, StateUpdate, UpdateKind};
use crate::registry::Registry;
use crate::store::{Broadcaster, SnapshotSink};
use crate::template::TemplateEngine;
use crate::types::{ComponentId, ConnectionId, Props};

/// Handler for an application-defined client event
pub type EventHandler = Arc<dyn Fn(ConnectionId, Value) + Send + Sync>;

/// Broadcaster that fans state deltas out through the hub
pub struct HubBroadcaster {
    hub: HubHandle,
}

impl HubBroadcaster {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Broadcaster for HubBroadcaster {
    async fn broadcast_update(&self, update: StateUpdate) -> Result<(), AppError> {
        self.hub.broadcast(&ServerMessage::StateUpdate(update)).await
    }
}

/// Delivers a refresh to one connection
///
/// Frames go straight into the connection's queue, waiting for space up to
/// the hub's refresh timeout. A connection that stays full is evicted.
struct RefreshSink<'a> {
    hub: &'a HubHandle,
    connection_id: ConnectionId,
}

#[async_trait]
impl SnapshotSink for RefreshSink<'_> {
    async fn send_snapshot(&self, updates: Vec<StateUpdate>) -> Result<(), AppError> {
        let connection_id = self.connection_id;
        let Some(sender) = self.hub.connection_sender(connection_id).await? else {
            return Err(DeliveryError::ConnectionClosed(connection_id).into());
        };

        for update in updates {
            let frame = encode(&ServerMessage::StateUpdate(update))?;
            match timeout(self.hub.refresh_timeout(), sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(DeliveryError::ConnectionClosed(connection_id).into()),
                Err(_) => {
                    self.hub.remove(connection_id).await?;
                    return Err(DeliveryError::QueueFull(connection_id).into());
                }
            }
        }
        Ok(())
    }
}

/// Wires the registry to the hub
#[derive(Clone)]
pub struct StateManager {
    registry: Arc<Registry>,
    hub: HubHandle,
    events: Arc<RwLock<HashMap<String, EventHandler>>>,
    dropped: Arc<AtomicU64>,
}

impl StateManager {
    /// Create a manager whose components broadcast through `hub`
    pub fn new(hub: HubHandle, engine: Arc<dyn TemplateEngine>) -> Self {
        let broadcaster = Arc::new(HubBroadcaster::new(hub.clone()));
        Self {
            registry: Arc::new(Registry::new(broadcaster, engine)),
            hub,
            events: Arc::new(RwLock::new(HashMap::new())),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn register(&self, component: Component) -> Result<Arc<Component>, AppError> {
        self.registry.register(component)
    }

    pub fn remove(&self, id: &ComponentId) -> Result<Arc<Component>, AppError> {
        self.registry.remove(id)
    }

    pub async fn render_component(&self, id: &ComponentId, props: &Props) -> Result<String, AppError> {
        self.registry.render_component(id, props).await
    }

    /// Register the handler for client events named `name`
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionId, Value) + Send + Sync + 'static,
    {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(handler));
    }

    /// Number of client messages dropped so far
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Serve an upgraded socket
    pub async fn serve<S>(&self, ws_stream: WebSocketStream<S>) -> Result<(), AppError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        handler::serve_socket(ws_stream, self.hub.clone(), Arc::new(self.clone())).await
    }

    /// Handshake and serve a raw TCP stream
    pub async fn accept_tcp(&self, stream: TcpStream) -> Result<(), AppError> {
        handler::accept_tcp(stream, self.hub.clone(), Arc::new(self.clone())).await
    }

    fn drop_message(&self, connection_id: ConnectionId, reason: impl Display) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("Dropped message from {}: {}", connection_id, reason);
    }
}

#[async_trait]
impl MessageHandler for StateManager {
    async fn on_state_update(&self, connection_id: ConnectionId, update: StateUpdate) {
        let Some(component) = self.registry.get(&update.component_id) else {
            self.drop_message(connection_id, AppError::ComponentNotFound(update.component_id));
            return;
        };

        let state = component.state();
        let result = match update.kind {
            UpdateKind::Update => state.set(update.key, update.value).await,
            UpdateKind::Delete => state.delete(&update.key).await,
            UpdateKind::Compute => {
                self.drop_message(
                    connection_id,
                    format!("computed entry '{}' cannot be set by a client", update.key),
                );
                return;
            }
        };

        if let Err(e) = result {
            error!("State update from {} failed: {}", connection_id, e);
        }
    }

    async fn on_action(&self, connection_id: ConnectionId, action: ActionMessage) {
        let Some(component) = self.registry.get(&action.component_id) else {
            self.drop_message(connection_id, AppError::ComponentNotFound(action.component_id));
            return;
        };

        if !component.has_action(&action.action) {
            self.drop_message(
                connection_id,
                AppError::ActionNotFound {
                    component: action.component_id,
                    action: action.action,
                },
            );
            return;
        }

        if let Err(e) = component.execute(&action.action, action.params).await {
            error!(
                "Action '{}' on {} from {} failed: {}",
                action.action, action.component_id, connection_id, e
            );
        }
    }

    async fn on_refresh_request(&self, connection_id: ConnectionId) {
        debug!("Refreshing full state for {}", connection_id);

        let sink = RefreshSink {
            hub: &self.hub,
            connection_id,
        };
        for component in self.registry.get_all() {
            if let Err(e) = component.state().send_snapshot(&sink).await {
                warn!("Refresh for {} aborted: {}", connection_id, e);
                return;
            }
        }
    }

    async fn on_heartbeat_ack(&self, connection_id: ConnectionId, client_time: u64, server_time: u64) {
        debug!(
            "Heartbeat ack from {} (server {}, client {})",
            connection_id, server_time, client_time
        );
        if let Err(e) = self.hub.heartbeat_ack(connection_id).await {
            warn!("Could not record heartbeat ack for {}: {}", connection_id, e);
        }
    }

    async fn on_decode_error(&self, connection_id: ConnectionId, error: AppError) {
        self.drop_message(connection_id, error);
    }

    async fn on_event(&self, connection_id: ConnectionId, name: String, data: Value) {
        let handler = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        match handler {
            Some(handler) => handler(connection_id, data),
            None => self.drop_message(connection_id, format!("no handler for event '{}'", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::connection::Frame;
    use crate::hub::Hub;
    use crate::message::ClientMessage;
    use crate::store::StateStore;
    use crate::template::PlaceholderEngine;
    use crate::types::Params;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn manager() -> StateManager {
        let (hub, handle) = Hub::new(HubConfig::default());
        tokio::spawn(hub.run());
        StateManager::new(handle, Arc::new(PlaceholderEngine))
    }

    async fn connect(manager: &StateManager) -> (ConnectionId, mpsc::Receiver<Frame>) {
        connect_with_buffer(manager, 32).await
    }

    async fn connect_with_buffer(
        manager: &StateManager,
        buffer: usize,
    ) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(buffer);
        manager.hub().accept(id, tx).await.unwrap();
        // greeting
        rx.recv().await.unwrap();
        (id, rx)
    }

    /// Everything delivered so far; the count query flushes the hub queue first
    async fn drain(manager: &StateManager, rx: &mut mpsc::Receiver<Frame>) -> Vec<ServerMessage> {
        manager.hub().connection_count().await.unwrap();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn updates(messages: Vec<ServerMessage>) -> Vec<StateUpdate> {
        messages
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::StateUpdate(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    fn counter() -> Component {
        Component::builder("counter")
            .id("c1")
            .state("count", 0)
            .action_fn("increment", |state: Arc<StateStore>, _: Params| async move {
                let count = state.get("count").await.and_then(|v| v.as_i64()).unwrap_or(0);
                state.set("count", count + 1).await
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_set_broadcast_once() {
        let manager = manager();
        let (_id, mut rx) = connect(&manager).await;
        let component = manager.register(counter()).unwrap();

        component.state().set("count", 5).await.unwrap();
        component.state().set("count", 5).await.unwrap();

        let received = updates(drain(&manager, &mut rx).await);
        assert_eq!(
            received,
            vec![StateUpdate::update(ComponentId::from("c1"), "count", json!(5))]
        );
    }

    #[tokio::test]
    async fn test_ordered_fan_out() {
        let manager = manager();
        let (_a, mut rx_a) = connect(&manager).await;
        let (_b, mut rx_b) = connect(&manager).await;
        let component = manager.register(counter()).unwrap();

        for v in 1..=3 {
            component.state().set("count", v).await.unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let values: Vec<Value> = updates(drain(&manager, rx).await)
                .into_iter()
                .map(|u| u.value)
                .collect();
            assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
        }
    }

    #[tokio::test]
    async fn test_refresh_targets_requester_only() {
        let manager = manager();
        manager
            .register(
                Component::builder("pair")
                    .id("c1")
                    .state("a", 1)
                    .state("b", 2)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let (requester, mut rx_requester) = connect(&manager).await;
        let (_other, mut rx_other) = connect(&manager).await;

        manager.on_refresh_request(requester).await;

        let received = updates(drain(&manager, &mut rx_requester).await);
        assert_eq!(
            received,
            vec![
                StateUpdate::update(ComponentId::from("c1"), "a", json!(1)),
                StateUpdate::update(ComponentId::from("c1"), "b", json!(2)),
            ]
        );
        assert!(drain(&manager, &mut rx_other).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_dropped() {
        let manager = manager();
        let (id, mut rx) = connect(&manager).await;
        manager.register(counter()).unwrap();

        manager
            .on_action(
                id,
                ActionMessage {
                    component_id: ComponentId::from("missing"),
                    action: "x".to_string(),
                    params: Params::new(),
                },
            )
            .await;

        assert_eq!(manager.dropped_messages(), 1);
        assert!(drain(&manager, &mut rx).await.is_empty());

        manager
            .on_action(
                id,
                ActionMessage {
                    component_id: ComponentId::from("c1"),
                    action: "explode".to_string(),
                    params: Params::new(),
                },
            )
            .await;
        assert_eq!(manager.dropped_messages(), 2);
    }

    #[tokio::test]
    async fn test_action_broadcasts_change() {
        let manager = manager();
        let (id, mut rx) = connect(&manager).await;
        manager.register(counter()).unwrap();

        manager
            .on_action(
                id,
                ActionMessage {
                    component_id: ComponentId::from("c1"),
                    action: "increment".to_string(),
                    params: Params::new(),
                },
            )
            .await;

        let received = updates(drain(&manager, &mut rx).await);
        assert_eq!(
            received,
            vec![StateUpdate::update(ComponentId::from("c1"), "count", json!(1))]
        );
    }

    #[tokio::test]
    async fn test_client_update_fans_out_to_originator() {
        let manager = manager();
        let (origin, mut rx_origin) = connect(&manager).await;
        let (_other, mut rx_other) = connect(&manager).await;
        let component = manager.register(counter()).unwrap();

        manager
            .on_state_update(
                origin,
                StateUpdate::update(ComponentId::from("c1"), "count", json!(9)),
            )
            .await;

        assert_eq!(component.state().get("count").await, Some(json!(9)));
        assert_eq!(updates(drain(&manager, &mut rx_origin).await).len(), 1);
        assert_eq!(updates(drain(&manager, &mut rx_other).await).len(), 1);

        manager
            .on_state_update(origin, StateUpdate::delete(ComponentId::from("c1"), "count"))
            .await;
        assert_eq!(component.state().get("count").await, None);
        let deleted = updates(drain(&manager, &mut rx_other).await);
        assert_eq!(deleted[0].kind, UpdateKind::Delete);
    }

    #[tokio::test]
    async fn test_invalid_client_updates_dropped() {
        let manager = manager();
        let (id, _rx) = connect(&manager).await;
        manager.register(counter()).unwrap();

        manager
            .on_state_update(id, StateUpdate::update(ComponentId::from("ghost"), "a", json!(1)))
            .await;
        manager
            .on_state_update(
                id,
                StateUpdate {
                    component_id: ComponentId::from("c1"),
                    key: "total".to_string(),
                    value: json!(1),
                    kind: UpdateKind::Compute,
                },
            )
            .await;

        assert_eq!(manager.dropped_messages(), 2);
    }

    #[tokio::test]
    async fn test_custom_events() {
        let manager = manager();
        let (id, _rx) = connect(&manager).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_event("clicked", move |_, data| sink.lock().unwrap().push(data));

        MessageHandler::on_event(&manager, id, "clicked".to_string(), json!({"x": 1})).await;
        MessageHandler::on_event(&manager, id, "unknown".to_string(), Value::Null).await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1})]);
        assert_eq!(manager.dropped_messages(), 1);
    }

    #[tokio::test]
    async fn test_refresh_larger_than_queue_waits_for_space() {
        let manager = manager();
        let mut builder = Component::builder("wide").id("c1");
        for i in 0..20 {
            builder = builder.state(format!("k{:02}", i), i);
        }
        manager.register(builder.build().unwrap()).unwrap();
        let (id, mut rx) = connect_with_buffer(&manager, 8).await;

        let refresher = manager.clone();
        let refresh = tokio::spawn(async move { refresher.on_refresh_request(id).await });

        let mut keys = Vec::new();
        for _ in 0..20 {
            match serde_json::from_str(&rx.recv().await.unwrap()).unwrap() {
                ServerMessage::StateUpdate(update) => keys.push(update.key),
                other => panic!("unexpected {:?}", other),
            }
        }
        refresh.await.unwrap();

        assert_eq!(keys.len(), 20);
        assert_eq!(keys[0], "k00");
        assert_eq!(keys[19], "k19");
        assert_eq!(manager.hub().connection_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_refresh_stuck_queue_evicts_after_timeout() {
        let (hub, handle) = Hub::new(HubConfig {
            refresh_timeout: std::time::Duration::from_millis(50),
            ..HubConfig::default()
        });
        tokio::spawn(hub.run());
        let manager = StateManager::new(handle, Arc::new(PlaceholderEngine));
        manager
            .register(
                Component::builder("pair")
                    .id("c1")
                    .state("a", 1)
                    .state("b", 2)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        // never read after the greeting
        let (id, _rx) = connect_with_buffer(&manager, 1).await;

        manager.on_refresh_request(id).await;

        assert_eq!(manager.hub().connection_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_never_delivers_older_value_after_newer() {
        const ROUNDS: i64 = 2000;
        let manager = manager();
        let component = manager
            .register(Component::builder("seq").id("c1").state("n", 0).build().unwrap())
            .unwrap();
        // room for every frame of the run
        let (id, mut rx) = connect_with_buffer(&manager, 8192).await;

        let state = component.state().clone();
        let setter = tokio::spawn(async move {
            for v in 1..=ROUNDS {
                state.set("n", v).await.unwrap();
            }
        });
        let refresher = manager.clone();
        let refresh = tokio::spawn(async move {
            for _ in 0..ROUNDS {
                refresher.on_refresh_request(id).await;
            }
        });
        setter.await.unwrap();
        refresh.await.unwrap();

        let values: Vec<i64> = updates(drain(&manager, &mut rx).await)
            .into_iter()
            .filter_map(|u| u.value.as_i64())
            .collect();
        assert!(values.len() as i64 >= ROUNDS);
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "value went backwards");
        assert_eq!(values.last(), Some(&ROUNDS));
    }

    #[tokio::test]
    async fn test_decode_errors_counted_as_drops() {
        let manager = manager();
        let id = ConnectionId::new();
        let error = serde_json::from_str::<ClientMessage>("{not json").unwrap_err();

        manager.on_decode_error(id, AppError::Decode(error)).await;

        assert_eq!(manager.dropped_messages(), 1);
    }
}
