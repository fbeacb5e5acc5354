//! Client Reconciler
//!
//! Client side of the protocol as a sans-IO state machine. The host owns the
//! socket and the timers: it reports socket events (`on_open`, `on_close`,
//! `on_frame`) and page events (`on_online`, `on_visible`,
//! `on_dom_mutation`), and acts on the [`ReconcilerEvent`]s it takes back.
//!
//! Responsibilities:
//! - connection lifecycle with exponential backoff and a bounded attempt count
//! - queueing outbound messages while disconnected, flushed in order on open
//! - applying inbound deltas to the document, deferring those whose
//!   component is not mounted yet

mod connection;
mod dom;
mod queue;

pub use connection::{ConnectionState, ReconnectConfig};
pub use dom::{display_text, DomAdapter, MemoryDom};
pub use queue::OutboundQueue;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AppError, DeliveryError};
use crate::message::{unix_millis, ActionMessage, ClientMessage, ServerMessage, StateUpdate, UpdateKind};
use crate::protocol::{ATTR_COMPONENT, ATTR_STATE};
use crate::types::{ComponentId, ConnectionId, Params, StateMap};

/// Socket as seen by the reconciler
///
/// `open` starts an attempt; its outcome comes back through
/// [`Reconciler::on_open`] or [`Reconciler::on_close`].
pub trait Transport {
    fn open(&mut self);

    fn send(&mut self, text: String) -> Result<(), AppError>;

    fn close(&mut self);
}

/// Something the host has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilerEvent {
    /// The server assigned this connection ID
    Connected(ConnectionId),
    /// Call [`Reconciler::reconnect_due`] after this delay
    ScheduleReconnect(Duration),
    /// Attempts exhausted; state is now `GaveUp`
    ReconnectFailed,
}

/// Called after a delta was applied to a component of a registered type
pub type UpdateHook = Box<dyn FnMut(&StateUpdate)>;

pub struct Reconciler<D: DomAdapter, T: Transport> {
    dom: D,
    transport: T,
    config: ReconnectConfig,
    state: ConnectionState,
    /// Failed attempts since the last successful open
    attempt: u32,
    /// An `open` was issued and has not been answered yet
    in_flight: bool,
    connection_id: Option<ConnectionId>,
    queue: OutboundQueue,
    pending: HashMap<ComponentId, BTreeMap<String, StateUpdate>>,
    hooks: HashMap<String, UpdateHook>,
    events: Vec<ReconcilerEvent>,
}

impl<D: DomAdapter, T: Transport> Reconciler<D, T> {
    pub fn new(dom: D, transport: T, config: ReconnectConfig) -> Self {
        Self {
            dom,
            transport,
            config,
            state: ConnectionState::Disconnected,
            attempt: 0,
            in_flight: false,
            connection_id: None,
            queue: OutboundQueue::new(),
            pending: HashMap::new(),
            hooks: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn dom(&self) -> &D {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut D {
        &mut self.dom
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Number of components with deferred updates
    pub fn pending_components(&self) -> usize {
        self.pending.len()
    }

    /// Drain the events produced since the last call
    pub fn take_events(&mut self) -> Vec<ReconcilerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Register the update hook for components named `component`
    pub fn on_update<F>(&mut self, component: impl Into<String>, hook: F)
    where
        F: FnMut(&StateUpdate) + 'static,
    {
        self.hooks.insert(component.into(), Box::new(hook));
    }

    // ----- connection lifecycle -----

    /// Start connecting unless already connected or connecting
    pub fn connect(&mut self) {
        if self.state.is_connected() || self.in_flight {
            return;
        }
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            self.state = ConnectionState::Connecting;
        }
        self.open();
    }

    /// Close on request; no reconnect follows
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.in_flight = false;
        self.state = ConnectionState::Disconnected;
        self.connection_id = None;
    }

    /// The host timer for a scheduled reconnect fired
    pub fn reconnect_due(&mut self) {
        if matches!(self.state, ConnectionState::Reconnecting { .. }) && !self.in_flight {
            debug!("Reconnect attempt {}", self.attempt);
            self.open();
        }
    }

    /// The socket opened
    ///
    /// Flushes the queue in order, then sends exactly one refresh request.
    pub fn on_open(&mut self) {
        info!("Connected after {} failed attempts", self.attempt);
        self.in_flight = false;
        self.attempt = 0;
        self.state = ConnectionState::Connected;

        while let Some(message) = self.queue.pop() {
            if let Err(e) = self.transmit(&message) {
                warn!("Flush interrupted: {}", e);
                self.queue.push_front(message);
                self.connection_lost();
                return;
            }
        }

        self.queue.take_refresh();
        if let Err(e) = self.transmit(&ClientMessage::StateRefreshRequest) {
            warn!("Refresh request failed: {}", e);
            self.queue.push(ClientMessage::StateRefreshRequest);
            self.connection_lost();
        }
    }

    /// The socket closed, or an attempt failed
    ///
    /// A clean close of an open connection is final; anything else schedules
    /// a reconnect.
    pub fn on_close(&mut self, clean: bool) {
        self.in_flight = false;
        self.connection_id = None;

        if clean && self.state.is_connected() {
            info!("Connection closed");
            self.state = ConnectionState::Disconnected;
            return;
        }
        self.connection_lost();
    }

    /// The host went back online
    pub fn on_online(&mut self) {
        self.attempt = 0;
        if self.state.is_connected() || self.in_flight {
            return;
        }
        self.state = ConnectionState::Connecting;
        self.open();
    }

    /// The page became visible again
    ///
    /// Refreshes an open connection; otherwise reconnects now with reset
    /// backoff unless an attempt is already under way.
    pub fn on_visible(&mut self) {
        if self.state.is_connected() {
            self.request_refresh();
            return;
        }
        if self.in_flight {
            return;
        }
        self.attempt = 0;
        self.state = ConnectionState::Connecting;
        self.open();
    }

    fn open(&mut self) {
        self.in_flight = true;
        self.transport.open();
    }

    fn connection_lost(&mut self) {
        if self.state.is_connected() {
            self.transport.close();
        }
        self.in_flight = false;
        self.attempt = self.attempt.saturating_add(1);

        if self.config.exhausted(self.attempt) {
            warn!("Giving up after {} reconnect attempts", self.config.max_attempts);
            self.state = ConnectionState::GaveUp;
            self.events.push(ReconcilerEvent::ReconnectFailed);
            return;
        }

        let delay = self
            .config
            .jittered_delay(self.attempt - 1, &mut rand::thread_rng());
        debug!("Reconnect attempt {} in {:?}", self.attempt, delay);
        self.state = ConnectionState::Reconnecting {
            attempt: self.attempt,
        };
        self.events.push(ReconcilerEvent::ScheduleReconnect(delay));
    }

    // ----- outbound -----

    pub fn send_state_update(&mut self, component_id: ComponentId, key: impl Into<String>, value: Value) {
        self.send(ClientMessage::StateUpdate(StateUpdate::update(component_id, key, value)));
    }

    pub fn send_action(&mut self, component_id: ComponentId, action: impl Into<String>, params: Params) {
        self.send(ClientMessage::Action(ActionMessage {
            component_id,
            action: action.into(),
            params,
        }));
    }

    pub fn send_event(&mut self, name: impl Into<String>, data: Value) {
        self.send(ClientMessage::Event {
            name: name.into(),
            data,
        });
    }

    /// Ask for a full resend of all state; deduplicated while queued
    pub fn request_refresh(&mut self) {
        self.send(ClientMessage::StateRefreshRequest);
    }

    /// Send now when connected, queue otherwise
    pub fn send(&mut self, message: ClientMessage) {
        if !self.state.is_connected() {
            debug!("Queueing {} while {:?}", message.kind(), self.state);
            self.queue.push(message);
            return;
        }
        if let Err(e) = self.transmit(&message) {
            warn!("Send failed, queueing {}: {}", message.kind(), e);
            self.queue.push(message);
            self.connection_lost();
        }
    }

    fn transmit(&mut self, message: &ClientMessage) -> Result<(), AppError> {
        let text = serde_json::to_string(message).map_err(DeliveryError::from)?;
        self.transport.send(text)
    }

    // ----- inbound -----

    /// Handle a text frame from the server
    pub fn on_frame(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => self.on_message(message),
            Err(e) => warn!("Dropped server frame: {}", AppError::Decode(e)),
        }
    }

    pub fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { connection_id } => {
                debug!("Assigned connection ID {}", connection_id);
                self.connection_id = Some(connection_id);
                self.events.push(ReconcilerEvent::Connected(connection_id));
            }
            ServerMessage::StateUpdate(update) => self.receive_update(update),
            ServerMessage::Heartbeat { timestamp } => {
                self.send(ClientMessage::HeartbeatAck {
                    client_time: unix_millis(),
                    server_time: timestamp,
                });
            }
        }
    }

    fn receive_update(&mut self, update: StateUpdate) {
        if self.dom.has_component(&update.component_id) {
            self.apply(&update);
        } else {
            debug!(
                "Deferring {}.{} until the component is mounted",
                update.component_id, update.key
            );
            self.pending
                .entry(update.component_id.clone())
                .or_default()
                .insert(update.key.clone(), update);
        }
    }

    /// The document changed; replay deferred updates for mounted components
    ///
    /// Returns the number of updates applied.
    pub fn on_dom_mutation(&mut self) -> usize {
        let ready: Vec<ComponentId> = self
            .pending
            .keys()
            .filter(|id| self.dom.has_component(id))
            .cloned()
            .collect();

        let mut applied = 0;
        for id in ready {
            if let Some(updates) = self.pending.remove(&id) {
                for update in updates.values() {
                    self.apply(update);
                    applied += 1;
                }
            }
        }
        applied
    }

    /// Periodic fallback for missed mutation notifications
    pub fn sweep(&mut self) -> usize {
        self.on_dom_mutation()
    }

    fn apply(&mut self, update: &StateUpdate) {
        let id = &update.component_id;

        let mut state: StateMap = self
            .dom
            .attribute(id, ATTR_STATE)
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .unwrap_or_default();

        let text = match update.kind {
            UpdateKind::Delete => {
                state.remove(&update.key);
                String::new()
            }
            UpdateKind::Update | UpdateKind::Compute => {
                state.insert(update.key.clone(), update.value.clone());
                display_text(&update.value)
            }
        };

        self.dom
            .set_attribute(id, ATTR_STATE, &Value::Object(state).to_string());
        self.dom.set_bound_text(id, &update.key, &text);

        if let Some(component) = self.dom.attribute(id, ATTR_COMPONENT) {
            if let Some(hook) = self.hooks.get_mut(&component) {
                hook(update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeTransport {
        opened: usize,
        closed: usize,
        sent: Vec<ClientMessage>,
        fail_sends: bool,
    }

    impl Transport for FakeTransport {
        fn open(&mut self) {
            self.opened += 1;
        }

        fn send(&mut self, text: String) -> Result<(), AppError> {
            if self.fail_sends {
                return Err(DeliveryError::HubClosed.into());
            }
            self.sent.push(serde_json::from_str(&text).unwrap());
            Ok(())
        }

        fn close(&mut self) {
            self.closed += 1;
        }
    }

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn reconciler() -> Reconciler<MemoryDom, FakeTransport> {
        Reconciler::new(MemoryDom::new(), FakeTransport::default(), config())
    }

    fn connected() -> Reconciler<MemoryDom, FakeTransport> {
        let mut r = reconciler();
        r.connect();
        r.on_open();
        r.transport_mut().sent.clear();
        r
    }

    fn event(name: &str) -> ClientMessage {
        ClientMessage::Event {
            name: name.to_string(),
            data: Value::Null,
        }
    }

    fn update(id: &str, key: &str, value: Value) -> ServerMessage {
        ServerMessage::StateUpdate(StateUpdate::update(ComponentId::from(id), key, value))
    }

    fn state(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map,
            _ => StateMap::new(),
        }
    }

    #[test]
    fn test_queue_flushed_in_order_then_one_refresh() {
        let mut r = reconciler();
        r.send_event("m1", Value::Null);
        r.request_refresh();
        r.send_event("m2", Value::Null);
        r.request_refresh();
        r.send_event("m3", Value::Null);
        assert!(r.transport().sent.is_empty());

        r.connect();
        assert_eq!(r.state(), ConnectionState::Connecting);
        r.on_open();

        assert_eq!(
            r.transport().sent,
            vec![
                event("m1"),
                event("m2"),
                event("m3"),
                ClientMessage::StateRefreshRequest
            ]
        );
        assert!(r.queue().is_empty());
        assert_eq!(r.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_open_without_queue_still_refreshes() {
        let mut r = reconciler();
        r.connect();
        r.on_open();
        assert_eq!(r.transport().sent, vec![ClientMessage::StateRefreshRequest]);
    }

    #[test]
    fn test_connected_sends_immediately() {
        let mut r = connected();
        r.send_action(ComponentId::from("c1"), "increment", Params::new());
        assert_eq!(r.transport().sent.len(), 1);
        assert!(matches!(r.transport().sent[0], ClientMessage::Action(_)));
    }

    #[test]
    fn test_backoff_then_give_up() {
        let mut r = connected();

        r.on_close(false);
        assert_eq!(r.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(
            r.take_events(),
            vec![ReconcilerEvent::ScheduleReconnect(Duration::from_millis(100))]
        );

        r.reconnect_due();
        assert_eq!(r.transport().opened, 2);
        // a second timer firing while the attempt is in flight is ignored
        r.reconnect_due();
        assert_eq!(r.transport().opened, 2);

        r.on_close(false);
        assert_eq!(
            r.take_events(),
            vec![ReconcilerEvent::ScheduleReconnect(Duration::from_millis(200))]
        );
        r.reconnect_due();
        r.on_close(false);
        assert_eq!(
            r.take_events(),
            vec![ReconcilerEvent::ScheduleReconnect(Duration::from_millis(250))]
        );
        r.reconnect_due();
        r.on_close(false);

        assert_eq!(r.state(), ConnectionState::GaveUp);
        assert_eq!(r.take_events(), vec![ReconcilerEvent::ReconnectFailed]);
        r.reconnect_due();
        assert_eq!(r.transport().opened, 4);
    }

    #[test]
    fn test_clean_close_does_not_reconnect() {
        let mut r = connected();
        r.on_close(true);
        assert_eq!(r.state(), ConnectionState::Disconnected);
        assert!(r.take_events().is_empty());
    }

    #[test]
    fn test_online_resets_backoff() {
        let mut r = connected();
        r.on_close(false);
        r.reconnect_due();
        r.on_close(false);
        assert_eq!(r.state(), ConnectionState::Reconnecting { attempt: 2 });
        r.take_events();

        r.on_online();
        assert_eq!(r.state(), ConnectionState::Connecting);
        assert_eq!(r.transport().opened, 3);

        r.on_close(false);
        assert_eq!(
            r.take_events(),
            vec![ReconcilerEvent::ScheduleReconnect(Duration::from_millis(100))]
        );
    }

    #[test]
    fn test_visible_refreshes_or_reconnects() {
        let mut r = connected();
        r.on_visible();
        assert_eq!(r.transport().sent, vec![ClientMessage::StateRefreshRequest]);

        let mut r = connected();
        for _ in 0..4 {
            r.on_close(false);
            r.reconnect_due();
        }
        assert_eq!(r.state(), ConnectionState::GaveUp);
        let opened = r.transport().opened;

        r.on_visible();
        assert_eq!(r.state(), ConnectionState::Connecting);
        assert_eq!(r.transport().opened, opened + 1);
        r.on_open();
        assert_eq!(r.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_visible_skips_pending_backoff() {
        let mut r = connected();
        r.on_close(false);
        r.reconnect_due();
        r.on_close(false);
        assert_eq!(r.state(), ConnectionState::Reconnecting { attempt: 2 });
        r.take_events();

        r.on_visible();
        assert_eq!(r.state(), ConnectionState::Connecting);
        assert_eq!(r.transport().opened, 3);

        // the backoff timer firing later does not open a second socket
        r.reconnect_due();
        r.on_visible();
        assert_eq!(r.transport().opened, 3);

        // backoff starts over
        r.on_close(false);
        assert_eq!(
            r.take_events(),
            vec![ReconcilerEvent::ScheduleReconnect(Duration::from_millis(100))]
        );
    }

    #[test]
    fn test_failed_send_requeues() {
        let mut r = connected();
        r.transport_mut().fail_sends = true;
        r.send_event("lost", Value::Null);

        assert_eq!(r.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(r.queue().len(), 1);

        r.transport_mut().fail_sends = false;
        r.reconnect_due();
        r.on_open();
        assert_eq!(
            r.transport().sent,
            vec![event("lost"), ClientMessage::StateRefreshRequest]
        );
    }

    #[test]
    fn test_update_applied_to_mounted_component() {
        let mut r = connected();
        r.dom_mut().mount("c1", "counter", &state(json!({"count": 0})));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        r.on_update("counter", move |u| sink.borrow_mut().push(u.key.clone()));

        r.on_message(update("c1", "count", json!(4)));

        let id = ComponentId::from("c1");
        assert_eq!(r.dom().state(&id), Some(state(json!({"count": 4}))));
        assert_eq!(r.dom().bound_text(&id, "count"), Some("4"));
        assert_eq!(*seen.borrow(), vec!["count".to_string()]);

        r.on_message(ServerMessage::StateUpdate(StateUpdate::delete(id.clone(), "count")));
        assert_eq!(r.dom().state(&id), Some(StateMap::new()));
        assert_eq!(r.dom().bound_text(&id, "count"), Some(""));
    }

    #[test]
    fn test_pending_replayed_exactly_once() {
        let mut r = connected();
        r.on_message(update("c1", "count", json!(1)));
        r.on_message(update("c1", "count", json!(2)));
        r.on_message(update("c1", "label", json!("x")));
        assert_eq!(r.pending_components(), 1);

        // nothing mounted yet
        assert_eq!(r.sweep(), 0);

        let replays = Rc::new(RefCell::new(0));
        let counter = replays.clone();
        r.on_update("counter", move |_| *counter.borrow_mut() += 1);
        r.dom_mut().mount("c1", "counter", &StateMap::new());

        assert_eq!(r.on_dom_mutation(), 2);
        assert_eq!(r.pending_components(), 0);
        assert_eq!(
            r.dom().state(&ComponentId::from("c1")),
            Some(state(json!({"count": 2, "label": "x"})))
        );
        assert_eq!(r.on_dom_mutation(), 0);
        assert_eq!(r.sweep(), 0);
        assert_eq!(*replays.borrow(), 2);
    }

    #[test]
    fn test_heartbeat_acked_and_connected_recorded() {
        let mut r = connected();
        let id = ConnectionId::new();

        r.on_frame(&serde_json::to_string(&ServerMessage::Connected { connection_id: id }).unwrap());
        r.on_frame(r#"{"type":"heartbeat","payload":{"timestamp":42}}"#);
        r.on_frame("not json");

        assert_eq!(r.connection_id(), Some(id));
        assert_eq!(r.take_events(), vec![ReconcilerEvent::Connected(id)]);
        match &r.transport().sent[..] {
            [ClientMessage::HeartbeatAck { server_time, .. }] => assert_eq!(*server_time, 42),
            other => panic!("unexpected {:?}", other),
        }
    }
}
