//! Per-component state store
//!
//! Key/value state with computed entries and watchers. Every effective
//! mutation is pushed to the bound [`Broadcaster`] while the store lock is
//! held, so deltas of one store leave in the order they were applied.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::AppError;
use crate::message::{StateUpdate, UpdateKind};
use crate::types::{ComponentId, StateMap};

/// Watcher callback, invoked with `(old, new)`
pub type Watcher = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Computed entry, evaluated against the stored values on every read
pub type ComputeFn = Arc<dyn Fn(&StateMap) -> Value + Send + Sync>;

/// Component-level change hook, invoked with `(component, key, old, new)`
pub type StateChangeHook = Arc<dyn Fn(&ComponentId, &str, &Value, &Value) + Send + Sync>;

/// Sink for state deltas
///
/// Implemented by the state manager, which forwards deltas to the hub.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_update(&self, update: StateUpdate) -> Result<(), AppError>;
}

/// Receiver of a full snapshot for a single recipient
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn send_snapshot(&self, updates: Vec<StateUpdate>) -> Result<(), AppError>;
}

/// What a registered store reports to
#[derive(Clone)]
pub(crate) struct StoreBinding {
    pub broadcaster: Arc<dyn Broadcaster>,
    pub on_state_change: Option<StateChangeHook>,
}

#[derive(Default)]
struct StoreInner {
    values: StateMap,
    computed: HashMap<String, ComputeFn>,
    watchers: HashMap<String, Vec<Watcher>>,
}

impl StoreInner {
    fn snapshot(&self) -> StateMap {
        let mut snapshot = self.values.clone();
        for (key, compute) in &self.computed {
            snapshot.insert(key.clone(), compute(&self.values));
        }
        snapshot
    }
}

/// State container owned by exactly one component
pub struct StateStore {
    component_id: ComponentId,
    inner: Mutex<StoreInner>,
    binding: RwLock<Option<StoreBinding>>,
}

impl StateStore {
    /// Create an empty, unbound store
    pub fn new(component_id: ComponentId) -> Self {
        Self::from_parts(component_id, StateMap::new(), HashMap::new(), HashMap::new())
    }

    pub(crate) fn from_parts(
        component_id: ComponentId,
        values: StateMap,
        computed: HashMap<String, ComputeFn>,
        watchers: HashMap<String, Vec<Watcher>>,
    ) -> Self {
        Self {
            component_id,
            inner: Mutex::new(StoreInner {
                values,
                computed,
                watchers,
            }),
            binding: RwLock::new(None),
        }
    }

    /// ID of the owning component
    pub fn component_id(&self) -> &ComponentId {
        &self.component_id
    }

    pub(crate) fn bind(&self, binding: StoreBinding) {
        *self.binding.write().unwrap_or_else(PoisonError::into_inner) = Some(binding);
    }

    pub(crate) fn unbind(&self) {
        *self.binding.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether the store currently reports to a broadcaster
    pub fn is_bound(&self) -> bool {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn binding(&self) -> Option<StoreBinding> {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store a value
    ///
    /// Setting a value equal to the current one does nothing. Otherwise the
    /// delta is broadcast, then watchers and the change hook run. A broadcast
    /// failure is returned after the value has been stored.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), AppError> {
        let key = key.into();
        let value = value.into();

        let mut inner = self.inner.lock().await;
        if inner.values.get(&key) == Some(&value) {
            return Ok(());
        }

        let old = inner
            .values
            .insert(key.clone(), value.clone())
            .unwrap_or(Value::Null);
        let watchers = inner.watchers.get(&key).cloned().unwrap_or_default();
        let binding = self.binding();

        let delivered = match &binding {
            Some(binding) => {
                let update = StateUpdate::update(self.component_id.clone(), key.clone(), value.clone());
                binding.broadcaster.broadcast_update(update).await
            }
            None => Ok(()),
        };
        drop(inner);

        self.notify(&key, &old, &value, &watchers, binding.as_ref());
        delivered
    }

    /// Remove a key; no-op if absent
    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        let Some(old) = inner.values.remove(key) else {
            return Ok(());
        };

        let watchers = inner.watchers.get(key).cloned().unwrap_or_default();
        let binding = self.binding();

        let delivered = match &binding {
            Some(binding) => {
                let update = StateUpdate::delete(self.component_id.clone(), key);
                binding.broadcaster.broadcast_update(update).await
            }
            None => Ok(()),
        };
        drop(inner);

        self.notify(key, &old, &Value::Null, &watchers, binding.as_ref());
        delivered
    }

    /// Read a key
    ///
    /// Computed entries shadow stored values and are evaluated on every call.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        if let Some(compute) = inner.computed.get(key) {
            return Some(compute(&inner.values));
        }
        inner.values.get(key).cloned()
    }

    /// Snapshot of stored values merged with evaluated computed entries
    pub async fn get_all(&self) -> StateMap {
        let inner = self.inner.lock().await;
        inner.snapshot()
    }

    /// Hand the current snapshot to `sink`, one `update` delta per key
    ///
    /// The store lock is held until the sink returns: no delta of this store
    /// is broadcast between taking the snapshot and delivering it.
    pub async fn send_snapshot<S>(&self, sink: &S) -> Result<(), AppError>
    where
        S: SnapshotSink + ?Sized,
    {
        let inner = self.inner.lock().await;
        let updates = inner
            .snapshot()
            .into_iter()
            .map(|(key, value)| StateUpdate::update(self.component_id.clone(), key, value))
            .collect();
        sink.send_snapshot(updates).await
    }

    /// Sorted keys of the current snapshot
    pub async fn keys(&self) -> Vec<String> {
        self.get_all().await.keys().cloned().collect()
    }

    /// Add a watcher for `key`
    pub async fn watch<F>(&self, key: impl Into<String>, callback: F)
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner
            .watchers
            .entry(key.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Register or replace a computed entry
    ///
    /// A bound store announces the entry with a `compute` delta carrying its
    /// current value.
    pub async fn compute<F>(&self, key: impl Into<String>, compute: F) -> Result<(), AppError>
    where
        F: Fn(&StateMap) -> Value + Send + Sync + 'static,
    {
        let key = key.into();
        let compute: ComputeFn = Arc::new(compute);

        let mut inner = self.inner.lock().await;
        let value = compute(&inner.values);
        inner.computed.insert(key.clone(), compute);

        match self.binding() {
            Some(binding) => {
                let update = StateUpdate {
                    component_id: self.component_id.clone(),
                    key,
                    value,
                    kind: UpdateKind::Compute,
                };
                binding.broadcaster.broadcast_update(update).await
            }
            None => Ok(()),
        }
    }

    fn notify(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        watchers: &[Watcher],
        binding: Option<&StoreBinding>,
    ) {
        for watcher in watchers {
            if panic::catch_unwind(AssertUnwindSafe(|| watcher(old, new))).is_err() {
                error!("Watcher for {}.{} panicked", self.component_id, key);
            }
        }

        if let Some(hook) = binding.and_then(|b| b.on_state_change.as_ref()) {
            let id = &self.component_id;
            if panic::catch_unwind(AssertUnwindSafe(|| hook(id, key, old, new))).is_err() {
                error!("on_state_change hook panicked for {}.{}", id, key);
            }
        }

        debug!("{}.{} changed", self.component_id, key);
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("component_id", &self.component_id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Broadcaster that records every delta it is handed
    #[derive(Default)]
    pub(crate) struct RecordingBroadcaster {
        pub updates: std::sync::Mutex<Vec<StateUpdate>>,
    }

    impl RecordingBroadcaster {
        pub(crate) fn updates(&self) -> Vec<StateUpdate> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast_update(&self, update: StateUpdate) -> Result<(), AppError> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    pub(crate) fn bound_store(id: &str) -> (StateStore, Arc<RecordingBroadcaster>) {
        let store = StateStore::new(ComponentId::from(id));
        let recorder = Arc::new(RecordingBroadcaster::default());
        store.bind(StoreBinding {
            broadcaster: recorder.clone(),
            on_state_change: None,
        });
        (store, recorder)
    }
}
