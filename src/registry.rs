//! Component registry
//!
//! Thread-safe catalog of registered components. Mutations serialize on one
//! registry-wide write lock; lookups take the shared read path. The lock is
//! never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::component::Component;
use crate::error::AppError;
use crate::protocol::{ATTR_COMPONENT, ATTR_COMPONENT_ID, ATTR_STATE};
use crate::store::{Broadcaster, StoreBinding};
use crate::template::{escape_html, RenderContext, TemplateEngine};
use crate::types::{ComponentId, Props};

/// Catalog of live components
pub struct Registry {
    components: RwLock<HashMap<ComponentId, Arc<Component>>>,
    broadcaster: Arc<dyn Broadcaster>,
    engine: Arc<dyn TemplateEngine>,
}

impl Registry {
    /// Create a registry whose components report deltas to `broadcaster`
    pub fn new(broadcaster: Arc<dyn Broadcaster>, engine: Arc<dyn TemplateEngine>) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            broadcaster,
            engine,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ComponentId, Arc<Component>>> {
        self.components.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ComponentId, Arc<Component>>> {
        self.components.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a component
    ///
    /// Rejects a duplicate ID before touching anything. Compiles the
    /// template, checks that every action it binds is declared, binds the
    /// state store and runs `on_mount`. A failing `on_mount` rolls the
    /// insertion back. `on_mount` runs under the registry lock and must not
    /// call back into the registry.
    pub fn register(&self, component: Component) -> Result<Arc<Component>, AppError> {
        let mut components = self.write();
        let id = component.id().clone();

        if components.contains_key(&id) {
            warn!("Rejected duplicate component {}", id);
            return Err(AppError::DuplicateId(id));
        }

        let compiled = component
            .template()
            .compiled(component.name(), self.engine.as_ref())?;
        for action in compiled.referenced_actions() {
            if !component.has_action(&action) {
                return Err(AppError::UnknownAction {
                    component: id,
                    action,
                });
            }
        }

        let component = Arc::new(component);
        components.insert(id.clone(), component.clone());
        component.state().bind(StoreBinding {
            broadcaster: self.broadcaster.clone(),
            on_state_change: component.lifecycle().on_state_change.clone(),
        });

        if let Some(on_mount) = &component.lifecycle().on_mount {
            if let Err(message) = on_mount(component.as_ref()) {
                component.state().unbind();
                components.remove(&id);
                warn!("on_mount failed for {}, registration rolled back", id);
                return Err(AppError::lifecycle("on_mount", &id, message));
            }
        }

        info!("Registered component {} ({})", id, component.name());
        debug!("Total components: {}", components.len());
        Ok(component)
    }

    /// Look up a component
    pub fn get(&self, id: &ComponentId) -> Option<Arc<Component>> {
        self.read().get(id).cloned()
    }

    /// Remove a component
    ///
    /// The entry is removed even when `on_destroy` fails; that error is
    /// returned afterwards.
    pub fn remove(&self, id: &ComponentId) -> Result<Arc<Component>, AppError> {
        let component = self
            .write()
            .remove(id)
            .ok_or_else(|| AppError::ComponentNotFound(id.clone()))?;
        component.state().unbind();
        info!("Removed component {}", id);

        if let Some(on_destroy) = &component.lifecycle().on_destroy {
            on_destroy(component.as_ref()).map_err(|message| AppError::lifecycle("on_destroy", id, message))?;
        }
        Ok(component)
    }

    /// Render a component's markup
    ///
    /// The template output is wrapped in the component root element, which
    /// carries the ID, the component type and the serialized state snapshot
    /// the client reconciler reads.
    pub async fn render_component(&self, id: &ComponentId, props: &Props) -> Result<String, AppError> {
        let component = self
            .get(id)
            .ok_or_else(|| AppError::ComponentNotFound(id.clone()))?;
        let compiled = component
            .template()
            .compiled(component.name(), self.engine.as_ref())?;

        if let Some(before_render) = &component.lifecycle().before_render {
            before_render(component.as_ref(), props);
        }

        let state = component.state().get_all().await;
        let ctx = RenderContext {
            id,
            name: component.name(),
            state: &state,
            props,
            methods: component.action_names(),
        };
        let body = compiled.execute(&ctx)?;
        let state_json = serde_json::to_string(&state)
            .map_err(|e| AppError::template(component.name(), e.to_string()))?;

        let html = format!(
            "<div {}=\"{}\" {}=\"{}\" {}=\"{}\">{}</div>",
            ATTR_COMPONENT_ID,
            escape_html(id.as_str()),
            ATTR_COMPONENT,
            escape_html(component.name()),
            ATTR_STATE,
            escape_html(&state_json),
            body
        );

        if let Some(after_render) = &component.lifecycle().after_render {
            after_render(component.as_ref(), &html);
        }
        Ok(html)
    }

    /// Snapshot of all components, sorted by ID
    pub fn get_all(&self) -> Vec<Arc<Component>> {
        let mut components: Vec<Arc<Component>> = self.read().values().cloned().collect();
        components.sort_by(|a, b| a.id().cmp(b.id()));
        components
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
