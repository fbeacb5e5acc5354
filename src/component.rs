//! Component definition
//!
//! A component is an independently addressable unit of server-held state,
//! its template and its typed actions. Everything except the state values is
//! fixed by [`ComponentBuilder`] before registration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AppError;
use crate::store::{ComputeFn, StateChangeHook, StateStore, Watcher};
use crate::template::{CompiledTemplate, TemplateEngine};
use crate::types::{ComponentId, Params, Props, StateMap};

/// A named command a client can trigger on a component
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, state: Arc<StateStore>, params: Params) -> Result<(), AppError>;
}

/// Adapts an async closure into an [`Action`]
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Arc<StateStore>, Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    async fn execute(&self, state: Arc<StateStore>, params: Params) -> Result<(), AppError> {
        (self.0)(state, params).await
    }
}

/// Called before rendering with the render props
pub type RenderHook = Arc<dyn Fn(&Component, &Props) + Send + Sync>;

/// Called after rendering with the produced markup
pub type AfterRenderHook = Arc<dyn Fn(&Component, &str) + Send + Sync>;

/// Mount/destroy hook; an error aborts mount or is reported on destroy
pub type LifecycleHook = Arc<dyn Fn(&Component) -> Result<(), String> + Send + Sync>;

/// Optional lifecycle callbacks
#[derive(Clone, Default)]
pub struct Lifecycle {
    pub before_render: Option<RenderHook>,
    pub after_render: Option<AfterRenderHook>,
    pub on_mount: Option<LifecycleHook>,
    pub on_destroy: Option<LifecycleHook>,
    pub on_state_change: Option<StateChangeHook>,
}

/// Template source plus its compile-once handle
pub struct TemplateRef {
    source: String,
    compiled: OnceLock<Arc<dyn CompiledTemplate>>,
}

impl TemplateRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            compiled: OnceLock::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    /// Compiled template, compiling on first use
    pub fn compiled(
        &self,
        name: &str,
        engine: &dyn TemplateEngine,
    ) -> Result<Arc<dyn CompiledTemplate>, AppError> {
        if let Some(compiled) = self.compiled.get() {
            return Ok(compiled.clone());
        }
        let compiled: Arc<dyn CompiledTemplate> = Arc::from(engine.compile(name, &self.source)?);
        // A concurrent compile may have won; keep whichever was stored first.
        Ok(self.compiled.get_or_init(|| compiled).clone())
    }
}

/// A registered unit of UI state
pub struct Component {
    id: ComponentId,
    name: String,
    template: TemplateRef,
    state: Arc<StateStore>,
    actions: HashMap<String, Arc<dyn Action>>,
    lifecycle: Lifecycle,
}

impl Component {
    /// Start building a component with the given name
    pub fn builder(name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder::new(name)
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &TemplateRef {
        &self.template
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Declared action names, sorted
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Run a named action against this component's state
    pub async fn execute(&self, action: &str, params: Params) -> Result<(), AppError> {
        let handler = self
            .actions
            .get(action)
            .cloned()
            .ok_or_else(|| AppError::ActionNotFound {
                component: self.id.clone(),
                action: action.to_string(),
            })?;
        handler.execute(self.state.clone(), params).await
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("actions", &self.action_names())
            .finish()
    }
}

/// Builder for [`Component`]
pub struct ComponentBuilder {
    id: Option<ComponentId>,
    name: String,
    template: String,
    values: StateMap,
    computed: HashMap<String, ComputeFn>,
    watchers: HashMap<String, Vec<Watcher>>,
    actions: Vec<(String, Arc<dyn Action>)>,
    lifecycle: Lifecycle,
}

impl ComponentBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            template: String::new(),
            values: StateMap::new(),
            computed: HashMap::new(),
            watchers: HashMap::new(),
            actions: Vec::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Use a fixed ID instead of a generated one
    pub fn id(mut self, id: impl Into<ComponentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn template(mut self, source: impl Into<String>) -> Self {
        self.template = source.into();
        self
    }

    /// Initial state value
    pub fn state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn computed<F>(mut self, key: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&StateMap) -> Value + Send + Sync + 'static,
    {
        self.computed.insert(key.into(), Arc::new(compute));
        self
    }

    pub fn watch<F>(mut self, key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.watchers
            .entry(key.into())
            .or_default()
            .push(Arc::new(callback));
        self
    }

    pub fn action(mut self, name: impl Into<String>, action: impl Action + 'static) -> Self {
        self.actions.push((name.into(), Arc::new(action)));
        self
    }

    /// Declare an action from an async closure
    pub fn action_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<StateStore>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        self.action(name, FnAction(f))
    }

    pub fn before_render<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Component, &Props) + Send + Sync + 'static,
    {
        self.lifecycle.before_render = Some(Arc::new(hook));
        self
    }

    pub fn after_render<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Component, &str) + Send + Sync + 'static,
    {
        self.lifecycle.after_render = Some(Arc::new(hook));
        self
    }

    pub fn on_mount<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Component) -> Result<(), String> + Send + Sync + 'static,
    {
        self.lifecycle.on_mount = Some(Arc::new(hook));
        self
    }

    pub fn on_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Component) -> Result<(), String> + Send + Sync + 'static,
    {
        self.lifecycle.on_destroy = Some(Arc::new(hook));
        self
    }

    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ComponentId, &str, &Value, &Value) + Send + Sync + 'static,
    {
        self.lifecycle.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Finish the component
    ///
    /// Fails on an empty or repeated action name.
    pub fn build(self) -> Result<Component, AppError> {
        let id = self.id.unwrap_or_else(|| ComponentId::generate(&self.name));

        let mut actions = HashMap::new();
        for (name, action) in self.actions {
            if name.trim().is_empty() {
                return Err(AppError::InvalidAction(format!(
                    "empty action name on component {}",
                    id
                )));
            }
            if actions.insert(name.clone(), action).is_some() {
                return Err(AppError::InvalidAction(format!(
                    "action '{}' declared twice on component {}",
                    name, id
                )));
            }
        }

        let state = StateStore::from_parts(id.clone(), self.values, self.computed, self.watchers);

        Ok(Component {
            id,
            name: self.name,
            template: TemplateRef::new(self.template),
            state: Arc::new(state),
            actions,
            lifecycle: self.lifecycle,
        })
    }
}
