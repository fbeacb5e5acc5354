//! DOM access for the reconciler
//!
//! The reconciler only needs the component root elements (found by
//! `data-component-id`), their attributes, and the text of elements bound to
//! a state key inside them.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::protocol::{ATTR_COMPONENT, ATTR_COMPONENT_ID, ATTR_STATE};
use crate::types::{ComponentId, StateMap};

/// Host document as seen by the reconciler
pub trait DomAdapter {
    /// Whether a root element with this component ID is present
    fn has_component(&self, id: &ComponentId) -> bool;

    /// Attribute of the component's root element
    fn attribute(&self, id: &ComponentId, name: &str) -> Option<String>;

    fn set_attribute(&mut self, id: &ComponentId, name: &str, value: &str);

    /// Replace the text of every `data-bind="key"` element inside the component
    fn set_bound_text(&mut self, id: &ComponentId, key: &str, text: &str);
}

/// Text shown in a bound element for a state value
pub fn display_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryElement {
    attributes: HashMap<String, String>,
    /// Text per bound key; a key absent here has no bound element
    bound: BTreeMap<String, String>,
}

/// In-memory document for headless hosts and tests
#[derive(Debug, Default)]
pub struct MemoryDom {
    elements: HashMap<ComponentId, MemoryElement>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a component root the way server rendering emits it
    pub fn mount(&mut self, id: impl Into<ComponentId>, component: &str, state: &StateMap) {
        let id = id.into();
        let mut element = MemoryElement::default();
        element
            .attributes
            .insert(ATTR_COMPONENT_ID.to_string(), id.to_string());
        element
            .attributes
            .insert(ATTR_COMPONENT.to_string(), component.to_string());
        element.attributes.insert(
            ATTR_STATE.to_string(),
            Value::Object(state.clone()).to_string(),
        );
        for (key, value) in state {
            element.bound.insert(key.clone(), display_text(value));
        }
        self.elements.insert(id, element);
    }

    /// Add a bound element for `key` to a mounted component
    pub fn bind(&mut self, id: &ComponentId, key: &str) {
        if let Some(element) = self.elements.get_mut(id) {
            element.bound.entry(key.to_string()).or_default();
        }
    }

    pub fn unmount(&mut self, id: &ComponentId) -> bool {
        self.elements.remove(id).is_some()
    }

    /// Parsed `data-state` of a component
    pub fn state(&self, id: &ComponentId) -> Option<StateMap> {
        let raw = self.attribute(id, ATTR_STATE)?;
        match serde_json::from_str(&raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn bound_text(&self, id: &ComponentId, key: &str) -> Option<&str> {
        self.elements.get(id)?.bound.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl DomAdapter for MemoryDom {
    fn has_component(&self, id: &ComponentId) -> bool {
        self.elements.contains_key(id)
    }

    fn attribute(&self, id: &ComponentId, name: &str) -> Option<String> {
        self.elements.get(id)?.attributes.get(name).cloned()
    }

    fn set_attribute(&mut self, id: &ComponentId, name: &str, value: &str) {
        if let Some(element) = self.elements.get_mut(id) {
            element
                .attributes
                .insert(name.to_string(), value.to_string());
        }
    }

    fn set_bound_text(&mut self, id: &ComponentId, key: &str, text: &str) {
        if let Some(slot) = self
            .elements
            .get_mut(id)
            .and_then(|element| element.bound.get_mut(key))
        {
            *slot = text.to_string();
        }
    }
}
