//! Basic type definitions for the sync engine
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based unique connection identifier
//! - `ComponentId`: stable string identifier of a registered component
//!
//! Also the map aliases shared by state, props and action parameters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object used for state snapshots, render props and action params
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Props handed to a render call
pub type Props = StateMap;

/// Named parameters of an action call
pub type Params = StateMap;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4 generated when a socket is accepted.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Component identifier
///
/// Assigned once at construction and stable for the component's lifetime.
/// Travels over the wire and in the DOM as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub String);

impl ComponentId {
    /// Generate an ID of the form `<name>-<8 hex chars>`
    pub fn generate(name: &str) -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", name, &uuid[..8]))
    }

    /// Borrow the raw string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ComponentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ComponentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_component_id_generate() {
        let id = ComponentId::generate("counter");
        assert!(id.as_str().starts_with("counter-"));
        assert_eq!(id.as_str().len(), "counter-".len() + 8);
        assert_ne!(id, ComponentId::generate("counter"));
    }

    #[test]
    fn test_component_id_serializes_as_string() {
        let id = ComponentId::from("c1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c1\"");
    }

    #[test]
    fn test_connection_id_serializes_as_uuid_string() {
        let id = ConnectionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<ConnectionId>(&json).unwrap(), id);
    }
}
