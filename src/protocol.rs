//! DOM contract shared by server-side rendering and the client reconciler

/// Root element attribute carrying the component ID
pub const ATTR_COMPONENT_ID: &str = "data-component-id";

/// Root element attribute carrying the component name (its type)
pub const ATTR_COMPONENT: &str = "data-component";

/// Root element attribute carrying the serialized state snapshot
pub const ATTR_STATE: &str = "data-state";

/// Marks an element bound to a state key
pub const ATTR_BIND: &str = "data-bind";

/// Marks an element that triggers an action
pub const ATTR_ACTION: &str = "data-action";
