//! Templating collaborator
//!
//! Components hold template source; an engine compiles it once and executes
//! it with the render context. [`PlaceholderEngine`] is a small built-in
//! engine with `{{ ... }}` tags:
//!
//! - `{{ id }}`, `{{ name }}`
//! - `{{ state.<key> }}`, `{{ props.<key> }}`
//! - `{{ bind <key> }}` renders `<span data-bind="key">value</span>`
//! - `{{ action <name> }}` renders `data-action="name"`

use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::protocol::{ATTR_ACTION, ATTR_BIND};
use crate::types::{ComponentId, Props, StateMap};

/// Data handed to a template execution
#[derive(Debug, Serialize)]
pub struct RenderContext<'a> {
    pub id: &'a ComponentId,
    pub name: &'a str,
    pub state: &'a StateMap,
    pub props: &'a Props,
    pub methods: Vec<String>,
}

/// Compiles template source
pub trait TemplateEngine: Send + Sync {
    fn compile(&self, name: &str, source: &str) -> Result<Box<dyn CompiledTemplate>, AppError>;
}

/// A compiled, reusable template
pub trait CompiledTemplate: Send + Sync {
    fn execute(&self, ctx: &RenderContext<'_>) -> Result<String, AppError>;

    /// Action names the template binds to elements
    fn referenced_actions(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Id,
    Name,
    State(String),
    Props(String),
    Bind(String),
    Action(String),
}

/// Built-in `{{ ... }}` engine
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderEngine;

impl TemplateEngine for PlaceholderEngine {
    fn compile(&self, name: &str, source: &str) -> Result<Box<dyn CompiledTemplate>, AppError> {
        let segments = parse(name, source)?;
        Ok(Box::new(PlaceholderTemplate { segments }))
    }
}

struct PlaceholderTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate for PlaceholderTemplate {
    fn execute(&self, ctx: &RenderContext<'_>) -> Result<String, AppError> {
        let mut html = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => html.push_str(text),
                Segment::Id => html.push_str(&escape_html(ctx.id.as_str())),
                Segment::Name => html.push_str(&escape_html(ctx.name)),
                Segment::State(key) => html.push_str(&render_value(ctx.state.get(key))),
                Segment::Props(key) => html.push_str(&render_value(ctx.props.get(key))),
                Segment::Bind(key) => {
                    html.push_str(&format!(
                        "<span {}=\"{}\">{}</span>",
                        ATTR_BIND,
                        escape_html(key),
                        render_value(ctx.state.get(key))
                    ));
                }
                Segment::Action(action) => {
                    html.push_str(&format!("{}=\"{}\"", ATTR_ACTION, escape_html(action)));
                }
            }
        }
        Ok(html)
    }

    fn referenced_actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = Vec::new();
        for segment in &self.segments {
            if let Segment::Action(action) = segment {
                if !actions.contains(action) {
                    actions.push(action.clone());
                }
            }
        }
        actions
    }
}

fn parse(name: &str, source: &str) -> Result<Vec<Segment>, AppError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(AppError::template(
                name,
                format!("unclosed tag at byte {}", offset + start),
            ));
        };
        segments.push(parse_expression(name, after[..end].trim())?);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

fn parse_expression(name: &str, expr: &str) -> Result<Segment, AppError> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    let segment = match parts.as_slice() {
        ["id"] => Segment::Id,
        ["name"] => Segment::Name,
        ["bind", key] => Segment::Bind(key.to_string()),
        ["action", action] => Segment::Action(action.to_string()),
        [path] => {
            if let Some(key) = path.strip_prefix("state.").filter(|k| !k.is_empty()) {
                Segment::State(key.to_string())
            } else if let Some(key) = path.strip_prefix("props.").filter(|k| !k.is_empty()) {
                Segment::Props(key.to_string())
            } else {
                return Err(AppError::template(name, format!("unknown expression '{}'", expr)));
            }
        }
        _ => return Err(AppError::template(name, format!("unknown expression '{}'", expr))),
    };
    Ok(segment)
}

/// Render a JSON value as escaped text
///
/// Strings render bare, `null` and missing values render empty, structures
/// render as JSON.
pub fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => escape_html(s),
        Some(other) => escape_html(&other.to_string()),
    }
}

/// Escape text for HTML content and quoted attributes
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
