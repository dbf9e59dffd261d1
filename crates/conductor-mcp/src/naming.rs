//! Canonical tool naming and schema normalization
//!
//! Pure, total functions: malformed input degrades to a safe default
//! instead of erroring. Qualified names are derived deterministically so
//! the execution loop can route a model-issued call straight back to its
//! endpoint.

use conductor_core::CanonicalTool;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::catalog::ToolDescriptor;
use crate::endpoint::Endpoint;

/// Provider limit on tool name length.
pub const MAX_NAME_LEN: usize = 128;

/// Separator between the endpoint segment and the raw tool name.
pub const SEPARATOR: &str = "__";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the qualified name: sanitized endpoint id, separator, sanitized
/// tool name, truncated from the tail to the provider limit.
pub fn qualify(endpoint_id: &str, tool_name: &str) -> String {
    let mut name = format!("{}{}{}", sanitize(endpoint_id), SEPARATOR, sanitize(tool_name));
    name.truncate(MAX_NAME_LEN);
    name
}

/// Split a qualified name back into `(endpoint-segment, raw-name)`.
pub fn decompose(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(SEPARATOR)
}

/// Whether a qualified-name endpoint segment addresses the given endpoint.
///
/// Exact match against the sanitized id first; the single deterministic
/// repair folds `-` to `_` on both sides, covering models that normalize
/// hyphens away when they re-emit tool names.
pub fn matches_endpoint(segment: &str, endpoint_id: &str) -> bool {
    let sanitized = sanitize(endpoint_id);
    if segment == sanitized {
        return true;
    }
    segment.replace('-', "_") == sanitized.replace('-', "_")
}

/// Strip the given endpoint's segment off a qualified name, returning the
/// remaining (sanitized) tool part.
///
/// Prefix matching rather than a plain split keeps endpoint ids containing
/// `__` routable. Falls back to the hyphen/underscore fold when the exact
/// prefix does not match.
pub fn split_for_endpoint(qualified: &str, endpoint: &Endpoint) -> Option<String> {
    let prefix = format!("{}{}", sanitize(&endpoint.id), SEPARATOR);
    if let Some(rest) = qualified.strip_prefix(&prefix) {
        return Some(rest.to_string());
    }
    let folded = qualified.replace('-', "_");
    let folded_prefix = prefix.replace('-', "_");
    folded.strip_prefix(&folded_prefix).map(str::to_string)
}

/// Repair a tool parameter schema into the shape the completion provider
/// accepts: always an object schema, always carrying `properties`.
pub fn repair_schema(schema: Option<&Value>) -> Value {
    let mut map = match schema {
        Some(Value::Object(existing)) => existing.clone(),
        _ => Map::new(),
    };
    if !map.contains_key("type") {
        map.insert("type".to_string(), json!("object"));
    }
    let is_object = map.get("type").and_then(Value::as_str) == Some("object");
    if is_object && !map.contains_key("properties") {
        map.insert("properties".to_string(), json!({}));
    }
    Value::Object(map)
}

/// Derive the provider-ready shape for one descriptor.
pub fn canonicalize(descriptor: &ToolDescriptor) -> CanonicalTool {
    CanonicalTool {
        name: qualify(&descriptor.origin, &descriptor.name),
        description: format!("[{}] {}", descriptor.origin, descriptor.description),
        parameters: repair_schema(descriptor.input_schema.as_ref()),
    }
}

/// Flatten per-endpoint catalogs into the turn's tool set.
///
/// Tools are processed in discovery order. Post-sanitization name
/// collisions drop the later tool. When the flattened count exceeds
/// `max_tools`, tools from connector-marked endpoints are retained
/// preferentially; the drop is logged rather than failing the turn.
pub fn flatten_tools<'a, I>(entries: I, max_tools: usize) -> Vec<CanonicalTool>
where
    I: IntoIterator<Item = (&'a Endpoint, &'a [ToolDescriptor])>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut tools: Vec<(CanonicalTool, bool)> = Vec::new();

    for (endpoint, descriptors) in entries {
        for descriptor in descriptors {
            let tool = canonicalize(descriptor);
            if !seen.insert(tool.name.clone()) {
                warn!(
                    "dropping duplicate qualified tool name '{}' from endpoint '{}'",
                    tool.name, endpoint.id
                );
                continue;
            }
            tools.push((tool, endpoint.quirks.connector));
        }
    }

    if tools.len() <= max_tools {
        return tools.into_iter().map(|(tool, _)| tool).collect();
    }

    let total = tools.len();
    let mut kept: Vec<CanonicalTool> = tools
        .iter()
        .filter(|(_, connector)| *connector)
        .map(|(tool, _)| tool.clone())
        .take(max_tools)
        .collect();
    for (tool, connector) in tools {
        if kept.len() >= max_tools {
            break;
        }
        if !connector {
            kept.push(tool);
        }
    }
    warn!(
        "tool budget exceeded: flattened {} tools, keeping {} (connector tools first)",
        total,
        kept.len()
    );
    kept
}
