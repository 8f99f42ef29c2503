//! Template-variable resolution for step inputs.
//!
//! Supports `{{name}}`, `{{name[i]}}`, and `{{name.field}}` anywhere inside
//! step input values, recursively through objects and arrays. Unknown names
//! resolve to the empty string with a warning; malformed template syntax is
//! left untouched. Resolution is idempotent over contexts whose values do
//! not themselves contain template markers.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::context::ExecutionContext;

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)(?:\[(\d+)\]|\.([A-Za-z_][A-Za-z0-9_]*))?\s*\}\}",
        )
        .unwrap()
    })
}

/// Resolve every template expression in a JSON value tree.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve templates inside one string. A string that is exactly one
/// template expression resolves to the referenced value itself (arrays and
/// objects survive); mixed text renders values inline.
pub fn resolve_string(input: &str, ctx: &ExecutionContext) -> Value {
    let re = template_re();

    if let Some(caps) = re.captures(input) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole == input.trim() {
            return lookup(&caps, ctx).unwrap_or_else(|| {
                warn_unresolved(input, ctx);
                Value::String(String::new())
            });
        }
    }

    let replaced = re.replace_all(input, |caps: &regex::Captures<'_>| {
        match lookup(caps, ctx) {
            Some(v) => render_inline(&v),
            None => {
                warn_unresolved(&caps[0], ctx);
                String::new()
            }
        }
    });
    Value::String(replaced.into_owned())
}

fn warn_unresolved(expr: &str, ctx: &ExecutionContext) {
    tracing::warn!(
        execution_id = %ctx.execution_id,
        expression = expr,
        "template variable not found, resolving to empty string"
    );
}

fn lookup(caps: &regex::Captures<'_>, ctx: &ExecutionContext) -> Option<Value> {
    let name = caps.get(1)?.as_str();
    let root = ctx.get(name)?;

    if let Some(index) = caps.get(2) {
        let idx: usize = index.as_str().parse().ok()?;
        return root.as_array()?.get(idx).cloned();
    }
    if let Some(field) = caps.get(3) {
        return root.get(field.as_str()).cloned();
    }
    Some(root.clone())
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
