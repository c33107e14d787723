//! `${...}` placeholders in step arguments and agent configs.
//!
//! - `${input.<path>}` reads the execution input.
//! - `${steps.<id>.output[.<path>]}` reads an upstream step's output.
//!
//! A string that is exactly one placeholder becomes the referenced JSON
//! value; placeholders embedded in longer strings are substituted as text.
//! Unresolvable references become `null` (or the empty string inline).

use std::sync::OnceLock;

use regex::Regex;

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok()).as_ref()
}

/// Walk a dotted path (`a.b.0.c`) into a JSON value.
pub fn lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => {
                segment.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        })
}

/// Resolve one placeholder expression against the context
/// `{ "input": ..., "steps": { "<id>": { "output": ... } } }`.
fn resolve_expr(context: &serde_json::Value, expr: &str) -> serde_json::Value {
    lookup(context, expr.trim()).cloned().unwrap_or(serde_json::Value::Null)
}

fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_str(template: &str, context: &serde_json::Value) -> serde_json::Value {
    let Some(re) = placeholder() else {
        return serde_json::Value::String(template.to_string());
    };

    if let Some(caps) = re.captures(template) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(template.len()) {
            return resolve_expr(context, &caps[1]);
        }
    } else {
        return serde_json::Value::String(template.to_string());
    }

    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        as_text(&resolve_expr(context, &caps[1]))
    });
    serde_json::Value::String(rendered.into_owned())
}

/// Resolve every string leaf of `value`.
pub fn resolve(value: &serde_json::Value, context: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => resolve_str(s, context),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve(v, context)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}
