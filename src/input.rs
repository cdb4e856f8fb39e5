//! Input selector DSL: a pure function from `(selector, context)` to the
//! value a handler receives. No state, no I/O, kept separate from
//! [`crate::context::Context`] so it can be unit tested in isolation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Selects a handler's input from the execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSelector {
    Key { key: String },
    Keys { keys: Vec<String> },
    Path { path: String },
    Template { template: Value },
    Full { full: bool },
    Static { r#static: Value },
}

fn navigate<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = context.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

const WHOLE_EXPR_PREFIX: &str = "${";

fn is_whole_expression(s: &str) -> Option<&str> {
    let rest = s.strip_prefix(WHOLE_EXPR_PREFIX)?;
    let path = rest.strip_suffix('}')?;
    if path.contains("${") {
        return None;
    }
    Some(path)
}

/// Recursively interpolates `${path}` expressions in strings found anywhere
/// inside `template` against `context`. A string that consists of exactly
/// one `${path}` expression resolves to the raw (possibly non-string)
/// value; any other string has every `${path}` occurrence substituted with
/// its stringified value (undefined paths become the empty string).
fn interpolate(template: &Value, context: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            if let Some(path) = is_whole_expression(s) {
                return navigate(context, path).cloned().unwrap_or(Value::Null);
            }
            let mut result = String::with_capacity(s.len());
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                result.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                if let Some(end) = after.find('}') {
                    let path = &after[..end];
                    let resolved = navigate(context, path).map(stringify).unwrap_or_default();
                    result.push_str(&resolved);
                    rest = &after[end + 1..];
                } else {
                    result.push_str("${");
                    rest = after;
                    break;
                }
            }
            result.push_str(rest);
            Value::String(result)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| interpolate(v, context)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves `selector` against `context`, producing the value a handler's
/// `execute` receives as input.
pub fn resolve(selector: &InputSelector, context: &BTreeMap<String, Value>) -> Value {
    let context: Map<String, Value> = context.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    match selector {
        InputSelector::Key { key } => context.get(key).cloned().unwrap_or(Value::Null),
        InputSelector::Keys { keys } => {
            let mut out = Map::new();
            for key in keys {
                if let Some(v) = context.get(key) {
                    out.insert(key.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        InputSelector::Path { path } => navigate(&context, path).cloned().unwrap_or(Value::Null),
        InputSelector::Template { template } => interpolate(template, &context),
        InputSelector::Full { full } => {
            if *full {
                Value::Object(context)
            } else {
                Value::Null
            }
        }
        InputSelector::Static { r#static } => r#static.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("message".to_string(), json!("hello"));
        m.insert("user".to_string(), json!({"name": "ada", "age": 30}));
        m
    }

    #[test]
    fn key_selector_reads_top_level() {
        let v = resolve(&InputSelector::Key { key: "message".into() }, &ctx());
        assert_eq!(v, json!("hello"));
    }

    #[test]
    fn key_selector_missing_is_null() {
        let v = resolve(&InputSelector::Key { key: "missing".into() }, &ctx());
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn keys_selector_projects() {
        let v = resolve(
            &InputSelector::Keys {
                keys: vec!["message".into(), "missing".into()],
            },
            &ctx(),
        );
        assert_eq!(v, json!({"message": "hello"}));
    }

    #[test]
    fn path_selector_navigates_dots() {
        let v = resolve(&InputSelector::Path { path: "user.name".into() }, &ctx());
        assert_eq!(v, json!("ada"));
    }

    #[test]
    fn full_selector_copies_context() {
        let v = resolve(&InputSelector::Full { full: true }, &ctx());
        assert_eq!(v["message"], json!("hello"));
    }

    #[test]
    fn static_selector_ignores_context() {
        let v = resolve(&InputSelector::Static { r#static: json!(42) }, &ctx());
        assert_eq!(v, json!(42));
    }

    #[test]
    fn template_whole_expression_preserves_type() {
        let v = resolve(
            &InputSelector::Template {
                template: json!("${user.age}"),
            },
            &ctx(),
        );
        assert_eq!(v, json!(30));
    }

    #[test]
    fn template_mixed_string_interpolates() {
        let v = resolve(
            &InputSelector::Template {
                template: json!("hi ${user.name}, you said ${message}"),
            },
            &ctx(),
        );
        assert_eq!(v, json!("hi ada, you said hello"));
    }

    #[test]
    fn template_undefined_path_becomes_empty_string() {
        let v = resolve(
            &InputSelector::Template {
                template: json!("value: ${nope}"),
            },
            &ctx(),
        );
        assert_eq!(v, json!("value: "));
    }

    #[test]
    fn template_recurses_into_nested_structures() {
        let v = resolve(
            &InputSelector::Template {
                template: json!({"greeting": "hi ${user.name}", "raw": "${message}"}),
            },
            &ctx(),
        );
        assert_eq!(v, json!({"greeting": "hi ada", "raw": "hello"}));
    }
}
