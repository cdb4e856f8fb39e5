//! Bounded per-execution context map.
//!
//! Durable state sits behind the [`ExternalStore`] trait, with only an
//! in-memory implementation shipped in-crate: it stands in for an
//! out-of-tree large-object store, and [`InMemoryExternalStore`] is the
//! reference implementation used by tests and single-process embeddings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ContextLimits;
use crate::error::{EngineError, ErrorCode};

/// Opaque marker left in context in place of an externally-stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRef {
    #[serde(rename = "_ref")]
    pub reference: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<Utc>,
}

fn is_external_ref(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key("_ref") && map.get("_ref").map(Value::is_string).unwrap_or(false))
}

/// Out-of-line large-object store for context values that exceed the
/// inline threshold. A production deployment backs this with object
/// storage; the in-memory implementation below is the reference.
pub trait ExternalStore: Send + Sync {
    fn put(&self, reference: &str, value: Value);
    fn get(&self, reference: &str) -> Option<Value>;
}

/// Reference [`ExternalStore`] backed by a process-local map.
#[derive(Default)]
pub struct InMemoryExternalStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl ExternalStore for InMemoryExternalStore {
    fn put(&self, reference: &str, value: Value) {
        self.values.write().insert(reference.to_string(), value);
    }

    fn get(&self, reference: &str) -> Option<Value> {
        self.values.read().get(reference).cloned()
    }
}

/// Where a `set` should place a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tier {
    #[default]
    Auto,
    Inline,
    External,
}

fn byte_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 1,
    }
}

/// Bounded key/value map carried by an [`crate::execution::model::Execution`].
///
/// `set` enforces per-value size, nesting depth, key-count and total-size
/// limits before committing a mutation, and transparently spills large
/// values to an [`ExternalStore`] when one is configured.
pub struct Context {
    values: BTreeMap<String, Value>,
    limits: ContextLimits,
    external: Option<Arc<dyn ExternalStore>>,
    ref_counter: AtomicU64,
}

impl Context {
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            values: BTreeMap::new(),
            limits,
            external: None,
            ref_counter: AtomicU64::new(0),
        }
    }

    pub fn with_external_store(mut self, store: Arc<dyn ExternalStore>) -> Self {
        self.external = Some(store);
        self
    }

    pub fn from_map(map: BTreeMap<String, Value>, limits: ContextLimits) -> Self {
        Self {
            values: map,
            limits,
            external: None,
            ref_counter: AtomicU64::new(0),
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.values
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Reads a value, transparently dereferencing an [`ExternalRef`] marker.
    pub fn get(&self, key: &str) -> Option<Value> {
        let raw = self.values.get(key)?;
        if is_external_ref(raw) {
            let reference = raw.get("_ref")?.as_str()?;
            return self.external.as_ref().and_then(|s| s.get(reference));
        }
        Some(raw.clone())
    }

    pub fn get_all(&self, keys: &[String]) -> BTreeMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Validates and applies a mutation. See module docs for the exact
    /// order of checks (value size, depth, key count, total size).
    pub fn set(&mut self, key: &str, value: Value, tier: Tier) -> Result<(), EngineError> {
        let value_size = byte_size(&value);
        if value_size > self.limits.max_value_size {
            return Err(EngineError::new(
                ErrorCode::ContextValueTooLarge,
                format!(
                    "value for '{key}' is {value_size} bytes, exceeds limit of {}",
                    self.limits.max_value_size
                ),
            ));
        }

        let value_depth = depth(&value);
        if value_depth > self.limits.max_depth {
            return Err(EngineError::new(
                ErrorCode::ContextNestingLimit,
                format!(
                    "value for '{key}' nests {value_depth} levels deep, exceeds limit of {}",
                    self.limits.max_depth
                ),
            ));
        }

        let is_new_key = !self.values.contains_key(key);
        if is_new_key && self.values.len() >= self.limits.max_keys {
            return Err(EngineError::new(
                ErrorCode::ContextKeyLimit,
                format!("context already holds {} keys", self.limits.max_keys),
            ));
        }

        let old_size = self.values.get(key).map(byte_size).unwrap_or(0);
        let current_total: usize = self.values.values().map(byte_size).sum();
        let projected_total = current_total - old_size + value_size;
        if projected_total > self.limits.max_total_size {
            return Err(EngineError::new(
                ErrorCode::ContextSizeLimit,
                format!(
                    "setting '{key}' would bring context to {projected_total} bytes, exceeds limit of {}",
                    self.limits.max_total_size
                ),
            ));
        }

        let force_external = tier == Tier::External;
        let should_externalize =
            force_external || (tier == Tier::Auto && value_size >= self.limits.inline_threshold);

        if should_externalize {
            if let Some(store) = &self.external {
                let n = self.ref_counter.fetch_add(1, Ordering::Relaxed);
                let reference = format!("storage://{key}/{n}");
                store.put(&reference, value);
                let marker = ExternalRef {
                    reference,
                    size: value_size,
                    r#type: None,
                    created_at: Utc::now(),
                };
                self.values
                    .insert(key.to_string(), serde_json::to_value(marker).unwrap());
                return Ok(());
            }
        }

        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Sets a dot-path key (e.g. `a.b.c`), creating intermediate objects.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), EngineError> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.len() == 1 {
            return self.set(parts[0], value, Tier::Auto);
        }

        let root_key = parts[0];
        let mut root = self.get(root_key).unwrap_or(Value::Object(Default::default()));
        set_nested(&mut root, &parts[1..], value);
        self.set(root_key, root, Tier::Auto)
    }
}

fn set_nested(target: &mut Value, path: &[&str], value: Value) {
    if path.is_empty() {
        *target = value;
        return;
    }
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let map = target.as_object_mut().unwrap();
    let entry = map
        .entry(path[0].to_string())
        .or_insert(Value::Object(Default::default()));
    set_nested(entry, &path[1..], value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new(ContextLimits::default())
    }

    #[test]
    fn set_and_get_round_trips() {
        let mut c = ctx();
        c.set("a", json!(1), Tier::Auto).unwrap();
        assert_eq!(c.get("a"), Some(json!(1)));
        assert!(c.has("a"));
        assert!(!c.has("b"));
    }

    #[test]
    fn rejects_oversized_value() {
        let mut c = Context::new(ContextLimits {
            max_value_size: 4,
            ..ContextLimits::default()
        });
        let err = c.set("a", json!("way too big"), Tier::Auto).unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextValueTooLarge);
    }

    #[test]
    fn rejects_when_key_limit_reached() {
        let mut c = Context::new(ContextLimits {
            max_keys: 1,
            ..ContextLimits::default()
        });
        c.set("a", json!(1), Tier::Auto).unwrap();
        let err = c.set("b", json!(2), Tier::Auto).unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextKeyLimit);
        // Overwriting an existing key never counts as a new key.
        c.set("a", json!(3), Tier::Auto).unwrap();
    }

    #[test]
    fn rejects_when_total_size_exceeded() {
        let mut c = Context::new(ContextLimits {
            max_total_size: 10,
            max_value_size: 10,
            ..ContextLimits::default()
        });
        c.set("a", json!("12345"), Tier::Auto).unwrap();
        let err = c.set("b", json!("12345"), Tier::Auto).unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextSizeLimit);
    }

    #[test]
    fn rejects_excess_nesting_depth() {
        let mut c = Context::new(ContextLimits {
            max_depth: 2,
            ..ContextLimits::default()
        });
        let err = c
            .set("a", json!({"b": {"c": {"d": 1}}}), Tier::Auto)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextNestingLimit);
    }

    #[test]
    fn externalizes_large_values_when_store_configured() {
        let store = Arc::new(InMemoryExternalStore::default());
        let mut c = Context::new(ContextLimits {
            inline_threshold: 4,
            ..ContextLimits::default()
        })
        .with_external_store(store);
        c.set("big", json!("0123456789"), Tier::Auto).unwrap();
        let raw = c.as_map().get("big").unwrap();
        assert!(is_external_ref(raw));
        assert_eq!(c.get("big"), Some(json!("0123456789")));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut c = ctx();
        c.set_path("result.nested.value", json!(42)).unwrap();
        assert_eq!(
            c.get("result"),
            Some(json!({"nested": {"value": 42}}))
        );
    }
}
