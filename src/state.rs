use std::sync::Arc;

use dashmap::DashMap;
use node_plugin::message::{lookup_property, root_key};
use serde_json::{Map, Value};

/// A flow- or global-scoped context store.
///
/// Keys are top-level names; lookups accept property expressions so
/// `settings.limits.max` reads into the value stored under `settings`.
#[derive(Debug, Default)]
pub struct ContextStore {
    values: DashMap<String, Value>,
}

impl ContextStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|kv| kv.key().clone()).collect()
    }

    /// Resolves a property expression against the store.
    pub fn get(&self, expr: &str) -> Option<Value> {
        let key = root_key(expr)?;
        let root = self.values.get(&key)?;
        let mut scratch = Map::new();
        scratch.insert(key, root.value().clone());
        drop(root);
        lookup_property(&scratch, expr).cloned()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}
