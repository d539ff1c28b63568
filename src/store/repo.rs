use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// A key written through a [`KvStore`]. `new_value` is `None` on removal.
#[derive(Debug, Clone, PartialEq)]
pub struct KvChange {
    pub key: String,
    pub new_value: Option<Value>,
}

/// Persisted key-value store shared by every component. Each call is atomic
/// on its own; callers doing read-modify-write on one key get no extra
/// locking.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Writes made through this handle, delivered after they are durable.
    fn subscribe(&self) -> broadcast::Receiver<KvChange>;
}

pub fn get_as<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get(key)? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub fn set_as<T: Serialize>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    kv.set(key, serde_json::to_value(value)?)
}

pub(crate) fn change_feed() -> broadcast::Sender<KvChange> {
    broadcast::channel(64).0
}

/// Non-persistent store for tests and embedders that bring their own storage.
pub struct MemoryKv {
    map: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<KvChange>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            changes: change_feed(),
        }
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        let _ = self.changes.send(KvChange {
            key: key.to_string(),
            new_value: Some(value),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let _ = self.changes.send(KvChange {
            key: key.to_string(),
            new_value: None,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvChange> {
        self.changes.subscribe()
    }
}
