//! Persistent key-value store contract.
//!
//! The store is the only state that survives between wakes. Values are JSON,
//! writes are last-writer-wins per key, and there are no cross-key
//! transactions: each entity lives under its own key (see [`keys`]).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::BoxFuture;

/// Well-known store keys.
pub mod keys {
    pub const OAUTH_TOKEN: &str = "oauth_token";
    pub const TOKEN_EXPIRY: &str = "token_expiry";
    pub const AUTH_IN_PROGRESS: &str = "auth_in_progress";
    pub const UPCOMING_EVENTS: &str = "upcoming_events";
    pub const PROCESSED_EVENT_IDS: &str = "processed_event_ids";
    pub const SETTINGS: &str = "settings";
    pub const LAST_REFRESH_ATTEMPT: &str = "last_refresh_attempt";
    pub const REFRESH_ATTEMPT_COUNT: &str = "refresh_attempt_count";
    pub const AUTHENTICATING: &str = "authenticating";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const SCHEDULED_ALARMS: &str = "scheduled_alarms";
    pub const LAST_POLL: &str = "last_poll";
    pub const LAST_ERROR: &str = "last_error";
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Store failures. `Clone` so they can be shared by joined single-flight callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    #[error("stored value for `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable key-value storage.
///
/// `get` returns only the keys that exist. `set` replaces each given key
/// wholesale. `remove` ignores missing keys.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<HashMap<String, Value>>>;

    fn set(&self, entries: HashMap<String, Value>) -> BoxFuture<'_, StoreResult<()>>;

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<()>>;
}

/// Reads and decodes one key. A value that fails to decode is reported as corrupt.
pub async fn read<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StoreResult<Option<T>> {
    let mut values = store.get(&[key]).await?;
    match values.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::corrupt(key, e)),
    }
}

/// Encodes and writes one key.
pub async fn write<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let value = serde_json::to_value(value)?;
    store.set(HashMap::from([(key.to_string(), value)])).await
}

/// In-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key, for assertions.
    pub async fn dump(&self) -> HashMap<String, Value> {
        self.data.lock().await.clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<HashMap<String, Value>>> {
        Box::pin(async move {
            let data = self.data.lock().await;
            Ok(keys
                .iter()
                .filter_map(|k| data.get(*k).map(|v| ((*k).to_string(), v.clone())))
                .collect())
        })
    }

    fn set(&self, entries: HashMap<String, Value>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.data.lock().await.extend(entries);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, keys: &'a [&'a str]) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut data = self.data.lock().await;
            for key in keys {
                data.remove(*key);
            }
            Ok(())
        })
    }
}
