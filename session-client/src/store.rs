use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::claims::{self, Claims};
use crate::error::SessionResult;

/// Persistent key-value slot the host environment provides.
///
/// Mirrors the semantics of a browser-style storage area: reads that fail
/// behave as missing entries and writes are best-effort. The session survives
/// without its storage; storage never survives without the session.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn remove(&self, key: &str);
}

// ---------------- In-Memory Implementation ----------------

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().expect("store mutex poisoned");
        guard.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        guard.insert(key.to_string(), value.to_string());
    }

    async fn remove(&self, key: &str) {
        let mut guard = self.inner.lock().expect("store mutex poisoned");
        guard.remove(key);
    }
}

// ---------------- File-Backed Implementation ----------------

/// Single-file JSON map, for hosts without a native storage area.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles against the same file.
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_map(&self) -> HashMap<String, String> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), %err, "discarding unreadable session store file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    async fn write_map(&self, map: &HashMap<String, String>) {
        let bytes = match serde_json::to_vec(map) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to serialize session store");
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.path, bytes).await {
            warn!(path = %self.path.display(), %err, "failed to persist session store");
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().await;
        self.read_map().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map).await;
    }

    async fn remove(&self, key: &str) {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await;
        if map.remove(key).is_some() {
            self.write_map(&map).await;
        }
    }
}

// ---------------- Token Store ----------------

/// Persists the raw access token under a fixed key, with a parallel RFC3339
/// expiry hint so hosts can inspect freshness without decoding the token.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    fn hint_key(&self) -> String {
        format!("{}.expires_at", self.key)
    }

    /// Idempotent: saving the same token twice leaves one entry.
    pub async fn save(&self, token: &str, expires_at: Option<DateTime<Utc>>) {
        self.store.set(&self.key, token).await;
        match expires_at {
            Some(expires_at) => {
                self.store
                    .set(&self.hint_key(), &expires_at.to_rfc3339())
                    .await;
            }
            None => self.store.remove(&self.hint_key()).await,
        }
    }

    pub async fn load(&self) -> Option<String> {
        self.store.get(&self.key).await
    }

    pub async fn expiry_hint(&self) -> Option<DateTime<Utc>> {
        let raw = self.store.get(&self.hint_key()).await?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    pub async fn clear(&self) {
        self.store.remove(&self.key).await;
        self.store.remove(&self.hint_key()).await;
    }

    /// Structural decode of a token's claims; see [`claims::decode_unverified`].
    pub fn decode(&self, token: &str) -> SessionResult<Claims> {
        claims::decode_unverified(token)
    }
}
