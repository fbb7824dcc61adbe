// ==============================================================================
// cache.rs - Result Cache Contract and In-Memory Implementation
// ==============================================================================
// Description: Key/value store for cached run data and output with expiry
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::TaskError;

/// TTL for cached task data and output blobs (24 hours).
pub const TASK_CACHE_TTL_SECS: u64 = 86_400;

/// Key/value store mapping run data and output to JSON-safe blobs.
///
/// Keys are derived deterministically from the run identity
/// (`TaskData::<id>` / `TaskOutput::<id>`). Implementations must provide
/// atomic per-key writes; the pipeline does no locking of its own.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), TaskError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, TaskError>;

    async fn exists(&self, key: &str) -> Result<bool, TaskError>;

    async fn delete(&self, key: &str) -> Result<(), TaskError>;
}

/// In-process cache used by the CLI and tests. Entries expire lazily on
/// read, matching the backend cache's TTL behaviour.
#[derive(Default)]
pub struct InMemoryResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), TaskError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| TaskError::Cache(format!("cache lock poisoned: {}", e)))?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        debug!("Cached key {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TaskError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| TaskError::Cache(format!("cache lock poisoned: {}", e)))?;
        if let Some(entry) = entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entries[key].value.clone()));
        }
        Ok(None)
    }

    async fn exists(&self, key: &str) -> Result<bool, TaskError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), TaskError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| TaskError::Cache(format!("cache lock poisoned: {}", e)))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_exists_delete() {
        let cache = InMemoryResultCache::new();
        let key = "TaskData::test";
        assert!(!cache.exists(key).await.unwrap());

        cache.set(key, &json!({"a": 1}), None).await.unwrap();
        assert!(cache.exists(key).await.unwrap());
        assert_eq!(cache.get(key).await.unwrap(), Some(json!({"a": 1})));

        cache.delete(key).await.unwrap();
        assert!(!cache.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry() {
        let cache = InMemoryResultCache::new();
        cache
            .set("k", &json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
    }
}
