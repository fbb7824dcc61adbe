// ==============================================================================
// cache.rs - Redis Result Cache
// ==============================================================================
// Description: Redis-backed implementation of the pipeline's result cache
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;

use metabo_processor::cache::ResultCache;
use metabo_processor::errors::TaskError;

/// Result cache backed by Redis. Values are stored as JSON strings with a
/// per-key TTL via SET EX.
pub struct RedisResultCache {
    conn: ConnectionManager,
}

impl RedisResultCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn map_err(e: redis::RedisError) -> TaskError {
        TaskError::Cache(e.to_string())
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), TaskError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, payload, ttl.as_secs())
                .await
                .map_err(Self::map_err),
            None => conn
                .set::<_, _, ()>(key, payload)
                .await
                .map_err(Self::map_err),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, TaskError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(Self::map_err)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, TaskError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(Self::map_err)
    }

    async fn delete(&self, key: &str) -> Result<(), TaskError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(Self::map_err)
    }
}
