//! Redis durable backend.
//!
//! Production implementation of [`DurableBackend`] over a
//! `deadpool-redis` pool. All keys are namespaced with a configurable
//! prefix so several engines can share one Redis instance. The
//! connection is verified with a PING at construction time; after that
//! individual command failures surface as [`BackendError`] and the
//! caller decides whether to degrade.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

use super::{BackendError, BackendResult, DurableBackend};

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Prefix applied to every key.
    pub key_prefix: String,
}

impl RedisBackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 16,
            key_prefix: "fw".to_string(),
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self::new("redis://localhost:6379")
    }
}

/// Redis-backed implementation of [`DurableBackend`].
pub struct RedisBackend {
    pool: Pool,
    config: RedisBackendConfig,
}

impl RedisBackend {
    /// Connects to Redis and verifies the connection with a PING.
    pub async fn new(config: RedisBackendConfig) -> Result<Self, BackendError> {
        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| BackendError::Connection(format!("failed to create pool config: {e}")))?
            .max_size(config.max_connections as usize)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BackendError::Connection(format!("failed to build pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| BackendError::Connection(format!("failed to get connection: {e}")))?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| BackendError::Connection(format!("redis PING failed: {e}")))?;

        Ok(Self { pool, config })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    async fn get_conn(&self) -> Result<deadpool_redis::Connection, BackendError> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::Connection(format!("failed to get connection: {e}")))
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

#[async_trait]
impl DurableBackend for RedisBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        conn.get(self.full_key(key))
            .await
            .map_err(|e| BackendError::Operation(format!("redis GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.get_conn().await?;
        if ttl.is_zero() {
            let _: () = conn
                .set(&full_key, value)
                .await
                .map_err(|e| BackendError::Operation(format!("redis SET failed: {e}")))?;
        } else {
            let _: () = conn
                .set_ex(&full_key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| BackendError::Operation(format!("redis SETEX failed: {e}")))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i32 = conn
            .del(self.full_key(key))
            .await
            .map_err(|e| BackendError::Operation(format!("redis DEL failed: {e}")))?;
        Ok(deleted > 0)
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.get_conn().await?;
        let mut pipe = redis::pipe();
        pipe.hset(&full_key, field, value);
        if !ttl.is_zero() {
            pipe.expire(&full_key, ttl.as_secs().max(1) as i64);
        }
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| BackendError::Operation(format!("redis HSET failed: {e}")))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> BackendResult<Vec<(String, String)>> {
        let mut conn = self.get_conn().await?;
        conn.hgetall(self.full_key(key))
            .await
            .map_err(|e| BackendError::Operation(format!("redis HGETALL failed: {e}")))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Duration) -> BackendResult<()> {
        let full_key = self.full_key(key);
        let mut conn = self.get_conn().await?;
        let mut pipe = redis::pipe();
        pipe.zadd(&full_key, member, score);
        if !ttl.is_zero() {
            pipe.expire(&full_key, ttl.as_secs().max(1) as i64);
        }
        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| BackendError::Operation(format!("redis ZADD failed: {e}")))?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> BackendResult<Vec<String>> {
        let mut conn = self.get_conn().await?;
        conn.zrangebyscore(self.full_key(key), min, max)
            .await
            .map_err(|e| BackendError::Operation(format!("redis ZRANGEBYSCORE failed: {e}")))
    }

    async fn ztrim(&self, key: &str, keep: usize) -> BackendResult<()> {
        let mut conn = self.get_conn().await?;
        // Keep the `keep` highest-ranked members.
        let stop = -(keep as isize) - 1;
        let _: () = conn
            .zremrangebyrank(self.full_key(key), 0, stop)
            .await
            .map_err(|e| BackendError::Operation(format!("redis ZREMRANGEBYRANK failed: {e}")))?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> BackendResult<i64> {
        let full_key = self.full_key(key);
        let mut conn = self.get_conn().await?;
        let value: i64 = conn
            .incr(&full_key, 1)
            .await
            .map_err(|e| BackendError::Operation(format!("redis INCR failed: {e}")))?;
        if !ttl.is_zero() {
            let _: bool = conn
                .expire(&full_key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| BackendError::Operation(format!("redis EXPIRE failed: {e}")))?;
        }
        Ok(value)
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let full_pattern = self.full_key(pattern);
        let prefix_len = self.config.key_prefix.len() + 1;
        let mut conn = self.get_conn().await?;

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .map_err(|e| BackendError::Operation(format!("redis SCAN failed: {e}")))?;
            keys.extend(batch.into_iter().map(|k| k[prefix_len..].to_string()));
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .publish(channel, message)
            .await
            .map_err(|e| BackendError::Operation(format!("redis PUBLISH failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that require a running Redis instance are marked #[ignore].
    /// Run them with: cargo test --package fw-core backend::redis -- --ignored

    fn test_config() -> RedisBackendConfig {
        RedisBackendConfig::new("redis://localhost:6379").with_key_prefix("fw:test")
    }

    #[test]
    fn test_config_builder() {
        let config = RedisBackendConfig::new("redis://custom:6380")
            .with_max_connections(32)
            .with_key_prefix("custom");
        assert_eq!(config.url, "redis://custom:6380");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.key_prefix, "custom");
    }

    #[test]
    fn test_config_default() {
        let config = RedisBackendConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.key_prefix, "fw");
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_connection() {
        let backend = RedisBackend::new(test_config()).await;
        assert!(backend.is_ok(), "should connect: {:?}", backend.err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_set_get_delete() {
        let backend = RedisBackend::new(test_config()).await.unwrap();
        let _ = backend.delete("basic").await;

        backend.set("basic", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("basic").await.unwrap(), Some("v".to_string()));
        assert!(backend.delete("basic").await.unwrap());
        assert_eq!(backend.get("basic").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_hash() {
        let backend = RedisBackend::new(test_config()).await.unwrap();
        let _ = backend.delete("h").await;

        backend.hash_set("h", "f1", "v1", Duration::from_secs(60)).await.unwrap();
        backend.hash_set("h", "f2", "v2", Duration::from_secs(60)).await.unwrap();
        let mut fields = backend.hash_get_all("h").await.unwrap();
        fields.sort();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], ("f1".to_string(), "v1".to_string()));

        backend.delete("h").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_zset() {
        let backend = RedisBackend::new(test_config()).await.unwrap();
        let _ = backend.delete("z").await;

        backend.zadd("z", "a", 1.0, Duration::from_secs(60)).await.unwrap();
        backend.zadd("z", "b", 2.0, Duration::from_secs(60)).await.unwrap();
        backend.zadd("z", "c", 3.0, Duration::from_secs(60)).await.unwrap();

        let mid = backend.zrange_by_score("z", 1.5, 2.5).await.unwrap();
        assert_eq!(mid, vec!["b".to_string()]);

        backend.ztrim("z", 2).await.unwrap();
        let all = backend.zrange_by_score("z", 0.0, 10.0).await.unwrap();
        assert_eq!(all, vec!["b".to_string(), "c".to_string()]);

        backend.delete("z").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_scan() {
        let backend = RedisBackend::new(test_config()).await.unwrap();
        backend.set("scan:a", "1", Duration::from_secs(60)).await.unwrap();
        backend.set("scan:b", "1", Duration::from_secs(60)).await.unwrap();

        let keys = backend.scan_keys("scan:*").await.unwrap();
        assert_eq!(keys, vec!["scan:a".to_string(), "scan:b".to_string()]);

        backend.delete("scan:a").await.unwrap();
        backend.delete("scan:b").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_backend_incr() {
        let backend = RedisBackend::new(test_config()).await.unwrap();
        let _ = backend.delete("counter").await;

        assert_eq!(backend.incr("counter", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(backend.incr("counter", Duration::from_secs(60)).await.unwrap(), 2);

        backend.delete("counter").await.unwrap();
    }
}
