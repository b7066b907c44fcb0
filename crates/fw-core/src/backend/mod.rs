//! Durable storage tier.
//!
//! The engine keeps its live state in memory; the durable tier carries
//! the data that must outlive a process restart: the device registry,
//! daily rollups and session history. The [`DurableBackend`] trait is
//! object-safe so the store holds it as `Arc<dyn DurableBackend>`, with
//! a Redis implementation for production and an in-memory one for tests
//! and volatile-only deployments.

mod memory;
mod redis;

pub use memory::MemoryBackend;
pub use redis::{RedisBackend, RedisBackendConfig};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;

/// Errors from the durable tier.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection establishment or pool failures.
    #[error("backend connection error: {0}")]
    Connection(String),

    /// A command was sent and failed.
    #[error("backend operation failed: {0}")]
    Operation(String),

    /// Stored payload could not be decoded.
    #[error("backend serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Operations the engine needs from durable storage.
///
/// Implementations must be thread-safe. A TTL of `Duration::ZERO` means
/// the entry never expires.
#[async_trait]
pub trait DurableBackend: Send + Sync + 'static {
    /// Gets a string value by key.
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Sets a string value with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// Deletes a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Sets one field of a hash, refreshing the hash TTL.
    async fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration)
        -> BackendResult<()>;

    /// Reads all fields of a hash.
    async fn hash_get_all(&self, key: &str) -> BackendResult<Vec<(String, String)>>;

    /// Adds a scored member to a sorted set, refreshing the set TTL.
    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Duration) -> BackendResult<()>;

    /// Members of a sorted set with scores within `[min, max]`.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> BackendResult<Vec<String>>;

    /// Trims a sorted set to its highest-ranked members, keeping `keep`.
    async fn ztrim(&self, key: &str, keep: usize) -> BackendResult<()>;

    /// Increments a counter, returning the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> BackendResult<i64>;

    /// Keys matching a glob pattern.
    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>>;

    /// Publishes a message to a channel. Fire and forget.
    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()>;
}

/// The storage tier a store runs with.
///
/// Construction decides the variant once; the rest of the engine never
/// re-checks connectivity or falls back mid-flight.
#[derive(Clone)]
pub enum Tier {
    /// Durable tier available; volatile state is still authoritative for
    /// live detections.
    Durable(Arc<dyn DurableBackend>),
    /// No durable tier; everything lives and dies with the process.
    VolatileOnly,
}

impl Tier {
    /// Picks the tier from engine configuration: a Redis URL selects the
    /// durable tier, its absence the volatile one. An unreachable server
    /// degrades to volatile-only with a warning rather than failing
    /// startup.
    pub async fn from_config(config: &EngineConfig) -> Self {
        let Some(url) = &config.redis_url else {
            return Tier::VolatileOnly;
        };
        let backend_config =
            RedisBackendConfig::new(url.as_str()).with_key_prefix(config.key_prefix.as_str());
        match RedisBackend::new(backend_config).await {
            Ok(backend) => Tier::Durable(Arc::new(backend)),
            Err(err) => {
                warn!(error = %err, "durable tier unavailable, running volatile-only");
                Tier::VolatileOnly
            }
        }
    }

    /// The backend, when this tier has one.
    pub fn durable(&self) -> Option<&Arc<dyn DurableBackend>> {
        match self {
            Tier::Durable(backend) => Some(backend),
            Tier::VolatileOnly => None,
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, Tier::Durable(_))
    }
}

impl std::fmt::Debug for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Durable(_) => f.write_str("Tier::Durable"),
            Tier::VolatileOnly => f.write_str("Tier::VolatileOnly"),
        }
    }
}
