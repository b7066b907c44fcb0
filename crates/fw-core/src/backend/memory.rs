//! In-memory durable backend.
//!
//! Implements the full backend contract over tokio `RwLock`ed maps with
//! real TTL expiry, so engine behavior in tests matches the Redis
//! implementation. Published messages are recorded rather than sent,
//! which lets tests assert on change notifications.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{BackendResult, DurableBackend};

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()))
        };
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Utc::now() > t)
    }
}

/// In-memory implementation of [`DurableBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    strings: RwLock<HashMap<String, Entry<String>>>,
    hashes: RwLock<HashMap<String, Entry<HashMap<String, String>>>>,
    zsets: RwLock<HashMap<String, Entry<Vec<(String, f64)>>>>,
    counters: RwLock<HashMap<String, Entry<i64>>>,
    published: RwLock<Vec<(String, String)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, in order.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.read().await.clone()
    }

    /// Number of live string keys; test helper.
    pub async fn len(&self) -> usize {
        self.strings
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only the trailing-star form the engine uses.
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let map = self.strings.read().await;
        Ok(map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.strings
            .write()
            .await
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let existed = self.strings.write().await.remove(key).is_some();
        let hash_existed = self.hashes.write().await.remove(key).is_some();
        let zset_existed = self.zsets.write().await.remove(key).is_some();
        Ok(existed || hash_existed || zset_existed)
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendResult<()> {
        let mut map = self.hashes.write().await;
        match map.get_mut(key).filter(|e| !e.is_expired()) {
            Some(entry) => {
                entry.value.insert(field.to_string(), value.to_string());
                *entry = Entry::new(std::mem::take(&mut entry.value), ttl);
            }
            None => {
                let mut fields = HashMap::new();
                fields.insert(field.to_string(), value.to_string());
                map.insert(key.to_string(), Entry::new(fields, ttl));
            }
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> BackendResult<Vec<(String, String)>> {
        let map = self.hashes.read().await;
        Ok(map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| {
                e.value
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, ttl: Duration) -> BackendResult<()> {
        let mut map = self.zsets.write().await;
        let mut members = match map.remove(key).filter(|e| !e.is_expired()) {
            Some(entry) => entry.value,
            None => Vec::new(),
        };
        members.retain(|(m, _)| m != member);
        members.push((member.to_string(), score));
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        map.insert(key.to_string(), Entry::new(members, ttl));
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> BackendResult<Vec<String>> {
        let map = self.zsets.read().await;
        Ok(map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| {
                e.value
                    .iter()
                    .filter(|(_, s)| *s >= min && *s <= max)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ztrim(&self, key: &str, keep: usize) -> BackendResult<()> {
        let mut map = self.zsets.write().await;
        if let Some(entry) = map.get_mut(key).filter(|e| !e.is_expired()) {
            let len = entry.value.len();
            if len > keep {
                entry.value.drain(..len - keep);
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> BackendResult<i64> {
        let mut map = self.counters.write().await;
        let next = match map.get(key).filter(|e| !e.is_expired()) {
            Some(entry) => entry.value + 1,
            None => 1,
        };
        map.insert(key.to_string(), Entry::new(next, ttl));
        Ok(next)
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for (k, e) in self.strings.read().await.iter() {
            if !e.is_expired() && glob_match(pattern, k) {
                keys.push(k.clone());
            }
        }
        for (k, e) in self.hashes.read().await.iter() {
            if !e.is_expired() && glob_match(pattern, k) {
                keys.push(k.clone());
            }
        }
        for (k, e) in self.zsets.read().await.iter() {
            if !e.is_expired() && glob_match(pattern, k) {
                keys.push(k.clone());
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> BackendResult<()> {
        self.published
            .write()
            .await
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}
