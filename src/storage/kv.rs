use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::debug;

/// Key-value persistence contract shared by the task and recipe stores.
/// The backing store serializes operations per key.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrites any existing value (last-write-wins, no merge)
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys matching a glob-style pattern such as `task:*`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Redis-backed store
pub struct RedisKv {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to open Redis client for {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        debug!(redis_url, "Connected key-value store to Redis");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;

        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .context("Failed to read key from Redis")?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn.lock().await;

        match ttl_secs {
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl)
                    .arg(value)
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .context("Failed to write key with TTL to Redis")?;
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async::<_, ()>(&mut *conn)
                    .await
                    .context("Failed to write key to Redis")?;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;

        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to delete key from Redis")?;

        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut *conn)
            .await
            .context("Failed to list keys from Redis")?;

        Ok(keys)
    }
}

/// In-memory store for tests and single-process runs. TTLs are honored
/// on read.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if Utc::now() >= expires_at {
                    entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let expires_at = ttl_secs.map(|ttl| Utc::now() + Duration::seconds(ttl as i64));
        self.entries.lock().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let matches = match pattern.strip_suffix('*') {
            Some(prefix) => entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => entries
                .keys()
                .filter(|k| k.as_str() == pattern)
                .cloned()
                .collect(),
        };
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set("task:1", "{}", None).await.unwrap();
        assert_eq!(kv.get("task:1").await.unwrap().as_deref(), Some("{}"));

        kv.delete("task:1").await.unwrap();
        assert_eq!(kv.get("task:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_kv_overwrites_on_set() {
        let kv = MemoryKv::new();
        kv.set("recipe:example.com", "old", None).await.unwrap();
        kv.set("recipe:example.com", "new", None).await.unwrap();
        assert_eq!(
            kv.get("recipe:example.com").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn memory_kv_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("task:soon", "{}", Some(0)).await.unwrap();
        assert_eq!(kv.get("task:soon").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_kv_prefix_patterns() {
        let kv = MemoryKv::new();
        kv.set("task:1", "a", None).await.unwrap();
        kv.set("task:2", "b", None).await.unwrap();
        kv.set("recipe:x", "c", None).await.unwrap();

        let mut keys = kv.keys("task:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["task:1", "task:2"]);
    }
}
