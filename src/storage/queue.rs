use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::debug;

const PENDING_KEY: &str = "scraper:pending";

/// FIFO queue of task ids awaiting a worker
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task_id: &str) -> Result<()>;

    async fn pop(&self) -> Result<Option<String>>;

    async fn len(&self) -> Result<usize>;
}

/// Redis list-backed queue shared by every worker process
pub struct RedisQueue {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to open Redis client for {}", redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, task_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(PENDING_KEY)
            .arg(task_id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task id to Redis queue")?;

        debug!(task_id, "Queued task");
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;

        let task_id: Option<String> = redis::cmd("RPOP")
            .arg(PENDING_KEY)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop task id from Redis queue")?;

        Ok(task_id)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;

        let count: usize = redis::cmd("LLEN")
            .arg(PENDING_KEY)
            .query_async(&mut *conn)
            .await
            .context("Failed to get Redis queue length")?;

        Ok(count)
    }
}

/// In-process queue for tests and single-process runs
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, task_id: &str) -> Result<()> {
        self.pending.lock().await.push_back(task_id.to_string());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        Ok(self.pending.lock().await.pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.pending.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        queue.push("a").await.unwrap();
        queue.push("b").await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop().await.unwrap(), None);
    }
}
