pub mod kv;
pub mod queue;
pub mod tasks;

// Re-export common types
pub use kv::{KvBackend, MemoryKv, RedisKv};
pub use queue::{MemoryQueue, RedisQueue, TaskQueue};
pub use tasks::TaskStore;

use std::sync::Arc;

use anyhow::Result;

use crate::cli::config::StorageSettings;

/// Create the key-value backend selected by the configuration
pub async fn create_backend(settings: &StorageSettings) -> Result<Arc<dyn KvBackend>> {
    match settings.backend.as_str() {
        "redis" => {
            let backend = RedisKv::connect(&settings.redis_url).await?;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(MemoryKv::new())),
        other => {
            anyhow::bail!("Unsupported storage backend: {}", other);
        }
    }
}

/// Create the task queue matching the configured backend
pub async fn create_queue(settings: &StorageSettings) -> Result<Arc<dyn TaskQueue>> {
    match settings.backend.as_str() {
        "redis" => {
            let queue = RedisQueue::connect(&settings.redis_url).await?;
            Ok(Arc::new(queue))
        }
        "memory" => Ok(Arc::new(MemoryQueue::new())),
        other => {
            anyhow::bail!("Unsupported storage backend: {}", other);
        }
    }
}
