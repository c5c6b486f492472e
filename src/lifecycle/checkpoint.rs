// src/lifecycle/checkpoint.rs
//! Checkpoints with an in-memory fallback
//!
//! Writes go to the durable [`CheckpointStore`] first. When that fails the
//! checkpoint lands in a bounded LRU cache instead, so a paused task can still
//! be resumed within this process while the store is degraded.

use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of a task's workflow state after a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,

    /// Number of steps completed when the snapshot was taken
    pub step: u64,

    /// Serialized workflow state
    pub state: serde_json::Value,

    /// Config the task was started with
    pub config: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        task_id: impl Into<String>,
        step: u64,
        state: serde_json::Value,
        config: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            step,
            state,
            config,
            created_at: Utc::now(),
        }
    }
}

/// Durable checkpoint storage. Any call may fail.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &str, checkpoint: &Checkpoint) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Checkpoint>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Where a checkpoint ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTier {
    Durable,
    Memory,
}

/// Durable store plus bounded memory fallback
pub struct FallbackCheckpoints {
    durable: Arc<dyn CheckpointStore>,
    cache: Mutex<LruCache<String, Checkpoint>>,
}

impl FallbackCheckpoints {
    pub fn new(durable: Arc<dyn CheckpointStore>, capacity: NonZeroUsize) -> Self {
        Self {
            durable,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Write a checkpoint, falling back to memory if the durable write fails
    pub async fn save(&self, checkpoint: Checkpoint) -> CheckpointTier {
        match self.durable.put(&checkpoint.task_id, &checkpoint).await {
            Ok(()) => {
                // durable copy supersedes any fallback entry
                self.cache.lock().pop(&checkpoint.task_id);
                debug!(
                    "Checkpoint for {} at step {} persisted",
                    checkpoint.task_id, checkpoint.step
                );
                CheckpointTier::Durable
            }
            Err(e) => {
                warn!(
                    "Checkpoint store degraded, caching {} step {} in memory: {}",
                    checkpoint.task_id, checkpoint.step, e
                );
                if let Some(evicted) = self.remember(checkpoint) {
                    debug!("Evicted cached checkpoint {}", evicted);
                }
                CheckpointTier::Memory
            }
        }
    }

    /// Cache a checkpoint, returning the task pushed out to make room
    ///
    /// Replacing a task's own older entry is not an eviction.
    fn remember(&self, checkpoint: Checkpoint) -> Option<String> {
        let task_id = checkpoint.task_id.clone();
        self.cache
            .lock()
            .push(task_id.clone(), checkpoint)
            .map(|(key, _)| key)
            .filter(|key| *key != task_id)
    }

    /// Latest checkpoint for a task from either tier
    pub async fn load(&self, task_id: &str) -> Option<Checkpoint> {
        let durable = match self.durable.get(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Failed to read checkpoint {} from store: {}", task_id, e);
                None
            }
        };
        let cached = self.cache.lock().get(task_id).cloned();

        match (durable, cached) {
            (Some(d), Some(c)) => Some(if c.step > d.step { c } else { d }),
            (d, c) => d.or(c),
        }
    }

    /// Whether the durable store holds a checkpoint for the task
    pub async fn has_durable(&self, task_id: &str) -> Result<bool> {
        Ok(self.durable.get(task_id).await?.is_some())
    }

    /// Whether either tier holds a checkpoint for the task
    pub async fn exists(&self, task_id: &str) -> bool {
        if self.cache.lock().contains(task_id) {
            return true;
        }
        matches!(self.durable.get(task_id).await, Ok(Some(_)))
    }

    pub fn cached(&self, task_id: &str) -> Option<Checkpoint> {
        self.cache.lock().peek(task_id).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop the memory entry of a finished task
    pub fn evict(&self, task_id: &str) {
        self.cache.lock().pop(task_id);
    }

    /// Drop both tiers for a task
    pub async fn discard(&self, task_id: &str) {
        self.evict(task_id);
        if let Err(e) = self.durable.delete(task_id).await {
            warn!("Failed to delete checkpoint {}: {}", task_id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::errors::FleetError;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Durable store that can be switched into a failing mode
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub entries: DashMap<String, Checkpoint>,
        pub failing: AtomicBool,
    }

    impl FlakyStore {
        pub fn failing() -> Self {
            let store = Self::default();
            store.failing.store(true, Ordering::Relaxed);
            store
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(FleetError::CheckpointFailed("store offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn put(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
            self.check()?;
            self.entries.insert(key.to_string(), checkpoint.clone());
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
            self.check()?;
            Ok(self.entries.get(key).map(|c| c.clone()))
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.check()?;
            self.entries.remove(key);
            Ok(())
        }
    }

    fn checkpoint(task: &str, step: u64) -> Checkpoint {
        Checkpoint::new(task, step, json!({ "step": step }), json!({}))
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_durable_write() {
        let store = Arc::new(FlakyStore::default());
        let checkpoints = FallbackCheckpoints::new(store.clone(), capacity(4));

        assert_eq!(checkpoints.save(checkpoint("t1", 1)).await, CheckpointTier::Durable);
        assert!(checkpoints.has_durable("t1").await.unwrap());
        assert_eq!(checkpoints.cache_len(), 0);
        assert_eq!(checkpoints.load("t1").await.unwrap().step, 1);
    }

    #[tokio::test]
    async fn test_fallback_on_write_failure() {
        let store = Arc::new(FlakyStore::failing());
        let checkpoints = FallbackCheckpoints::new(store.clone(), capacity(4));

        assert_eq!(checkpoints.save(checkpoint("t1", 3)).await, CheckpointTier::Memory);
        assert_eq!(checkpoints.cached("t1").unwrap().step, 3);
        assert_eq!(checkpoints.load("t1").await.unwrap().step, 3);
        assert!(checkpoints.exists("t1").await);
        assert!(checkpoints.has_durable("t1").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let store = Arc::new(FlakyStore::failing());
        let checkpoints = FallbackCheckpoints::new(store, capacity(2));

        checkpoints.save(checkpoint("t1", 1)).await;
        checkpoints.save(checkpoint("t2", 1)).await;
        checkpoints.save(checkpoint("t3", 1)).await;

        assert_eq!(checkpoints.cache_len(), 2);
        assert!(checkpoints.cached("t1").is_none());
        assert!(checkpoints.cached("t3").is_some());
    }

    #[tokio::test]
    async fn test_overwrite_is_not_an_eviction() {
        let checkpoints = FallbackCheckpoints::new(Arc::new(FlakyStore::failing()), capacity(1));

        assert_eq!(checkpoints.remember(checkpoint("t1", 1)), None);
        assert_eq!(checkpoints.remember(checkpoint("t1", 2)), None);
        assert_eq!(checkpoints.cached("t1").unwrap().step, 2);

        assert_eq!(checkpoints.remember(checkpoint("t2", 1)), Some("t1".to_string()));
        assert_eq!(checkpoints.cache_len(), 1);

        assert_eq!(checkpoints.save(checkpoint("t2", 2)).await, CheckpointTier::Memory);
        assert_eq!(checkpoints.cached("t2").unwrap().step, 2);
    }

    #[tokio::test]
    async fn test_load_prefers_newest_tier() {
        let store = Arc::new(FlakyStore::default());
        let checkpoints = FallbackCheckpoints::new(store.clone(), capacity(4));

        checkpoints.save(checkpoint("t1", 2)).await;
        store.failing.store(true, Ordering::Relaxed);
        checkpoints.save(checkpoint("t1", 5)).await;
        store.failing.store(false, Ordering::Relaxed);

        assert_eq!(checkpoints.load("t1").await.unwrap().step, 5);

        // a later durable write clears the stale memory copy
        checkpoints.save(checkpoint("t1", 6)).await;
        assert!(checkpoints.cached("t1").is_none());
        assert_eq!(checkpoints.load("t1").await.unwrap().step, 6);
    }

    #[tokio::test]
    async fn test_discard() {
        let store = Arc::new(FlakyStore::default());
        let checkpoints = FallbackCheckpoints::new(store.clone(), capacity(4));
        checkpoints.save(checkpoint("t1", 1)).await;

        checkpoints.discard("t1").await;
        assert!(!checkpoints.exists("t1").await);
        assert!(checkpoints.load("t1").await.is_none());
    }
}
