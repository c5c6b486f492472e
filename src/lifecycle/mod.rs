// src/lifecycle/mod.rs
//! Pause / resume / cancel control for long-running tasks
//!
//! - **Status**: authoritative task status behind [`StatusStore`]
//! - **Checkpoint**: durable checkpoints with a bounded in-memory fallback
//! - **Workflow**: the stepwise execution contract
//! - **Controller**: drives a workflow and honours pause/cancel at step boundaries
//!
//! ```text
//!            pause_story / cancel_story
//!                      │
//!                      ▼
//!   StatusStore ◄── LifecycleController ──► FallbackCheckpoints
//!   (authoritative)    │   ▲                  ├─ CheckpointStore (durable)
//!                      │   │ step             └─ LRU cache (fallback)
//!                      ▼   │
//!                    Workflow stream
//! ```

pub mod checkpoint;
pub mod controller;
pub mod status;
pub mod workflow;

use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointTier, FallbackCheckpoints};
pub use controller::{LifecycleController, StoryOutcome};
pub use status::{InMemoryStatusStore, StatusStore, TaskStatus};
pub use workflow::{StepStream, Workflow, WorkflowRun};

/// Releases OS resources (subprocesses) a task was holding
///
/// May be called more than once for the same task.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup(&self, task_id: &str) -> Result<()>;
}

/// Cleanup hook that does nothing
pub struct NoopCleanup;

#[async_trait]
impl CleanupHook for NoopCleanup {
    async fn cleanup(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Max checkpoints held in memory while the durable store is down (default: 100)
    pub checkpoint_cache_capacity: usize,

    /// Checkpoint after every N steps (default: 1)
    pub checkpoint_every: u64,

    /// Verify checkpoint presence every N steps (default: 5)
    pub verify_every: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            checkpoint_cache_capacity: 100,
            checkpoint_every: 1,
            verify_every: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_cache_capacity == 0 {
            return Err(FleetError::ConfigError(
                "lifecycle.checkpoint_cache_capacity cannot be 0".to_string(),
            ));
        }
        if self.checkpoint_every == 0 || self.verify_every == 0 {
            return Err(FleetError::ConfigError(
                "lifecycle.checkpoint_every and verify_every cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}
