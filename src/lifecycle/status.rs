// src/lifecycle/status.rs
//! Task status and the authoritative status store

use crate::utils::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Paused,
    CancelRequested,
    Canceled,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::CancelRequested => "CANCEL_REQUESTED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Whether a running task seeing this status must stop at the next step
    pub fn requires_stop(&self) -> bool {
        matches!(
            self,
            TaskStatus::Paused | TaskStatus::CancelRequested | TaskStatus::Canceled
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Completed | TaskStatus::Failed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(TaskStatus::Running),
            "PAUSED" => Ok(TaskStatus::Paused),
            "CANCEL_REQUESTED" => Ok(TaskStatus::CancelRequested),
            "CANCELED" => Ok(TaskStatus::Canceled),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Authoritative, externally owned task status
///
/// `get` returns `None` for tasks the store has never seen.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>>;

    async fn set(&self, task_id: &str, status: TaskStatus) -> Result<()>;
}

/// Status store kept in process memory
#[derive(Default)]
pub struct InMemoryStatusStore {
    statuses: DashMap<String, TaskStatus>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        Ok(self.statuses.get(task_id).map(|s| *s))
    }

    async fn set(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.statuses.insert(task_id.to_string(), status);
        Ok(())
    }
}
