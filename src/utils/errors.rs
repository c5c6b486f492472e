// src/utils/errors.rs
//! Error types for the fleet subsystem
//!
//! Pool-management calls never surface these to callers (they log and return
//! `None`/`false`), but agents, stores and the lifecycle controller propagate
//! them with `?`. The one error that must always reach the task's caller is
//! [`FleetError::Stopped`].

use crate::lifecycle::status::TaskStatus;
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, FleetError>;

/// Raised when a task observes a pause or cancel request at a step boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSignal {
    /// Task that was stopped
    pub task_id: String,

    /// Status that caused the stop (Paused, CancelRequested or Canceled)
    pub state: TaskStatus,

    /// Human-readable reason
    pub reason: String,
}

impl StopSignal {
    pub fn new(task_id: impl Into<String>, state: TaskStatus) -> Self {
        let task_id = task_id.into();
        let reason = match state {
            TaskStatus::Paused => format!("task {} was paused", task_id),
            TaskStatus::CancelRequested | TaskStatus::Canceled => {
                format!("task {} was cancelled", task_id)
            }
            other => format!("task {} stopped in state {}", task_id, other),
        };

        Self {
            task_id,
            state,
            reason,
        }
    }

    /// Whether the stop came from a cancellation rather than a pause
    pub fn is_cancel(&self) -> bool {
        matches!(
            self.state,
            TaskStatus::CancelRequested | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.state)
    }
}

/// Fleet errors
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Agent spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Agent pool at capacity ({0} agents)")]
    PoolExhausted(usize),

    #[error("Agent stop failed: {0}")]
    StopFailed(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Process error: {0}")]
    ProcessFailed(String),

    #[error("Status store error: {0}")]
    StatusStoreFailed(String),

    #[error("Checkpoint error: {0}")]
    CheckpointFailed(String),

    #[error("Storage error: {0}")]
    StorageFailed(String),

    #[error("Compression error: {0}")]
    CompressionFailed(String),

    #[error("Workflow error: {0}")]
    WorkflowFailed(String),

    #[error("Provisioning error: {0}")]
    ProvisioningFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stopped: {0}")]
    Stopped(StopSignal),
}

impl FleetError {
    /// The stop signal, if this error is a pause/cancel stop
    pub fn as_stop(&self) -> Option<&StopSignal> {
        match self {
            FleetError::Stopped(signal) => Some(signal),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.as_stop().is_some()
    }
}

impl From<StopSignal> for FleetError {
    fn from(signal: StopSignal) -> Self {
        FleetError::Stopped(signal)
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::StorageFailed(e.to_string())
    }
}

impl From<config::ConfigError> for FleetError {
    fn from(e: config::ConfigError) -> Self {
        FleetError::ConfigError(e.to_string())
    }
}
