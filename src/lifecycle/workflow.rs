// src/lifecycle/workflow.rs
//! Stepwise workflow contract

use crate::lifecycle::checkpoint::Checkpoint;
use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Lazy, finite sequence of intermediate states, one per completed step
pub type StepStream = Pin<Box<dyn Stream<Item = Result<serde_json::Value>> + Send>>;

/// Inputs of one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub task_id: String,
    pub input: serde_json::Value,
    pub config: serde_json::Value,
    /// Last checkpoint when the task is being resumed
    pub resume_from: Option<Checkpoint>,
}

/// A multi-step task
///
/// The stream cannot be restarted mid-way; resuming goes through
/// `WorkflowRun::resume_from`, and the workflow continues after the step
/// recorded there.
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn run(&self, run: WorkflowRun) -> Result<StepStream>;
}
