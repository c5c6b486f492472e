// src/lifecycle/controller.rs
//! Lifecycle controller
//!
//! Runs one task's workflow step by step. After every step it checkpoints and
//! re-reads the authoritative status, so a pause or cancel recorded in the
//! status store takes effect at the next step boundary. `pause_story` and
//! `cancel_story` additionally abort the in-flight step.
//!
//! A stop always leaves `execute_story` as [`FleetError::Stopped`]; nothing in
//! between swallows it.

use crate::lifecycle::checkpoint::{Checkpoint, CheckpointStore, CheckpointTier, FallbackCheckpoints};
use crate::lifecycle::status::{StatusStore, TaskStatus};
use crate::lifecycle::workflow::{Workflow, WorkflowRun};
use crate::lifecycle::{CleanupHook, LifecycleConfig};
use crate::runtime::agent::Agent;
use crate::utils::errors::{FleetError, Result, StopSignal};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a task that ran to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryOutcome {
    pub task_id: String,

    /// Total steps completed, including steps before a resume
    pub steps: u64,

    /// Step the run resumed from, if any
    pub resumed_from: Option<u64>,

    /// State yielded by the last step
    pub final_state: Option<serde_json::Value>,
}

/// A task currently executing in this process
struct RunningTask {
    run_id: u64,
    abort: AbortHandle,
    /// Status that caused an abort, read by the aborted execution
    stop_reason: Arc<Mutex<Option<TaskStatus>>>,
}

/// Removes a run's `running` entry when the run ends or its caller drops it
struct RunRegistration<'a> {
    running: &'a DashMap<String, RunningTask>,
    task_id: &'a str,
    run_id: u64,
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.running
            .remove_if(self.task_id, |_, task| task.run_id == run_id);
    }
}

/// Drives workflows and honours pause / resume / cancel
pub struct LifecycleController {
    config: LifecycleConfig,

    /// Authoritative task status
    status: Arc<dyn StatusStore>,

    checkpoints: FallbackCheckpoints,

    cleanup: Arc<dyn CleanupHook>,

    /// Fast-path stop hints. Never authoritative.
    signals: DashMap<String, TaskStatus>,

    running: DashMap<String, RunningTask>,

    next_run_id: AtomicU64,
}

impl LifecycleController {
    pub fn new(
        config: LifecycleConfig,
        status: Arc<dyn StatusStore>,
        durable: Arc<dyn CheckpointStore>,
        cleanup: Arc<dyn CleanupHook>,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.checkpoint_cache_capacity).ok_or_else(|| {
            FleetError::ConfigError("checkpoint cache capacity cannot be 0".to_string())
        })?;

        Ok(Self {
            checkpoints: FallbackCheckpoints::new(durable, capacity),
            config,
            status,
            cleanup,
            signals: DashMap::new(),
            running: DashMap::new(),
            next_run_id: AtomicU64::new(1),
        })
    }

    pub fn checkpoints(&self) -> &FallbackCheckpoints {
        &self.checkpoints
    }

    /// Ids of tasks executing in this process
    pub fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    /// Local stop hint for a task, if any
    pub fn signal(&self, task_id: &str) -> Option<TaskStatus> {
        self.signals.get(task_id).map(|s| *s)
    }

    /// Fail with `Stopped` if the task was paused or cancelled
    ///
    /// Consults the local hint first and only reads the store when there is none.
    pub async fn check_should_stop(&self, task_id: &str) -> Result<()> {
        if let Some(status) = self.signal(task_id) {
            if status.requires_stop() {
                return Err(StopSignal::new(task_id, status).into());
            }
        }

        match self.status.get(task_id).await? {
            Some(status) if status.requires_stop() => {
                self.signals.insert(task_id.to_string(), status);
                Err(StopSignal::new(task_id, status).into())
            }
            _ => Ok(()),
        }
    }

    /// Re-read the authoritative status at a step boundary
    async fn check_authoritative(&self, task_id: &str) -> Result<()> {
        match self.status.get(task_id).await {
            Ok(Some(status)) if status.requires_stop() => {
                self.signals.insert(task_id.to_string(), status);
                Err(StopSignal::new(task_id, status).into())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    "Status store unavailable for {}, using local signal: {}",
                    task_id, e
                );
                match self.signal(task_id) {
                    Some(status) if status.requires_stop() => {
                        Err(StopSignal::new(task_id, status).into())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Run a task to completion, stopping at the first step boundary after a
    /// pause or cancel
    ///
    /// Resumes from the latest checkpoint when one exists. Returns
    /// [`FleetError::Stopped`] when stopped. Dropping the returned future
    /// releases the task locally; its stored status is left as is.
    pub async fn execute_story(
        &self,
        task_id: &str,
        workflow: &dyn Workflow,
        input: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<StoryOutcome> {
        self.check_should_stop(task_id).await?;

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (abort, registration) = AbortHandle::new_pair();
        let stop_reason = Arc::new(Mutex::new(None));

        match self.running.entry(task_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(FleetError::WorkflowFailed(format!(
                    "task {} is already running",
                    task_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(RunningTask {
                    run_id,
                    abort,
                    stop_reason: Arc::clone(&stop_reason),
                });
            }
        }
        let registered = RunRegistration {
            running: &self.running,
            task_id,
            run_id,
        };

        let result = match self.status.set(task_id, TaskStatus::Running).await {
            Ok(()) => {
                let drive = self.drive(task_id, workflow, input, config);
                match Abortable::new(drive, registration).await {
                    Ok(result) => result,
                    Err(_aborted) => {
                        let status = stop_reason.lock().unwrap_or(TaskStatus::Paused);
                        Err(StopSignal::new(task_id, status).into())
                    }
                }
            }
            Err(e) => Err(e),
        };

        drop(registered);
        self.finish(task_id, &result).await;
        result
    }

    async fn drive(
        &self,
        task_id: &str,
        workflow: &dyn Workflow,
        input: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<StoryOutcome> {
        let resume_from = self.checkpoints.load(task_id).await;
        let resumed_from = resume_from.as_ref().map(|c| c.step);
        let mut final_state = resume_from.as_ref().map(|c| c.state.clone());
        let mut step = resumed_from.unwrap_or(0);

        match resumed_from {
            Some(from) => info!("Resuming task {} from step {}", task_id, from),
            None => info!("Starting task {}", task_id),
        }

        let mut steps = workflow
            .run(WorkflowRun {
                task_id: task_id.to_string(),
                input,
                config: config.clone(),
                resume_from,
            })
            .await?;

        while let Some(item) = steps.next().await {
            let state = item?;
            step += 1;
            debug!("Task {} completed step {}", task_id, step);

            if step % self.config.checkpoint_every == 0 {
                let checkpoint = Checkpoint::new(task_id, step, state.clone(), config.clone());
                if self.checkpoints.save(checkpoint).await == CheckpointTier::Memory {
                    warn!("Task {} running with degraded checkpointing", task_id);
                }
            }

            if step % self.config.verify_every == 0 && !self.checkpoints.exists(task_id).await {
                warn!(
                    "No checkpoint found for task {} at step {}; a pause now would lose progress",
                    task_id, step
                );
            }

            final_state = Some(state);
            self.check_authoritative(task_id).await?;
        }

        Ok(StoryOutcome {
            task_id: task_id.to_string(),
            steps: step,
            resumed_from,
            final_state,
        })
    }

    /// Record the terminal status of a run and release its resources
    ///
    /// A completed task drops its checkpoints from both tiers. A failed task
    /// keeps its durable checkpoint for inspection and leaves the cache.
    async fn finish(&self, task_id: &str, result: &Result<StoryOutcome>) {
        let status = match result {
            Ok(outcome) => {
                info!("Task {} completed after {} steps", task_id, outcome.steps);
                self.checkpoints.discard(task_id).await;
                TaskStatus::Completed
            }
            Err(FleetError::Stopped(signal)) => {
                info!("Task {} stopped: {}", task_id, signal);
                return;
            }
            Err(e) => {
                error!("Task {} failed: {}", task_id, e);
                self.checkpoints.evict(task_id);
                TaskStatus::Failed
            }
        };

        if let Err(e) = self.cleanup.cleanup(task_id).await {
            warn!("Cleanup of task {} failed: {}", task_id, e);
        }
        self.signals.remove(task_id);

        if let Err(e) = self.status.set(task_id, status).await {
            warn!("Failed to record {} for task {}: {}", status, task_id, e);
        }
    }

    /// Run a task on an agent, marking it busy for the duration
    pub async fn run_on(
        &self,
        agent: &dyn Agent,
        task_id: &str,
        workflow: &dyn Workflow,
        input: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<StoryOutcome> {
        debug!("Running task {} on agent {}", task_id, agent.id());
        agent
            .core()
            .run_execution(self.execute_story(task_id, workflow, input, config))
            .await
    }

    /// Abort the local execution of a task, recording why
    fn interrupt(&self, task_id: &str, reason: TaskStatus) -> bool {
        match self.running.remove(task_id) {
            Some((_, task)) => {
                *task.stop_reason.lock() = Some(reason);
                task.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Pause a task
    ///
    /// Returns whether an execution in this process was interrupted.
    pub async fn pause_story(&self, task_id: &str) -> Result<bool> {
        self.status.set(task_id, TaskStatus::Paused).await?;
        self.signals.insert(task_id.to_string(), TaskStatus::Paused);

        let interrupted = self.interrupt(task_id, TaskStatus::Paused);
        info!("Paused task {} (interrupted: {})", task_id, interrupted);
        Ok(interrupted)
    }

    /// Cancel a task, release its resources and forget it locally
    ///
    /// Local tracking is cleared even when the status store write fails.
    pub async fn cancel_story(&self, task_id: &str) -> Result<bool> {
        self.signals
            .insert(task_id.to_string(), TaskStatus::CancelRequested);
        let interrupted = self.interrupt(task_id, TaskStatus::CancelRequested);

        let requested = self.status.set(task_id, TaskStatus::CancelRequested).await;

        if let Err(e) = self.cleanup.cleanup(task_id).await {
            warn!("Cleanup of task {} failed: {}", task_id, e);
        }

        self.checkpoints.discard(task_id).await;
        self.signals.remove(task_id);
        self.running.remove(task_id);

        requested?;
        self.status.set(task_id, TaskStatus::Canceled).await?;

        info!("Cancelled task {} (interrupted: {})", task_id, interrupted);
        Ok(interrupted)
    }

    /// Allow a paused task to run again
    ///
    /// Refuses unless the task is Paused and the durable store holds a
    /// checkpoint for it. The caller re-runs `execute_story`, which picks up
    /// from that checkpoint.
    pub async fn resume_story(&self, task_id: &str) -> Result<bool> {
        match self.status.get(task_id).await? {
            Some(TaskStatus::Paused) => {}
            Some(status) => {
                warn!("Cannot resume task {}: status is {}", task_id, status);
                return Ok(false);
            }
            None => {
                warn!("Cannot resume task {}: unknown task", task_id);
                return Ok(false);
            }
        }

        match self.checkpoints.has_durable(task_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Cannot resume task {}: no checkpoint", task_id);
                return Ok(false);
            }
            Err(e) => {
                warn!("Cannot resume task {}: checkpoint store unavailable: {}", task_id, e);
                return Ok(false);
            }
        }

        self.status.set(task_id, TaskStatus::Running).await?;
        self.signals.remove(task_id);
        info!("Resumed task {}", task_id);
        Ok(true)
    }

    /// Latest checkpoint of a task from the durable store or the memory cache
    pub async fn load_checkpoint(&self, task_id: &str) -> Option<Checkpoint> {
        self.checkpoints.load(task_id).await
    }
}
