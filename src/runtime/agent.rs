// src/runtime/agent.rs
//! Worker contract shared by every agent implementation
//!
//! An [`Agent`] is one long-running worker for a single role. Pools only talk
//! to workers through this trait; the bookkeeping every worker needs (state,
//! project binding, execution counters, idle tracking, listener fan-out) lives
//! in [`AgentCore`] so implementations only supply start/stop/health.
//!
//! # State machine
//!
//! ```text
//! Starting ──► Idle (no project, warm) ──assign──► Running ◄──► Busy
//!    │                                               │
//!    └──────────────► Error            Stopping ◄────┘
//!                                         │
//!                                    Terminated
//! ```

use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Being started
    Starting,

    /// Started but not bound to a project (a warm spare)
    Idle,

    /// Bound and ready to accept work
    Running,

    /// Executing a task
    Busy,

    /// Stop requested
    Stopping,

    /// Stopped, resources released
    Terminated,

    /// Failed to start or crashed
    Error,
}

impl AgentState {
    /// Whether the worker counts towards the pool's active workers
    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Running | AgentState::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Busy => "busy",
            AgentState::Stopping => "stopping",
            AgentState::Terminated => "terminated",
            AgentState::Error => "error",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub healthy: bool,
    /// Seconds since the worker started or last ran a task
    pub idle_seconds: f64,
    pub state: AgentState,
    pub detail: Option<String>,
}

/// Execution counters of a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Receives worker events. Injected at construction time.
pub trait AgentListener: Send + Sync {
    fn on_state_change(&self, _agent_id: &str, _old: AgentState, _new: AgentState) {}

    fn on_execution_complete(&self, _agent_id: &str, _success: bool, _error: Option<&str>) {}

    fn on_heartbeat(&self, _agent_id: &str) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl AgentListener for NoopListener {}

/// Unassigned worker template produced by a persona provisioner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Display name of the persona
    pub name: String,

    /// Role this descriptor was materialised for
    pub role: String,

    /// Persona/template payload handed to the worker
    pub persona: serde_json::Value,

    /// Always `None` for warm descriptors
    pub project_id: Option<String>,
}

/// Everything a factory needs to build a worker
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    pub project_id: Option<String>,
    pub heartbeat_interval: Duration,
    pub max_idle_time: Duration,
    pub descriptor: Option<AgentDescriptor>,
    /// Come up Running even without a project (pool-owned capacity)
    pub ready: bool,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            project_id: None,
            heartbeat_interval: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(3600),
            descriptor: None,
            ready: false,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }
}

/// A worker owned by exactly one pool
#[async_trait]
pub trait Agent: Send + Sync {
    /// Shared bookkeeping
    fn core(&self) -> &AgentCore;

    /// Bring the worker up. On success the worker is Idle (unassigned) or Running.
    async fn start(&self) -> Result<()>;

    /// Stop the worker. A graceful stop lets the in-flight task finish first;
    /// a forced stop cancels it (see [`AgentCore::abort_execution`]).
    async fn stop(&self, graceful: bool) -> Result<()>;

    /// Check the worker
    async fn health_check(&self) -> Result<AgentHealth>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn role(&self) -> &str {
        self.core().role()
    }

    fn state(&self) -> AgentState {
        self.core().state()
    }

    fn project_id(&self) -> Option<String> {
        self.core().project_id()
    }

    fn counters(&self) -> ExecutionCounters {
        self.core().counters()
    }

    fn spawned_at(&self) -> DateTime<Utc> {
        self.core().spawned_at()
    }
}

/// Builds workers for a pool
pub trait AgentFactory: Send + Sync {
    fn create(&self, spec: AgentSpec, listener: Arc<dyn AgentListener>) -> Result<Arc<dyn Agent>>;
}

/// State, counters and listener fan-out common to all workers
pub struct AgentCore {
    id: String,
    role: String,
    project_id: RwLock<Option<String>>,
    state: RwLock<AgentState>,
    descriptor: Option<AgentDescriptor>,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    spawned_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    heartbeat_interval: Duration,
    max_idle_time: Duration,
    ready: bool,
    listener: Arc<dyn AgentListener>,
    idle: Notify,
    /// Abort handle of the in-flight execution
    execution: Mutex<Option<AbortHandle>>,
}

impl AgentCore {
    pub fn new(spec: AgentSpec, listener: Arc<dyn AgentListener>) -> Self {
        Self {
            id: spec.id,
            role: spec.role,
            project_id: RwLock::new(spec.project_id),
            state: RwLock::new(AgentState::Starting),
            descriptor: spec.descriptor,
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            spawned_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            heartbeat_interval: spec.heartbeat_interval,
            max_idle_time: spec.max_idle_time,
            ready: spec.ready,
            listener,
            idle: Notify::new(),
            execution: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn project_id(&self) -> Option<String> {
        self.project_id.read().clone()
    }

    pub fn descriptor(&self) -> Option<&AgentDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    pub fn counters(&self) -> ExecutionCounters {
        ExecutionCounters {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Move to `new`, notifying the listener. Returns the previous state.
    pub fn set_state(&self, new: AgentState) -> AgentState {
        let old = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new)
        };

        if old != new {
            trace!("Agent {} state {} -> {}", self.id, old, new);
            self.listener.on_state_change(&self.id, old, new);
        }
        if old == AgentState::Busy && new != AgentState::Busy {
            self.idle.notify_waiters();
        }
        old
    }

    /// State after a successful start: unbound warm workers wait Idle for assignment
    pub fn mark_started(&self) {
        let next = if self.ready || self.project_id.read().is_some() {
            AgentState::Running
        } else {
            AgentState::Idle
        };
        self.touch();
        self.set_state(next);
    }

    /// Bind an unassigned worker to a project. Refuses if already bound.
    pub fn assign_project(&self, project_id: &str) -> bool {
        {
            let mut current = self.project_id.write();
            if current.is_some() {
                return false;
            }
            *current = Some(project_id.to_string());
        }

        debug!("Agent {} assigned to project {}", self.id, project_id);

        let promoted = {
            let mut state = self.state.write();
            if *state == AgentState::Idle {
                *state = AgentState::Running;
                true
            } else {
                false
            }
        };
        if promoted {
            self.listener
                .on_state_change(&self.id, AgentState::Idle, AgentState::Running);
        }
        true
    }

    /// Record activity without notifying anyone
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Forward a liveness heartbeat to the listener. Does not count as activity.
    pub fn heartbeat(&self) {
        self.listener.on_heartbeat(&self.id);
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn idle_seconds(&self) -> f64 {
        self.idle_time().as_secs_f64()
    }

    /// Whether the worker has sat unused longer than its max idle time
    pub fn idle_expired(&self) -> bool {
        self.state() != AgentState::Busy && self.idle_time() > self.max_idle_time
    }

    /// Cancel the in-flight execution. Returns whether one was running.
    pub fn abort_execution(&self) -> bool {
        match self.execution.lock().take() {
            Some(handle) => {
                debug!("Agent {} aborting in-flight task", self.id);
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Run one task on this worker
    ///
    /// The worker is Busy while `task` runs and returns to Running however the
    /// call ends, including when the caller drops it. A pause/cancel stop is
    /// not an execution outcome and is not counted or reported; neither is a
    /// task cancelled by [`abort_execution`](Self::abort_execution). Every
    /// other result bumps the counters and reaches the listener.
    pub async fn run_execution<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.write();
            if *state != AgentState::Running {
                return Err(FleetError::AgentUnavailable(format!(
                    "Agent {} cannot accept work in state {}",
                    self.id, *state
                )));
            }
            *state = AgentState::Busy;
        }
        self.listener
            .on_state_change(&self.id, AgentState::Running, AgentState::Busy);
        self.touch();

        let (handle, registration) = AbortHandle::new_pair();
        *self.execution.lock() = Some(handle);
        let _busy = BusyGuard { core: self };

        let result = match Abortable::new(task, registration).await {
            Ok(result) => result,
            Err(_aborted) => {
                warn!("Agent {} task cancelled by forced stop", self.id);
                return Err(FleetError::AgentUnavailable(format!(
                    "Agent {} was stopped mid-task",
                    self.id
                )));
            }
        };

        match &result {
            Ok(_) => {
                self.total.fetch_add(1, Ordering::Relaxed);
                self.successful.fetch_add(1, Ordering::Relaxed);
                self.listener.on_execution_complete(&self.id, true, None);
            }
            Err(e) if e.is_stopped() => {
                debug!("Agent {} task stopped: {}", self.id, e);
            }
            Err(e) => {
                self.total.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                let message = e.to_string();
                self.listener
                    .on_execution_complete(&self.id, false, Some(&message));
            }
        }

        result
    }

    fn end_execution(&self) {
        self.execution.lock().take();
        self.touch();

        let back_to_running = {
            let mut state = self.state.write();
            if *state == AgentState::Busy {
                *state = AgentState::Running;
                true
            } else {
                false
            }
        };
        if back_to_running {
            self.listener
                .on_state_change(&self.id, AgentState::Busy, AgentState::Running);
        }
        self.idle.notify_waiters();
    }

    /// Wait until the worker is no longer Busy. Returns false on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.state() != AgentState::Busy {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Ends an execution when `run_execution` returns or is dropped
struct BusyGuard<'a> {
    core: &'a AgentCore,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.core.end_execution();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        transitions: Mutex<Vec<(AgentState, AgentState)>>,
        outcomes: Mutex<Vec<bool>>,
        heartbeats: AtomicU64,
    }

    impl AgentListener for RecordingListener {
        fn on_state_change(&self, _agent_id: &str, old: AgentState, new: AgentState) {
            self.transitions.lock().push((old, new));
        }

        fn on_execution_complete(&self, _agent_id: &str, success: bool, _error: Option<&str>) {
            self.outcomes.lock().push(success);
        }

        fn on_heartbeat(&self, _agent_id: &str) {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn core_with(listener: Arc<RecordingListener>, project: Option<&str>) -> AgentCore {
        let mut spec = AgentSpec::new("agent-1", "developer");
        spec.project_id = project.map(str::to_string);
        AgentCore::new(spec, listener)
    }

    #[test]
    fn test_warm_agent_starts_idle() {
        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener.clone(), None);

        core.mark_started();
        assert_eq!(core.state(), AgentState::Idle);

        assert!(core.assign_project("proj-1"));
        assert_eq!(core.state(), AgentState::Running);
        assert_eq!(core.project_id().as_deref(), Some("proj-1"));

        // already bound
        assert!(!core.assign_project("proj-2"));
        assert_eq!(core.project_id().as_deref(), Some("proj-1"));

        let transitions = listener.transitions.lock();
        assert_eq!(transitions.last(), Some(&(AgentState::Idle, AgentState::Running)));
    }

    #[test]
    fn test_bound_agent_starts_running() {
        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener, Some("proj-1"));
        core.mark_started();
        assert_eq!(core.state(), AgentState::Running);
    }

    #[tokio::test]
    async fn test_run_execution_updates_counters() {
        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener.clone(), Some("proj-1"));
        core.mark_started();

        let ok: Result<u32> = core.run_execution(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32> = core
            .run_execution(async { Err(FleetError::WorkflowFailed("bad step".into())) })
            .await;
        assert!(err.is_err());

        let counters = core.counters();
        assert_eq!(counters.total, 2);
        assert_eq!(counters.successful, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(*listener.outcomes.lock(), vec![true, false]);
        assert_eq!(core.state(), AgentState::Running);
    }

    #[tokio::test]
    async fn test_stopped_execution_not_counted() {
        use crate::lifecycle::status::TaskStatus;
        use crate::utils::errors::StopSignal;

        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener.clone(), Some("proj-1"));
        core.mark_started();

        let result: Result<()> = core
            .run_execution(async { Err(StopSignal::new("t1", TaskStatus::Paused).into()) })
            .await;
        assert!(result.unwrap_err().is_stopped());
        assert_eq!(core.counters().total, 0);
        assert!(listener.outcomes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_agent_rejects_work() {
        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener, None);
        core.mark_started();

        let result = core.run_execution(async { Ok(()) }).await;
        assert!(result.is_err());
        assert_eq!(core.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_wait_until_idle() {
        let listener = Arc::new(RecordingListener::default());
        let core = Arc::new(core_with(listener, Some("proj-1")));
        core.mark_started();

        let worker = Arc::clone(&core);
        let handle = tokio::spawn(async move {
            worker
                .run_execution(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(core.state(), AgentState::Busy);
        assert!(!core.wait_until_idle(Duration::from_millis(5)).await);
        assert!(core.wait_until_idle(Duration::from_secs(1)).await);

        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_ready_agent_starts_running_unbound() {
        let listener = Arc::new(RecordingListener::default());
        let core = AgentCore::new(AgentSpec::new("agent-1", "developer").ready(), listener);
        core.mark_started();
        assert_eq!(core.state(), AgentState::Running);
        assert_eq!(core.project_id(), None);
    }

    #[tokio::test]
    async fn test_dropped_execution_returns_to_running() {
        let listener = Arc::new(RecordingListener::default());
        let core = Arc::new(core_with(listener.clone(), Some("proj-1")));
        core.mark_started();

        let worker = Arc::clone(&core);
        let handle = tokio::spawn(async move {
            worker
                .run_execution(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(core.state(), AgentState::Busy);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert_eq!(core.state(), AgentState::Running);
        assert!(core.wait_until_idle(Duration::from_millis(5)).await);
        assert!(!core.abort_execution());
        assert!(listener.outcomes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abort_execution_cancels_task() {
        let listener = Arc::new(RecordingListener::default());
        let core = Arc::new(core_with(listener.clone(), Some("proj-1")));
        core.mark_started();

        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let worker = Arc::clone(&core);
        let flag = Arc::clone(&finished);
        let handle = tokio::spawn(async move {
            worker
                .run_execution(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    flag.store(true, Ordering::Relaxed);
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(core.abort_execution());
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FleetError::AgentUnavailable(_))));
        assert!(!finished.load(Ordering::Relaxed));
        assert_eq!(core.counters().total, 0);
        assert!(listener.outcomes.lock().is_empty());
        assert_eq!(core.state(), AgentState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry() {
        let mut spec = AgentSpec::new("agent-1", "developer");
        spec.max_idle_time = Duration::from_secs(60);
        let core = AgentCore::new(spec, Arc::new(NoopListener));
        core.mark_started();
        assert!(!core.idle_expired());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(core.idle_expired());

        core.touch();
        assert!(!core.idle_expired());
        assert_eq!(core.max_idle_time(), Duration::from_secs(60));
    }

    #[test]
    fn test_heartbeat_forwarded() {
        let listener = Arc::new(RecordingListener::default());
        let core = core_with(listener.clone(), None);
        core.heartbeat();
        core.heartbeat();
        assert_eq!(listener.heartbeats.load(Ordering::Relaxed), 2);
    }
}
