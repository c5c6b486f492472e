// src/runtime/agent_pool.rs
//! Agent pool for one role
//!
//! Owns a homogeneous set of long-running agents: spawns and terminates them,
//! picks one for incoming work, and keeps the set healthy and sized with two
//! background loops.
//!
//! # Architecture
//!
//! ```text
//! AgentPool ("developer_pool")
//! ├─ Capacity: Semaphore(max_agents)     (slot reserved before start)
//! ├─ Agents:   {id → Agent}               (Idle / Running / Busy ...)
//! ├─ Stats:    {id → spawn time, executions, last execution}
//! ├─ Monitor loop    (every health_check_interval)
//! │    └─ terminate unhealthy agents and agents idle past idle_timeout
//! │       or their own max_idle_time
//! └─ Autoscaler loop (every autoscale_interval, 30s by default)
//!      └─ load = busy / (running + busy) → spawn one or terminate one
//! ```
//!
//! Pool management never returns errors to callers: failures are logged and
//! surface as `None` / `false`.

use crate::runtime::agent::{
    Agent, AgentDescriptor, AgentFactory, AgentHealth, AgentListener, AgentSpec, AgentState,
};
use crate::runtime::circuit_breaker::CircuitBreakerManager;
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Configuration for an agent pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPoolConfig {
    /// Agents kept alive at all times (default: 1)
    pub min_agents: usize,

    /// Hard cap on agents in the pool (default: 10)
    pub max_agents: usize,

    /// Load above which the autoscaler adds an agent (default: 0.8)
    pub scale_up_threshold: f64,

    /// Load below which the autoscaler removes an agent (default: 0.2)
    pub scale_down_threshold: f64,

    /// Idle seconds after which the monitor retires an agent (default: 600)
    pub idle_timeout_secs: u64,

    /// Monitor loop period in seconds (default: 30)
    pub health_check_interval_secs: u64,

    /// Autoscaler loop period in seconds (default: 30)
    pub autoscale_interval_secs: u64,

    /// How long a graceful terminate waits for the current task (default: 30)
    pub graceful_stop_timeout_secs: u64,

    /// Heartbeat interval handed to new agents (default: 30)
    pub heartbeat_interval_secs: u64,

    /// Max idle time handed to new agents (default: 3600)
    pub max_idle_time_secs: u64,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            idle_timeout_secs: 600,
            health_check_interval_secs: 30,
            autoscale_interval_secs: 30,
            graceful_stop_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            max_idle_time_secs: 3600,
        }
    }
}

impl AgentPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    /// Validate pool limits and thresholds
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(FleetError::ConfigError("max_agents cannot be 0".to_string()));
        }
        if self.min_agents > self.max_agents {
            return Err(FleetError::ConfigError(format!(
                "min_agents ({}) cannot exceed max_agents ({})",
                self.min_agents, self.max_agents
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FleetError::ConfigError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(FleetError::ConfigError(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 || self.autoscale_interval_secs == 0 {
            return Err(FleetError::ConfigError(
                "pool loop intervals cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How `get_agent` picks among eligible agents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First eligible agent in spawn order. Deterministic, does not rotate.
    #[default]
    RoundRobin,

    /// Agent with the fewest executions
    LeastBusy,

    /// Uniformly random
    Random,
}

/// Optional parameters for `spawn_agent`
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Agent id (generated when absent)
    pub id: Option<String>,

    /// Project binding; absent means the agent starts warm
    pub project_id: Option<String>,

    /// Overrides the pool's heartbeat interval
    pub heartbeat_interval: Option<Duration>,

    /// Overrides the pool's max idle time
    pub max_idle_time: Option<Duration>,

    /// Persona/template the agent is built from
    pub descriptor: Option<AgentDescriptor>,

    /// Start Running without a project so the pool can dispatch to it
    pub ready: bool,
}

impl SpawnRequest {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: AgentDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }
}

/// Per-agent bookkeeping kept by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub spawned_at: DateTime<Utc>,
    pub execution_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AgentStats {
    fn new() -> Self {
        Self {
            spawned_at: Utc::now(),
            execution_count: 0,
            last_execution: None,
            last_heartbeat: None,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_name: String,
    pub role: String,
    pub total_agents: usize,
    pub active_agents: usize,
    pub busy_agents: usize,
    pub idle_agents: usize,
    /// Slots reserved by spawns that have not finished starting
    pub pending_spawns: usize,
    pub min_agents: usize,
    pub max_agents: usize,
    pub total_spawned: u64,
    pub total_terminated: u64,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// successful / total executions, 0 when nothing ran
    pub success_rate: f64,
    /// busy / dispatchable (Running + Busy), 0 when none; warm Idle spares excluded
    pub load: f64,
}

/// Health check result for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthReport {
    pub agent_id: String,
    pub health: Option<AgentHealth>,
    pub error: Option<String>,
}

/// Listener wired into every agent the pool spawns
struct PoolListener {
    pool_name: String,
    stats: Arc<DashMap<String, AgentStats>>,
    breakers: Arc<CircuitBreakerManager>,
}

impl AgentListener for PoolListener {
    fn on_state_change(&self, agent_id: &str, old: AgentState, new: AgentState) {
        debug!("[{}] Agent {} {} -> {}", self.pool_name, agent_id, old, new);
    }

    fn on_execution_complete(&self, agent_id: &str, success: bool, error: Option<&str>) {
        if let Some(mut stats) = self.stats.get_mut(agent_id) {
            stats.execution_count += 1;
            stats.last_execution = Some(Utc::now());
        }

        // a terminated agent's breaker is gone; late outcomes must not recreate it
        let Some(breaker) = self.breakers.get(agent_id) else {
            debug!(
                "[{}] Dropping outcome for unregistered agent {}",
                self.pool_name, agent_id
            );
            return;
        };
        if success {
            breaker.lock().record_success();
        } else {
            breaker.lock().record_failure(error);
        }
    }

    fn on_heartbeat(&self, agent_id: &str) {
        if let Some(mut stats) = self.stats.get_mut(agent_id) {
            stats.last_heartbeat = Some(Utc::now());
        }
    }
}

/// Agent pool for one role
pub struct AgentPool {
    /// Pool name, conventionally `"{role}_pool"`
    name: String,

    /// Role every agent in this pool serves
    role: String,

    config: AgentPoolConfig,

    factory: Arc<dyn AgentFactory>,

    breakers: Arc<CircuitBreakerManager>,

    /// One permit per agent slot; a spawn holds a permit from reservation on
    agent_slots: Arc<Semaphore>,

    agents: RwLock<BTreeMap<String, Arc<dyn Agent>>>,

    stats: Arc<DashMap<String, AgentStats>>,

    total_spawned: AtomicU64,

    total_terminated: AtomicU64,

    shutdown: CancellationToken,

    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentPool {
    /// Create an empty pool. Nothing is spawned until `start` or `spawn_agent`.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        config: AgentPoolConfig,
        factory: Arc<dyn AgentFactory>,
        breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        let agent_slots = Arc::new(Semaphore::new(config.max_agents));

        Self {
            name: name.into(),
            role: role.into(),
            config,
            factory,
            breakers,
            agent_slots,
            agents: RwLock::new(BTreeMap::new()),
            stats: Arc::new(DashMap::new()),
            total_spawned: AtomicU64::new(0),
            total_terminated: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn config(&self) -> &AgentPoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Snapshot of all agents in spawn order
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        let mut agents: Vec<_> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| {
            a.spawned_at()
                .cmp(&b.spawned_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        agents
    }

    pub fn agent_stats(&self, agent_id: &str) -> Option<AgentStats> {
        self.stats.get(agent_id).map(|s| s.clone())
    }

    /// Spawn a new agent
    ///
    /// Returns `None` when the pool is full or the agent fails to start. The
    /// capacity slot is reserved before the agent starts, so concurrent calls
    /// can never push the pool past `max_agents`.
    pub async fn spawn_agent(&self, request: SpawnRequest) -> Option<Arc<dyn Agent>> {
        let permit = match self.agent_slots.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "[{}] Cannot spawn agent: pool at capacity ({})",
                    self.name, self.config.max_agents
                );
                return None;
            }
        };

        let agent_id = request
            .id
            .unwrap_or_else(|| format!("{}-{}", self.role, Ulid::new().to_string().to_lowercase()));

        if self.agents.read().contains_key(&agent_id) {
            warn!("[{}] Agent {} already exists", self.name, agent_id);
            return None;
        }

        let spec = AgentSpec {
            id: agent_id.clone(),
            role: self.role.clone(),
            project_id: request.project_id,
            heartbeat_interval: request
                .heartbeat_interval
                .unwrap_or(Duration::from_secs(self.config.heartbeat_interval_secs)),
            max_idle_time: request
                .max_idle_time
                .unwrap_or(Duration::from_secs(self.config.max_idle_time_secs)),
            descriptor: request.descriptor,
            ready: request.ready,
        };

        let listener: Arc<dyn AgentListener> = Arc::new(PoolListener {
            pool_name: self.name.clone(),
            stats: Arc::clone(&self.stats),
            breakers: Arc::clone(&self.breakers),
        });

        let agent = match self.factory.create(spec, listener) {
            Ok(agent) => agent,
            Err(e) => {
                error!("[{}] Failed to create agent {}: {}", self.name, agent_id, e);
                return None;
            }
        };

        debug!("[{}] Starting agent {}", self.name, agent_id);
        if let Err(e) = agent.start().await {
            error!("[{}] Failed to start agent {}: {}", self.name, agent_id, e);
            if let Err(e) = agent.stop(false).await {
                debug!("[{}] Cleanup of failed agent {}: {}", self.name, agent_id, e);
            }
            return None;
        }

        let registered = {
            let mut agents = self.agents.write();
            if agents.contains_key(&agent_id) {
                false
            } else {
                agents.insert(agent_id.clone(), Arc::clone(&agent));
                self.stats.insert(agent_id.clone(), AgentStats::new());
                self.breakers.get_or_create(&agent_id, None);
                true
            }
        };

        if !registered {
            warn!("[{}] Agent {} registered concurrently, discarding", self.name, agent_id);
            if let Err(e) = agent.stop(false).await {
                debug!("[{}] Cleanup of duplicate agent {}: {}", self.name, agent_id, e);
            }
            return None;
        }

        // the slot now belongs to the registered agent
        permit.forget();

        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        info!(
            "[{}] Spawned agent {} ({}/{})",
            self.name,
            agent_id,
            self.len(),
            self.config.max_agents
        );

        Some(agent)
    }

    /// Terminate an agent
    ///
    /// Returns `false` if the agent is not in this pool. A graceful terminate
    /// waits up to `graceful_stop_timeout` for the in-flight task before
    /// falling back to a forced stop.
    pub async fn terminate_agent(&self, agent_id: &str, graceful: bool) -> bool {
        let agent = match self.agent(agent_id) {
            Some(agent) => agent,
            None => {
                debug!("[{}] Agent {} not found for termination", self.name, agent_id);
                return false;
            }
        };

        info!(
            "[{}] Terminating agent {} (graceful: {})",
            self.name, agent_id, graceful
        );

        if graceful {
            let timeout = self.config.graceful_stop_timeout();
            match tokio::time::timeout(timeout, agent.stop(true)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("[{}] Graceful stop of {} failed: {}", self.name, agent_id, e);
                    self.force_stop(&agent).await;
                }
                Err(_) => {
                    warn!(
                        "[{}] Agent {} did not stop within {:?}, forcing",
                        self.name, agent_id, timeout
                    );
                    self.force_stop(&agent).await;
                }
            }
        } else {
            self.force_stop(&agent).await;
        }

        let removed = self.agents.write().remove(agent_id).is_some();
        if !removed {
            // a concurrent terminate already released the slot
            return false;
        }

        self.stats.remove(agent_id);
        self.breakers.remove(agent_id);
        self.agent_slots.add_permits(1);
        self.total_terminated.fetch_add(1, Ordering::Relaxed);

        info!(
            "[{}] Terminated agent {} ({}/{})",
            self.name,
            agent_id,
            self.len(),
            self.config.max_agents
        );
        true
    }

    /// Cancel the agent's in-flight task, then stop it without waiting
    async fn force_stop(&self, agent: &Arc<dyn Agent>) {
        if agent.core().abort_execution() {
            warn!("[{}] Cancelled in-flight task of {}", self.name, agent.id());
        }
        if let Err(e) = agent.stop(false).await {
            error!("[{}] Forced stop of {} failed: {}", self.name, agent.id(), e);
        }
    }

    /// Pick an agent for new work
    ///
    /// Only Running agents whose circuit breaker allows execution are eligible.
    pub fn get_agent(&self, strategy: SelectionStrategy) -> Option<Arc<dyn Agent>> {
        let eligible: Vec<Arc<dyn Agent>> = self
            .agents()
            .into_iter()
            .filter(|agent| agent.state() == AgentState::Running)
            .filter(|agent| self.breakers.can_execute(agent.id()))
            .collect();

        if eligible.is_empty() {
            debug!("[{}] No eligible agents", self.name);
            return None;
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => eligible.first().cloned(),
            SelectionStrategy::LeastBusy => eligible
                .iter()
                .min_by_key(|agent| agent.counters().total)
                .cloned(),
            SelectionStrategy::Random => eligible.choose(&mut rand::thread_rng()).cloned(),
        };

        if let Some(agent) = &chosen {
            debug!("[{}] Selected agent {} ({:?})", self.name, agent.id(), strategy);
        }
        chosen
    }

    /// Current pool statistics
    pub fn get_pool_stats(&self) -> PoolStats {
        let agents = self.agents();
        let total_agents = agents.len();

        let mut active = 0;
        let mut dispatchable = 0;
        let mut busy = 0;
        let mut total_executions = 0;
        let mut successful = 0;
        let mut failed = 0;

        for agent in &agents {
            let state = agent.state();
            if state.is_active() {
                active += 1;
            }
            if state == AgentState::Running || state == AgentState::Busy {
                dispatchable += 1;
            }
            if state == AgentState::Busy {
                busy += 1;
            }
            let counters = agent.counters();
            total_executions += counters.total;
            successful += counters.successful;
            failed += counters.failed;
        }

        let occupied = self
            .config
            .max_agents
            .saturating_sub(self.agent_slots.available_permits());

        PoolStats {
            pool_name: self.name.clone(),
            role: self.role.clone(),
            total_agents,
            active_agents: active,
            busy_agents: busy,
            idle_agents: active - busy,
            pending_spawns: occupied.saturating_sub(total_agents),
            min_agents: self.config.min_agents,
            max_agents: self.config.max_agents,
            total_spawned: self.total_spawned.load(Ordering::Relaxed),
            total_terminated: self.total_terminated.load(Ordering::Relaxed),
            total_executions,
            successful_executions: successful,
            failed_executions: failed,
            success_rate: if total_executions > 0 {
                successful as f64 / total_executions as f64
            } else {
                0.0
            },
            load: if dispatchable > 0 {
                busy as f64 / dispatchable as f64
            } else {
                0.0
            },
        }
    }

    /// Health-check every agent concurrently
    ///
    /// A failing check is reported in its entry and does not affect the others.
    pub async fn get_all_agent_health(&self) -> Vec<AgentHealthReport> {
        let agents = self.agents();
        let checks = agents.iter().map(|agent| async move {
            match agent.health_check().await {
                Ok(health) => AgentHealthReport {
                    agent_id: agent.id().to_string(),
                    health: Some(health),
                    error: None,
                },
                Err(e) => AgentHealthReport {
                    agent_id: agent.id().to_string(),
                    health: None,
                    error: Some(e.to_string()),
                },
            }
        });

        futures::future::join_all(checks).await
    }

    /// One pass of the monitor loop
    pub async fn run_health_monitor(&self) {
        let idle_timeout = self.config.idle_timeout();

        for agent in self.agents() {
            let agent_id = agent.id().to_string();

            let health = match agent.health_check().await {
                Ok(health) if health.healthy => health,
                Ok(health) => {
                    warn!(
                        "[{}] Agent {} unhealthy ({}), terminating",
                        self.name,
                        agent_id,
                        health.detail.as_deref().unwrap_or("no detail")
                    );
                    self.terminate_agent(&agent_id, false).await;
                    continue;
                }
                Err(e) => {
                    warn!(
                        "[{}] Health check of {} failed: {}, terminating",
                        self.name, agent_id, e
                    );
                    self.terminate_agent(&agent_id, false).await;
                    continue;
                }
            };

            let idle_past_limit = health.state != AgentState::Busy
                && (health.idle_seconds > idle_timeout.as_secs_f64()
                    || agent.core().idle_expired());
            if idle_past_limit && self.len() > self.config.min_agents
            {
                info!(
                    "[{}] Agent {} idle for {:.0}s, terminating",
                    self.name, agent_id, health.idle_seconds
                );
                self.terminate_agent(&agent_id, true).await;
            }
        }
    }

    /// One pass of the autoscaler loop
    pub async fn run_autoscaler(&self) {
        let stats = self.get_pool_stats();

        if stats.load > self.config.scale_up_threshold && self.len() < self.config.max_agents {
            info!(
                "[{}] Load {:.2} above {:.2}, scaling up",
                self.name, stats.load, self.config.scale_up_threshold
            );
            self.spawn_agent(SpawnRequest::default().ready()).await;
        } else if stats.load < self.config.scale_down_threshold
            && self.len() > self.config.min_agents
        {
            if let Some(agent) = self.scale_down_candidate() {
                info!(
                    "[{}] Load {:.2} below {:.2}, scaling down",
                    self.name, stats.load, self.config.scale_down_threshold
                );
                self.terminate_agent(agent.id(), true).await;
            }
        }
    }

    /// The Running agent that has gone longest without an execution
    fn scale_down_candidate(&self) -> Option<Arc<dyn Agent>> {
        self.agents()
            .into_iter()
            .filter(|agent| agent.state() == AgentState::Running)
            .min_by_key(|agent| {
                self.stats
                    .get(agent.id())
                    .and_then(|s| s.last_execution)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            })
    }

    /// Spawn `min_agents` dispatchable agents and launch the monitor and autoscaler loops
    pub async fn start(self: &Arc<Self>) {
        info!(
            "[{}] Starting pool (min: {}, max: {})",
            self.name, self.config.min_agents, self.config.max_agents
        );

        while self.len() < self.config.min_agents {
            if self.spawn_agent(SpawnRequest::default().ready()).await.is_none() {
                warn!("[{}] Could not reach min_agents during start", self.name);
                break;
            }
        }

        let monitor = self.spawn_loop(
            "monitor",
            self.config.health_check_interval(),
            |pool| async move { pool.run_health_monitor().await }.boxed(),
        );
        let autoscaler = self.spawn_loop(
            "autoscaler",
            self.config.autoscale_interval(),
            |pool| async move { pool.run_autoscaler().await }.boxed(),
        );

        self.loops.lock().extend([monitor, autoscaler]);
    }

    fn spawn_loop<F>(self: &Arc<Self>, label: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<AgentPool>) -> futures::future::BoxFuture<'static, ()> + Send + 'static,
    {
        let pool = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!("[{}] {} loop started (every {:?})", pool.name, label, period);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("[{}] {} loop stopping", pool.name, label);
                        break;
                    }
                    _ = interval.tick() => {
                        let iteration = AssertUnwindSafe(tick(Arc::clone(&pool))).catch_unwind();
                        if iteration.await.is_err() {
                            error!("[{}] {} iteration panicked, continuing", pool.name, label);
                        }
                    }
                }
            }
        })
    }

    /// Stop the background loops and force-terminate every agent
    pub async fn shutdown(&self) {
        info!("[{}] Shutting down pool", self.name);
        self.shutdown.cancel();

        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                debug!("[{}] Loop ended abnormally: {}", self.name, e);
            }
        }

        let ids: Vec<String> = self.agents.read().keys().cloned().collect();
        for agent_id in ids {
            self.terminate_agent(&agent_id, false).await;
        }
    }
}
