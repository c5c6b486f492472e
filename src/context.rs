// src/context.rs
//! Process-wide fleet context
//!
//! Built once at startup and shared by `Arc`. Owns the breaker registry, the
//! warm pool manager, the lifecycle controller and one pool per role, and
//! tears them down in `shutdown`.

use crate::lifecycle::checkpoint::CheckpointStore;
use crate::lifecycle::status::StatusStore;
use crate::lifecycle::workflow::Workflow;
use crate::lifecycle::{LifecycleController, StoryOutcome};
use crate::runtime::agent::{Agent, AgentFactory, AgentState};
use crate::runtime::agent_pool::{AgentPool, PoolStats, SelectionStrategy};
use crate::runtime::circuit_breaker::{BreakerSummary, CircuitBreakerManager};
use crate::runtime::persona::{PersonaProvisioner, TemplatePersonaProvisioner};
use crate::runtime::process_agent::ProcessAgentFactory;
use crate::runtime::process_manager::ProcessManager;
use crate::runtime::warm_pool::{WarmPoolManager, WarmPoolStatus};
use crate::storage::SqliteStore;
use crate::utils::config::FleetConfig;
use crate::utils::errors::{FleetError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot of the whole fleet for external reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub pools: Vec<PoolStats>,
    pub breakers: BreakerSummary,
    pub open_circuits: Vec<String>,
    pub warm_pool: WarmPoolStatus,
    pub running_tasks: Vec<String>,
}

/// Shared state of one fleet process
pub struct FleetContext {
    config: FleetConfig,
    breakers: Arc<CircuitBreakerManager>,
    warm_pool: Arc<WarmPoolManager>,
    lifecycle: Arc<LifecycleController>,
    processes: Arc<ProcessManager>,
    /// role → pool
    pools: RwLock<BTreeMap<String, Arc<AgentPool>>>,
}

impl FleetContext {
    pub fn new(
        config: FleetConfig,
        status: Arc<dyn StatusStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        provisioner: Arc<dyn PersonaProvisioner>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(CircuitBreakerManager::new(config.breaker.clone()));
        let warm_pool = Arc::new(WarmPoolManager::new(config.warm_pool.clone(), provisioner));
        let processes = Arc::new(ProcessManager::new());
        let lifecycle = Arc::new(LifecycleController::new(
            config.lifecycle.clone(),
            status,
            checkpoints,
            processes.clone(),
        )?);

        Ok(Self {
            config,
            breakers,
            warm_pool,
            lifecycle,
            processes,
            pools: RwLock::new(BTreeMap::new()),
        })
    }

    /// Context backed by the SQLite store named in the config
    pub async fn open(config: FleetConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.storage).await?);
        Self::new(
            config,
            store.clone(),
            store,
            Arc::new(TemplatePersonaProvisioner::new()),
        )
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn warm_pool(&self) -> &Arc<WarmPoolManager> {
        &self.warm_pool
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Create the pool for `role` and register it with the warm pool
    pub fn add_pool(&self, role: &str, factory: Arc<dyn AgentFactory>) -> Result<Arc<AgentPool>> {
        if self.pools.read().contains_key(role) {
            return Err(FleetError::ConfigError(format!(
                "pool for role {} already exists",
                role
            )));
        }

        let pool = Arc::new(AgentPool::new(
            format!("{}_pool", role),
            role,
            self.config.pool_for(role),
            factory,
            Arc::clone(&self.breakers),
        ));

        self.pools.write().insert(role.to_string(), Arc::clone(&pool));
        self.warm_pool.register_pool(Arc::clone(&pool));
        info!("Added pool {} for role {}", pool.name(), role);
        Ok(pool)
    }

    /// Create a pool whose agents are worker subprocesses
    pub fn add_process_pool(&self, role: &str) -> Result<Arc<AgentPool>> {
        let factory = Arc::new(ProcessAgentFactory::new(
            self.config.worker.clone(),
            Arc::clone(&self.processes),
        ));
        self.add_pool(role, factory)
    }

    pub fn pool(&self, role: &str) -> Option<Arc<AgentPool>> {
        self.pools.read().get(role).cloned()
    }

    pub fn pools(&self) -> Vec<Arc<AgentPool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Roles named anywhere in the config
    pub fn configured_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .config
            .pools
            .keys()
            .chain(self.config.warm_pool.min_agents.keys())
            .cloned()
            .collect();
        roles.sort();
        roles.dedup();
        roles
    }

    /// Find an agent for a project: a bound Running agent first, else a warm one
    pub fn acquire_agent(&self, role: &str, project_id: &str) -> Option<Arc<dyn Agent>> {
        let pool = self.pool(role)?;

        let bound = pool
            .agents()
            .into_iter()
            .filter(|agent| agent.project_id().as_deref() == Some(project_id))
            .find(|agent| {
                agent.state() == AgentState::Running
                    && self.breakers.can_execute(agent.id())
            });
        if bound.is_some() {
            return bound;
        }

        let warm_id = self.warm_pool.get_warm_agent(role)?;
        if self.warm_pool.assign_warm_agent(&warm_id, project_id) {
            return pool.agent(&warm_id);
        }
        None
    }

    /// Run a task on an agent of `role`
    ///
    /// Uses `get_agent` for unbound work and `acquire_agent` when a project is
    /// given. A pause or cancel comes back as [`FleetError::Stopped`].
    pub async fn dispatch(
        &self,
        role: &str,
        project_id: Option<&str>,
        task_id: &str,
        workflow: &dyn Workflow,
        input: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<StoryOutcome> {
        let agent = match project_id {
            Some(project_id) => self.acquire_agent(role, project_id),
            None => self
                .pool(role)
                .and_then(|pool| pool.get_agent(SelectionStrategy::default())),
        };

        let agent = agent.ok_or_else(|| {
            FleetError::AgentUnavailable(format!("no agent available for role {}", role))
        })?;

        self.lifecycle
            .run_on(agent.as_ref(), task_id, workflow, input, config)
            .await
    }

    /// Start every pool and the warm pool maintenance loop
    pub async fn start(&self) {
        for pool in self.pools() {
            pool.start().await;
        }
        self.warm_pool.start();
    }

    /// Stop maintenance and shut every pool down
    pub async fn shutdown(&self) {
        info!("Shutting down fleet");
        self.warm_pool.stop().await;

        for pool in self.pools() {
            pool.shutdown().await;
        }

        let running = self.lifecycle.running_tasks();
        if !running.is_empty() {
            warn!("{} task(s) still running at shutdown", running.len());
        }
    }

    pub fn status(&self) -> FleetStatus {
        FleetStatus {
            pools: self.pools().iter().map(|p| p.get_pool_stats()).collect(),
            breakers: self.breakers.summary(),
            open_circuits: self.breakers.open_circuits(),
            warm_pool: self.warm_pool.get_status(),
            running_tasks: self.lifecycle.running_tasks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::checkpoint::tests::FlakyStore;
    use crate::lifecycle::status::InMemoryStatusStore;
    use crate::lifecycle::workflow::{StepStream, WorkflowRun};
    use crate::runtime::agent_pool::tests::MockFactory;
    use crate::runtime::agent_pool::SpawnRequest;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct TwoSteps;

    #[async_trait]
    impl Workflow for TwoSteps {
        async fn run(&self, _run: WorkflowRun) -> Result<StepStream> {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(json!({ "step": 1 })),
                Ok(json!({ "step": 2 })),
            ])))
        }
    }

    fn context(config: FleetConfig) -> FleetContext {
        FleetContext::new(
            config,
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(FlakyStore::default()),
            Arc::new(TemplatePersonaProvisioner::new()),
        )
        .unwrap()
    }

    fn config_with_warm(role: &str, n: usize) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.pool.min_agents = 0;
        config.warm_pool.min_agents = HashMap::from([(role.to_string(), n)]);
        config
    }

    #[tokio::test]
    async fn test_dispatch_through_warm_agent() {
        let ctx = context(config_with_warm("developer", 1));
        ctx.add_pool("developer", Arc::new(MockFactory::default())).unwrap();

        ctx.warm_pool().run_maintenance().await;
        assert!(ctx.warm_pool().get_warm_agent("developer").is_some());

        let outcome = ctx
            .dispatch("developer", Some("proj-1"), "task-1", &TwoSteps, json!({}), json!({}))
            .await
            .unwrap();
        assert_eq!(outcome.steps, 2);

        let pool = ctx.pool("developer").unwrap();
        let agent = &pool.agents()[0];
        assert_eq!(agent.project_id().as_deref(), Some("proj-1"));
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(pool.get_pool_stats().successful_executions, 1);

        // same project reuses the bound agent
        ctx.dispatch("developer", Some("proj-1"), "task-2", &TwoSteps, json!({}), json!({}))
            .await
            .unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_agents_fails() {
        let ctx = context(config_with_warm("developer", 1));
        ctx.add_pool("developer", Arc::new(MockFactory::default())).unwrap();

        let err = ctx
            .dispatch("developer", None, "task-1", &TwoSteps, json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentUnavailable(_)));

        let err = ctx
            .dispatch("tester", Some("p"), "task-1", &TwoSteps, json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_status_snapshot_and_shutdown() {
        let ctx = context(config_with_warm("developer", 2));
        let factory = Arc::new(MockFactory::default());
        ctx.add_pool("developer", factory).unwrap();
        assert!(ctx.add_pool("developer", Arc::new(MockFactory::default())).is_err());

        ctx.start().await;
        for _ in 0..50 {
            if ctx.warm_pool().idle_count("developer") == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let status = ctx.status();
        assert_eq!(status.pools.len(), 1);
        assert_eq!(status.pools[0].total_agents, 2);
        assert_eq!(status.warm_pool.total_deficit, 0);
        assert_eq!(status.breakers.health_percentage, 100.0);
        assert!(serde_json::to_string(&status).is_ok());

        ctx.shutdown().await;
        assert!(ctx.pool("developer").unwrap().is_empty());
        assert!(!ctx.warm_pool().is_running());
    }

    #[tokio::test]
    async fn test_configured_roles() {
        let mut config = config_with_warm("developer", 1);
        config.pools.insert("tester".to_string(), config.pool.clone());
        config.pools.insert("developer".to_string(), config.pool.clone());
        let ctx = context(config);
        assert_eq!(ctx.configured_roles(), vec!["developer", "tester"]);
    }

    #[tokio::test]
    async fn test_pool_uses_role_override() {
        let mut config = FleetConfig::default();
        let mut qa = config.pool.clone();
        qa.max_agents = 1;
        qa.min_agents = 0;
        config.pools.insert("qa".to_string(), qa);
        let ctx = context(config);

        let pool = ctx.add_pool("qa", Arc::new(MockFactory::default())).unwrap();
        assert_eq!(pool.name(), "qa_pool");
        assert!(pool.spawn_agent(SpawnRequest::default()).await.is_some());
        assert!(pool.spawn_agent(SpawnRequest::default()).await.is_none());
    }
}
