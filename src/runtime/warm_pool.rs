// src/runtime/warm_pool.rs
//! Warm pool manager
//!
//! Keeps a target number of idle, unassigned agents per role across several
//! pools so requests can take a ready agent instead of paying cold-start cost.
//!
//! Maintenance pass, per role:
//! 1. Resolve the owning pool: `"{role}_pool"`, else the universal pool
//! 2. Count warm agents (role matches, state Idle, no project binding)
//! 3. Spawn the deficit: provision a persona, then `spawn_agent` on the pool
//!
//! Targets are eventually consistent: a pass spawns what it can and the next
//! pass picks up the rest.

use crate::runtime::agent::{Agent, AgentState};
use crate::runtime::agent_pool::{AgentPool, SpawnRequest};
use crate::runtime::persona::PersonaProvisioner;
use crate::utils::errors::{FleetError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Warm pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    /// Target idle agents per role
    pub min_agents: HashMap<String, usize>,

    /// Seconds between maintenance passes (default: 60)
    pub maintenance_interval_secs: u64,

    /// Pool used for roles without a dedicated `"{role}_pool"`
    pub universal_pool: String,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            min_agents: HashMap::new(),
            maintenance_interval_secs: 60,
            universal_pool: "universal_pool".to_string(),
        }
    }
}

impl WarmPoolConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval_secs == 0 {
            return Err(FleetError::ConfigError(
                "warm_pool.maintenance_interval_secs cannot be 0".to_string(),
            ));
        }
        if self.universal_pool.is_empty() {
            return Err(FleetError::ConfigError(
                "warm_pool.universal_pool cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one maintenance pass for one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMaintenance {
    pub role: String,
    pub pool: Option<String>,
    pub required: usize,
    pub idle_before: usize,
    pub spawn_attempts: usize,
    pub spawned: usize,
    pub error: Option<String>,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub roles: Vec<RoleMaintenance>,
}

impl MaintenanceReport {
    pub fn spawn_attempts(&self) -> usize {
        self.roles.iter().map(|r| r.spawn_attempts).sum()
    }

    pub fn spawned(&self) -> usize {
        self.roles.iter().map(|r| r.spawned).sum()
    }
}

/// Warm availability of one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleWarmStatus {
    pub role: String,
    pub pool: Option<String>,
    pub required: usize,
    pub available: usize,
    /// max(0, required - available)
    pub deficit: usize,
    /// min(100, available / required × 100), 100 when nothing is required
    pub health_percentage: f64,
}

/// Warm availability across all roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmPoolStatus {
    pub running: bool,
    pub roles: Vec<RoleWarmStatus>,
    pub total_required: usize,
    pub total_available: usize,
    pub total_deficit: usize,
    pub health_percentage: f64,
}

fn health_percentage(available: usize, required: usize) -> f64 {
    if required == 0 {
        return 100.0;
    }
    (available as f64 / required as f64 * 100.0).min(100.0)
}

/// Whether `agent` is a warm spare for `role`
///
/// Agents in the universal pool carry the requested role on their descriptor.
fn is_warm_for(agent: &Arc<dyn Agent>, role: &str) -> bool {
    let role_matches = agent.role() == role
        || agent
            .core()
            .descriptor()
            .map(|d| d.role == role)
            .unwrap_or(false);

    role_matches && agent.state() == AgentState::Idle && agent.project_id().is_none()
}

/// Keeps warm agents available across role pools
pub struct WarmPoolManager {
    config: WarmPoolConfig,

    /// role → target idle count
    min_agents: RwLock<BTreeMap<String, usize>>,

    /// pool name → pool
    pools: RwLock<HashMap<String, Arc<AgentPool>>>,

    provisioner: Arc<dyn PersonaProvisioner>,

    /// Serialises maintenance passes
    maintenance: tokio::sync::Mutex<()>,

    shutdown: Mutex<Option<CancellationToken>>,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WarmPoolManager {
    pub fn new(config: WarmPoolConfig, provisioner: Arc<dyn PersonaProvisioner>) -> Self {
        let min_agents = config
            .min_agents
            .iter()
            .map(|(role, n)| (role.clone(), *n))
            .collect();

        Self {
            config,
            min_agents: RwLock::new(min_agents),
            pools: RwLock::new(HashMap::new()),
            provisioner,
            maintenance: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Register a pool under its name, replacing any previous one
    pub fn register_pool(&self, pool: Arc<AgentPool>) {
        let name = pool.name().to_string();
        info!("Warm pool registered pool {} (role: {})", name, pool.role());
        self.pools.write().insert(name, pool);
    }

    pub fn pool(&self, name: &str) -> Option<Arc<AgentPool>> {
        self.pools.read().get(name).cloned()
    }

    /// Set the target idle count for a role. Zero removes the target.
    pub fn set_min_agents(&self, role: impl Into<String>, count: usize) {
        let role = role.into();
        let mut targets = self.min_agents.write();
        if count == 0 {
            targets.remove(&role);
        } else {
            targets.insert(role, count);
        }
    }

    pub fn min_agents(&self) -> BTreeMap<String, usize> {
        self.min_agents.read().clone()
    }

    /// Owning pool for a role: the dedicated pool, else the universal pool
    pub fn resolve_pool(&self, role: &str) -> Option<Arc<AgentPool>> {
        let pools = self.pools.read();
        pools
            .get(&format!("{}_pool", role))
            .or_else(|| pools.get(&self.config.universal_pool))
            .cloned()
    }

    /// Idle, unassigned agents of `role` in its owning pool
    pub fn idle_count(&self, role: &str) -> usize {
        match self.resolve_pool(role) {
            Some(pool) => pool
                .agents()
                .iter()
                .filter(|agent| is_warm_for(agent, role))
                .count(),
            None => 0,
        }
    }

    /// Run one maintenance pass over every role with a target
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let _guard = self.maintenance.lock().await;
        let targets = self.min_agents();
        let mut report = MaintenanceReport::default();

        for (role, required) in targets {
            let outcome = self.maintain_role(&role, required).await;
            if outcome.spawned < outcome.spawn_attempts || outcome.error.is_some() {
                warn!(
                    "Warm pool for {}: spawned {}/{} ({})",
                    role,
                    outcome.spawned,
                    outcome.spawn_attempts,
                    outcome.error.as_deref().unwrap_or("pool refused spawn")
                );
            }
            report.roles.push(outcome);
        }

        if report.spawn_attempts() > 0 {
            info!(
                "Warm pool maintenance spawned {}/{} agents",
                report.spawned(),
                report.spawn_attempts()
            );
        }
        report
    }

    async fn maintain_role(&self, role: &str, required: usize) -> RoleMaintenance {
        let mut outcome = RoleMaintenance {
            role: role.to_string(),
            pool: None,
            required,
            idle_before: 0,
            spawn_attempts: 0,
            spawned: 0,
            error: None,
        };

        let pool = match self.resolve_pool(role) {
            Some(pool) => pool,
            None => {
                outcome.error = Some(format!("no pool for role {}", role));
                return outcome;
            }
        };
        outcome.pool = Some(pool.name().to_string());

        let idle = self.idle_count(role);
        outcome.idle_before = idle;
        if idle >= required {
            debug!("Warm pool for {} satisfied ({}/{})", role, idle, required);
            return outcome;
        }

        let deficit = required - idle;
        debug!("Warm pool for {} short by {}", role, deficit);

        for _ in 0..deficit {
            outcome.spawn_attempts += 1;

            let descriptor = match self.provisioner.provision(role).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    break;
                }
            };

            match pool
                .spawn_agent(SpawnRequest::default().with_descriptor(descriptor))
                .await
            {
                Some(agent) => {
                    debug!("Warm agent {} ready for {}", agent.id(), role);
                    outcome.spawned += 1;
                }
                // pool full or start failed; retry on the next pass
                None => break,
            }
        }

        outcome
    }

    /// First warm agent for `role`, if any
    pub fn get_warm_agent(&self, role: &str) -> Option<String> {
        let pool = self.resolve_pool(role)?;
        pool.agents()
            .into_iter()
            .find(|agent| is_warm_for(agent, role))
            .map(|agent| agent.id().to_string())
    }

    /// Bind a warm agent to a project. Refuses agents already bound.
    pub fn assign_warm_agent(&self, agent_id: &str, project_id: &str) -> bool {
        let agent = self
            .pools
            .read()
            .values()
            .find_map(|pool| pool.agent(agent_id));

        let Some(agent) = agent else {
            warn!("Warm agent {} not found", agent_id);
            return false;
        };

        if agent.core().assign_project(project_id) {
            info!("Assigned warm agent {} to project {}", agent_id, project_id);
            true
        } else {
            warn!(
                "Agent {} is already bound to {}",
                agent_id,
                agent.project_id().unwrap_or_default()
            );
            false
        }
    }

    /// Warm availability snapshot for every role with a target
    pub fn get_status(&self) -> WarmPoolStatus {
        let roles: Vec<RoleWarmStatus> = self
            .min_agents()
            .into_iter()
            .map(|(role, required)| {
                let available = self.idle_count(&role);
                RoleWarmStatus {
                    pool: self.resolve_pool(&role).map(|p| p.name().to_string()),
                    required,
                    available,
                    deficit: required.saturating_sub(available),
                    health_percentage: health_percentage(available, required),
                    role,
                }
            })
            .collect();

        let total_required = roles.iter().map(|r| r.required).sum();
        let total_available = roles.iter().map(|r| r.available.min(r.required)).sum();
        let total_deficit = roles.iter().map(|r| r.deficit).sum();

        WarmPoolStatus {
            running: self.is_running(),
            roles,
            total_required,
            total_available,
            total_deficit,
            health_percentage: health_percentage(total_available, total_required),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Start the maintenance loop. The first pass runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            debug!("Warm pool maintenance already running");
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let manager = Arc::clone(self);
        let period = self.config.maintenance_interval();
        info!("Starting warm pool maintenance (every {:?})", period);

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let pass = tokio::spawn({
                            let manager = Arc::clone(&manager);
                            async move { manager.run_maintenance().await }
                        });
                        if let Err(e) = pass.await {
                            error!("Warm pool maintenance pass failed: {}", e);
                        }
                    }
                }
            }
            debug!("Warm pool maintenance stopped");
        }));
    }

    /// Stop the maintenance loop and wait for it to exit
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("Warm pool loop ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agent_pool::tests::MockFactory;
    use crate::runtime::agent_pool::AgentPoolConfig;
    use crate::runtime::circuit_breaker::CircuitBreakerManager;
    use crate::runtime::persona::TemplatePersonaProvisioner;
    use async_trait::async_trait;
    use crate::runtime::agent::AgentDescriptor;

    fn pool(name: &str, role: &str, max: usize, factory: Arc<MockFactory>) -> Arc<AgentPool> {
        Arc::new(AgentPool::new(
            name,
            role,
            AgentPoolConfig {
                min_agents: 0,
                max_agents: max,
                ..Default::default()
            },
            factory,
            Arc::new(CircuitBreakerManager::default()),
        ))
    }

    fn manager(targets: &[(&str, usize)]) -> Arc<WarmPoolManager> {
        let config = WarmPoolConfig {
            min_agents: targets.iter().map(|(r, n)| (r.to_string(), *n)).collect(),
            ..Default::default()
        };
        Arc::new(WarmPoolManager::new(
            config,
            Arc::new(TemplatePersonaProvisioner::new()),
        ))
    }

    #[tokio::test]
    async fn test_maintenance_fills_deficit() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&[("developer", 2)]);
        manager.register_pool(pool("developer_pool", "developer", 5, Arc::clone(&factory)));

        assert_eq!(manager.idle_count("developer"), 0);
        let report = manager.run_maintenance().await;

        assert_eq!(report.spawn_attempts(), 2);
        assert_eq!(report.spawned(), 2);
        assert_eq!(factory.created_count(), 2);
        assert_eq!(manager.idle_count("developer"), 2);

        // satisfied targets spawn nothing
        let report = manager.run_maintenance().await;
        assert_eq!(report.spawn_attempts(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_bounded_by_capacity() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&[("developer", 3)]);
        manager.register_pool(pool("developer_pool", "developer", 1, factory));

        let report = manager.run_maintenance().await;
        assert_eq!(report.spawned(), 1);
        assert_eq!(manager.idle_count("developer"), 1);

        let status = manager.get_status();
        assert_eq!(status.roles[0].deficit, 2);
        assert!((status.roles[0].health_percentage - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_universal_pool_fallback() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&[("designer", 1)]);
        manager.register_pool(pool("universal_pool", "universal", 4, factory));

        let report = manager.run_maintenance().await;
        assert_eq!(report.roles[0].pool.as_deref(), Some("universal_pool"));
        assert_eq!(manager.idle_count("designer"), 1);
        assert!(manager.get_warm_agent("designer").is_some());
    }

    #[tokio::test]
    async fn test_missing_pool_reported() {
        let manager = manager(&[("qa", 1)]);
        let report = manager.run_maintenance().await;
        assert!(report.roles[0].error.is_some());
        assert_eq!(manager.get_status().total_deficit, 1);
    }

    struct FailingProvisioner;

    #[async_trait]
    impl PersonaProvisioner for FailingProvisioner {
        async fn provision(&self, role: &str) -> Result<AgentDescriptor> {
            Err(FleetError::ProvisioningFailed(format!("template store down for {}", role)))
        }
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_spawn() {
        let factory = Arc::new(MockFactory::default());
        let manager = Arc::new(WarmPoolManager::new(
            WarmPoolConfig {
                min_agents: HashMap::from([("developer".to_string(), 2)]),
                ..Default::default()
            },
            Arc::new(FailingProvisioner),
        ));
        manager.register_pool(pool("developer_pool", "developer", 5, Arc::clone(&factory)));

        let report = manager.run_maintenance().await;
        assert_eq!(report.spawned(), 0);
        assert!(report.roles[0].error.is_some());
        assert_eq!(factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_get_and_assign_warm_agent() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&[("developer", 1)]);
        let dev_pool = pool("developer_pool", "developer", 3, factory);
        manager.register_pool(Arc::clone(&dev_pool));

        assert!(manager.get_warm_agent("developer").is_none());
        manager.run_maintenance().await;

        let agent_id = manager.get_warm_agent("developer").unwrap();
        assert!(manager.assign_warm_agent(&agent_id, "proj-9"));
        assert!(!manager.assign_warm_agent(&agent_id, "proj-10"));
        assert!(!manager.assign_warm_agent("ghost", "proj-9"));

        let agent = dev_pool.agent(&agent_id).unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(agent.project_id().as_deref(), Some("proj-9"));

        // the bound agent no longer counts as warm
        assert_eq!(manager.idle_count("developer"), 0);
        assert!(manager.get_warm_agent("developer").is_none());
    }

    #[tokio::test]
    async fn test_status_percentages() {
        let manager = manager(&[]);
        let status = manager.get_status();
        assert_eq!(status.health_percentage, 100.0);
        assert_eq!(status.total_deficit, 0);

        manager.set_min_agents("developer", 4);
        let factory = Arc::new(MockFactory::default());
        let dev_pool = pool("developer_pool", "developer", 10, factory);
        manager.register_pool(Arc::clone(&dev_pool));
        for _ in 0..2 {
            dev_pool.spawn_agent(SpawnRequest::default()).await.unwrap();
        }

        let status = manager.get_status();
        assert_eq!(status.roles[0].available, 2);
        assert_eq!(status.roles[0].deficit, 2);
        assert_eq!(status.health_percentage, 50.0);

        manager.set_min_agents("developer", 0);
        assert!(manager.get_status().roles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_immediately_and_stops() {
        let factory = Arc::new(MockFactory::default());
        let manager = manager(&[("developer", 2)]);
        manager.register_pool(pool("developer_pool", "developer", 5, Arc::clone(&factory)));

        manager.start();
        assert!(manager.is_running());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.idle_count("developer"), 2);

        manager.stop().await;
        assert!(!manager.is_running());
    }
}
