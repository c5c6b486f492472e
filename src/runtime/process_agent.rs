// src/runtime/process_agent.rs
//! Agent backed by an OS subprocess
//!
//! Each agent owns one long-lived worker process:
//! - Spawned through the shared [`ProcessManager`] on `start`
//! - Identity passed through `AGENT_*` environment variables
//! - Health = the process has not exited
//! - Stop = SIGTERM, bounded wait, then SIGKILL

use crate::runtime::agent::{
    Agent, AgentCore, AgentFactory, AgentHealth, AgentListener, AgentSpec, AgentState,
};
use crate::runtime::process_manager::{CommandSpec, ProcessManager};
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Configuration of the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessAgentConfig {
    /// Worker executable (looked up on `PATH`)
    pub command: String,

    pub args: Vec<String>,

    /// Extra environment for the worker
    pub env: HashMap<String, String>,

    /// Working directory; empty means inherit
    pub work_dir: String,

    /// How long a graceful stop waits for the in-flight task (default: 300)
    pub graceful_wait_secs: u64,

    /// Wait between SIGTERM and SIGKILL on stop (default: 5)
    pub exit_timeout_secs: u64,
}

impl Default for ProcessAgentConfig {
    fn default() -> Self {
        Self {
            command: "sentra-agent".to_string(),
            args: vec![],
            env: HashMap::new(),
            work_dir: String::new(),
            graceful_wait_secs: 300,
            exit_timeout_secs: 5,
        }
    }
}

/// Agent running as a subprocess
pub struct ProcessAgent {
    core: AgentCore,
    config: ProcessAgentConfig,
    manager: Arc<ProcessManager>,
    process: Mutex<Option<Child>>,
}

impl ProcessAgent {
    pub fn new(
        spec: AgentSpec,
        listener: Arc<dyn AgentListener>,
        config: ProcessAgentConfig,
        manager: Arc<ProcessManager>,
    ) -> Self {
        Self {
            core: AgentCore::new(spec, listener),
            config,
            manager,
            process: Mutex::new(None),
        }
    }

    fn command_spec(&self) -> Result<CommandSpec> {
        let mut spec = CommandSpec::new(&self.config.command)
            .env("AGENT_ID", self.core.id())
            .env("AGENT_ROLE", self.core.role())
            .env(
                "AGENT_HEARTBEAT_SECS",
                self.core.heartbeat_interval().as_secs().to_string(),
            );
        spec.args = self.config.args.clone();

        if let Some(project_id) = self.core.project_id() {
            spec = spec.env("AGENT_PROJECT_ID", project_id);
        }
        if let Some(descriptor) = self.core.descriptor() {
            spec = spec
                .env("AGENT_NAME", &descriptor.name)
                .env("AGENT_PERSONA", serde_json::to_string(&descriptor.persona)?);
        }
        for (key, value) in &self.config.env {
            spec = spec.env(key, value);
        }
        if !self.config.work_dir.is_empty() {
            spec.work_dir = Some(self.config.work_dir.clone());
        }
        Ok(spec)
    }

    /// Pid of the worker process, if it is running
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting worker process for agent {}", self.core.id());

        let spec = self.command_spec()?;
        let mut child = match self.manager.spawn(&spec) {
            Ok(child) => child,
            Err(e) => {
                self.core.set_state(AgentState::Error);
                return Err(FleetError::SpawnFailed(format!(
                    "agent {}: {}",
                    self.core.id(),
                    e
                )));
            }
        };

        if let Ok(Some(status)) = child.try_wait() {
            self.core.set_state(AgentState::Error);
            return Err(FleetError::SpawnFailed(format!(
                "agent {} exited immediately with {}",
                self.core.id(),
                status
            )));
        }

        *self.process.lock().await = Some(child);
        self.core.mark_started();
        Ok(())
    }

    async fn stop(&self, graceful: bool) -> Result<()> {
        if graceful {
            let wait = Duration::from_secs(self.config.graceful_wait_secs);
            if !self.core.wait_until_idle(wait).await {
                warn!(
                    "Agent {} still busy after {:?}, stopping anyway",
                    self.core.id(),
                    wait
                );
            }
        } else {
            self.core.abort_execution();
        }
        self.core.set_state(AgentState::Stopping);

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            let exit_timeout = Duration::from_secs(self.config.exit_timeout_secs);

            if graceful {
                if let Some(pid) = child.id() {
                    self.manager.terminate(pid)?;
                }
                match tokio::time::timeout(exit_timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!("Agent {} exited with {}", self.core.id(), status);
                    }
                    Ok(Err(e)) => error!("Error waiting for agent {}: {}", self.core.id(), e),
                    Err(_) => {
                        warn!("Agent {} ignored SIGTERM, killing", self.core.id());
                    }
                }
            }

            if let Err(e) = child.start_kill() {
                // already exited and reaped above
                debug!("Kill of agent {}: {}", self.core.id(), e);
            }
            if tokio::time::timeout(exit_timeout, child.wait()).await.is_err() {
                self.core.set_state(AgentState::Error);
                return Err(FleetError::StopFailed(format!(
                    "agent {} did not exit",
                    self.core.id()
                )));
            }
        }

        self.core.set_state(AgentState::Terminated);
        Ok(())
    }

    async fn health_check(&self) -> Result<AgentHealth> {
        let mut process = self.process.lock().await;

        let (healthy, detail) = match process.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => (true, None),
                Ok(Some(status)) => (false, Some(format!("worker exited with {}", status))),
                Err(e) => {
                    return Err(FleetError::HealthCheckFailed(format!(
                        "agent {}: {}",
                        self.core.id(),
                        e
                    )))
                }
            },
            None => (false, Some("no worker process".to_string())),
        };
        drop(process);

        let detail = if healthy && self.core.idle_expired() {
            Some(format!(
                "idle for {:.0}s, max {}s",
                self.core.idle_seconds(),
                self.core.max_idle_time().as_secs()
            ))
        } else {
            detail
        };

        if healthy {
            self.core.heartbeat();
        } else if self.core.state().is_active() {
            self.core.set_state(AgentState::Error);
        }

        Ok(AgentHealth {
            agent_id: self.core.id().to_string(),
            healthy,
            idle_seconds: self.core.idle_seconds(),
            state: self.core.state(),
            detail,
        })
    }
}

/// Builds [`ProcessAgent`]s for a pool
pub struct ProcessAgentFactory {
    config: ProcessAgentConfig,
    manager: Arc<ProcessManager>,
}

impl ProcessAgentFactory {
    pub fn new(config: ProcessAgentConfig, manager: Arc<ProcessManager>) -> Self {
        Self { config, manager }
    }
}

impl AgentFactory for ProcessAgentFactory {
    fn create(&self, spec: AgentSpec, listener: Arc<dyn AgentListener>) -> Result<Arc<dyn Agent>> {
        Ok(Arc::new(ProcessAgent::new(
            spec,
            listener,
            self.config.clone(),
            Arc::clone(&self.manager),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agent::NoopListener;

    fn sleeper() -> ProcessAgentConfig {
        ProcessAgentConfig {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            exit_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn agent(config: ProcessAgentConfig) -> Arc<dyn Agent> {
        let factory = ProcessAgentFactory::new(config, Arc::new(ProcessManager::new()));
        factory
            .create(AgentSpec::new("worker-1", "developer"), Arc::new(NoopListener))
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let agent = agent(sleeper());
        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Idle);

        let health = agent.health_check().await.unwrap();
        assert!(health.healthy);

        agent.stop(true).await.unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);

        let health = agent.health_check().await.unwrap();
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_forced_stop() {
        let agent = agent(sleeper());
        agent.start().await.unwrap();
        agent.stop(false).await.unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_health_reports_idle_expiry() {
        let mut spec = AgentSpec::new("worker-1", "developer");
        spec.max_idle_time = Duration::from_millis(10);
        let factory = ProcessAgentFactory::new(sleeper(), Arc::new(ProcessManager::new()));
        let agent = factory.create(spec, Arc::new(NoopListener)).unwrap();
        agent.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = agent.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.detail.unwrap().contains("idle"));
        assert!(agent.core().idle_expired());
        assert_eq!(agent.state(), AgentState::Idle);

        agent.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_stop_cancels_running_task() {
        let factory = ProcessAgentFactory::new(sleeper(), Arc::new(ProcessManager::new()));
        let agent = factory
            .create(AgentSpec::new("worker-1", "developer").ready(), Arc::new(NoopListener))
            .unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        let worker = Arc::clone(&agent);
        let task = tokio::spawn(async move {
            worker
                .core()
                .run_execution(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        agent.stop(false).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(FleetError::AgentUnavailable(_))));
        assert_eq!(agent.state(), AgentState::Terminated);
        assert_eq!(agent.counters().total, 0);
    }

    #[tokio::test]
    async fn test_exited_worker_is_unhealthy() {
        let agent = agent(ProcessAgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 0.1".to_string()],
            ..Default::default()
        });
        agent.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let health = agent.health_check().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(agent.state(), AgentState::Error);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_start() {
        let agent = agent(ProcessAgentConfig {
            command: "definitely-not-a-real-binary-42".to_string(),
            ..Default::default()
        });
        assert!(agent.start().await.is_err());
        assert_eq!(agent.state(), AgentState::Error);
    }
}
