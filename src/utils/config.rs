// src/utils/config.rs
//! Fleet configuration
//!
//! Layered with the `config` crate:
//!
//! 1. Built-in defaults (every section implements `Default`)
//! 2. Optional file named by `FLEET_CONFIG` (default `fleet.toml`, any format
//!    the `config` crate understands)
//! 3. Environment overrides, e.g. `FLEET__POOL__MAX_AGENTS=20`
//!
//! The merged result is validated before it is handed to the fleet.

use crate::lifecycle::LifecycleConfig;
use crate::runtime::agent_pool::AgentPoolConfig;
use crate::runtime::circuit_breaker::CircuitBreakerConfig;
use crate::runtime::process_agent::ProcessAgentConfig;
use crate::runtime::warm_pool::WarmPoolConfig;
use crate::storage::StorageConfig;
use crate::utils::errors::{FleetError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "FLEET_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "FLEET";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level fleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Defaults applied to every agent pool
    pub pool: AgentPoolConfig,

    /// Per-role overrides of the pool defaults
    pub pools: HashMap<String, AgentPoolConfig>,

    /// Circuit breaker defaults
    pub breaker: CircuitBreakerConfig,

    /// Warm spare targets
    pub warm_pool: WarmPoolConfig,

    /// Pause/resume/checkpoint behaviour
    pub lifecycle: LifecycleConfig,

    /// Durable status and checkpoint store
    pub storage: StorageConfig,

    /// Worker process settings
    pub worker: ProcessAgentConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            pool: AgentPoolConfig::default(),
            pools: HashMap::new(),
            breaker: CircuitBreakerConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            lifecycle: LifecycleConfig::default(),
            storage: StorageConfig::default(),
            worker: ProcessAgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from defaults, the optional config file and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "fleet.toml".to_string());
        Self::load_from(&path)
    }

    /// Load configuration using an explicit file path
    pub fn load_from(path: &str) -> Result<Self> {
        debug!("Loading fleet configuration (file: {})", path);

        let defaults = Config::try_from(&FleetConfig::default())?;

        let config: FleetConfig = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Pool configuration for a role: the role override if present, else the defaults
    pub fn pool_for(&self, role: &str) -> AgentPoolConfig {
        self.pools.get(role).cloned().unwrap_or_else(|| self.pool.clone())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        for (role, pool) in &self.pools {
            pool.validate()
                .map_err(|e| FleetError::ConfigError(format!("pools.{}: {}", role, e)))?;
        }
        self.breaker.validate()?;
        self.warm_pool.validate()?;
        self.lifecycle.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_pool_for_role_override() {
        let mut config = FleetConfig::default();
        config.pools.insert(
            "developer".to_string(),
            AgentPoolConfig {
                max_agents: 3,
                ..Default::default()
            },
        );

        assert_eq!(config.pool_for("developer").max_agents, 3);
        assert_eq!(config.pool_for("reviewer").max_agents, config.pool.max_agents);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut config = FleetConfig::default();
        config.pools.insert(
            "developer".to_string(),
            AgentPoolConfig {
                min_agents: 5,
                max_agents: 2,
                ..Default::default()
            },
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pools.developer"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(
            &path,
            r#"
[pool]
max_agents = 4

[breaker]
failure_threshold = 7

[warm_pool.min_agents]
developer = 2
"#,
        )
        .unwrap();

        let config = FleetConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.pool.max_agents, 4);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.warm_pool.min_agents.get("developer"), Some(&2));
        // untouched fields keep their defaults
        assert_eq!(config.breaker.half_open_max_calls, 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = FleetConfig::load_from("/nonexistent/fleet.toml").unwrap();
        assert_eq!(config.pool.max_agents, AgentPoolConfig::default().max_agents);
    }
}
