// src/lib.rs
//! Sentra Lab Fleet Library
//!
//! Runs a fleet of long-lived agent workers inside one process: bounded
//! pools per role, per-agent circuit breakers, warm spares, and
//! pause / resume / cancel with checkpointing for multi-step tasks.
//!
//! # Architecture
//!
//! - **runtime**: agents, pools, circuit breakers, warm pool, worker processes
//! - **lifecycle**: task status, checkpoints, the stepwise lifecycle controller
//! - **storage**: SQLite status/checkpoint store with zstd payloads
//! - **context**: the process-wide `FleetContext` wiring it all together
//! - **observability**: logging setup
//! - **utils**: errors and configuration

pub mod context;
pub mod lifecycle;
pub mod observability;
pub mod runtime;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use context::{FleetContext, FleetStatus};
pub use lifecycle::{LifecycleController, TaskStatus};
pub use runtime::agent_pool::{AgentPool, AgentPoolConfig};
pub use runtime::circuit_breaker::CircuitBreakerManager;
pub use runtime::warm_pool::WarmPoolManager;
pub use utils::config::FleetConfig;
pub use utils::errors::{FleetError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
