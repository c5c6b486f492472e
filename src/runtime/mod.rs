// src/runtime/mod.rs
//! Agent runtime
//!
//! - **Agent**: the worker contract and shared bookkeeping
//! - **Agent Pool**: spawn / terminate / select plus health and autoscale loops
//! - **Circuit Breaker**: per-agent failure isolation
//! - **Warm Pool**: idle, unassigned spares per role
//! - **Process Agent**: agents backed by worker subprocesses
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── WarmPoolManager ─────────────────────────┐
//! │   targets: developer=2, tester=1        (maintenance every 60s)  │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │ spawn_agent                      │ spawn_agent
//!        ┌────────▼─────────┐               ┌────────▼─────────┐
//!        │  developer_pool  │               │   tester_pool    │
//!        │ ┌────┐┌────┐┌──┐ │               │ ┌────┐┌────┐     │
//!        │ │idle││busy││..│ │               │ │run ││idle│     │
//!        │ └────┘└────┘└──┘ │               │ └────┘└────┘     │
//!        └────────┬─────────┘               └────────┬─────────┘
//!                 │ eligible?                        │
//!                 └──────────► CircuitBreakerManager ◄┘
//! ```

pub mod agent;
pub mod agent_pool;
pub mod circuit_breaker;
pub mod persona;
pub mod process_agent;
pub mod process_manager;
pub mod warm_pool;

// Re-export commonly used types
pub use agent::{Agent, AgentCore, AgentFactory, AgentHealth, AgentListener, AgentSpec, AgentState};
pub use agent_pool::{AgentPool, AgentPoolConfig, PoolStats, SelectionStrategy, SpawnRequest};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use persona::{PersonaProvisioner, TemplatePersonaProvisioner};
pub use process_agent::{ProcessAgent, ProcessAgentConfig, ProcessAgentFactory};
pub use process_manager::{CommandSpec, ProcessManager};
pub use warm_pool::{WarmPoolConfig, WarmPoolManager, WarmPoolStatus};
