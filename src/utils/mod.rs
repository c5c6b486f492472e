// src/utils/mod.rs
//! Shared utilities: error types and configuration loading

pub mod config;
pub mod errors;

pub use config::FleetConfig;
pub use errors::{FleetError, Result, StopSignal};
