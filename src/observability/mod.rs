// src/observability/mod.rs
//! Logging setup
//!
//! The fleet only emits structured logs. Pool stats, breaker summaries and
//! warm-pool status are exposed as snapshot structs for whoever embeds the
//! crate to report on; nothing here pushes metrics.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{FleetError, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| FleetError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| FleetError::ConfigError(format!("Failed to install subscriber: {}", e)))
}
