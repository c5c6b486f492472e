// src/main.rs
//! Sentra Lab Fleet daemon
//!
//! Keeps process-backed agent pools and their warm spares running until
//! interrupted.

use anyhow::{Context, Result};
use sentra_lab_fleet::observability::init_tracing;
use sentra_lab_fleet::utils::config::FleetConfig;
use sentra_lab_fleet::FleetContext;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = FleetConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting Sentra Lab Fleet v{}", env!("CARGO_PKG_VERSION"));

    let fleet = FleetContext::open(config)
        .await
        .context("Failed to initialize fleet")?;

    let roles = fleet.configured_roles();
    if roles.is_empty() {
        warn!("No roles configured; set [pools.<role>] or [warm_pool.min_agents]");
    }
    for role in &roles {
        fleet.add_process_pool(role)?;
    }

    fleet.start().await;
    info!("Fleet running with {} pool(s)", roles.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    fleet.shutdown().await;

    let status = fleet.status();
    info!(
        "Fleet stopped (breaker health {:.0}%, warm deficit {})",
        status.breakers.health_percentage, status.warm_pool.total_deficit
    );
    Ok(())
}
