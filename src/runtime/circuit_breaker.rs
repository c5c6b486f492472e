// src/runtime/circuit_breaker.rs
//! Per-agent circuit breakers
//!
//! State machine: Closed → Open → HalfOpen → Closed
//! - Consecutive failures in Closed trip the breaker once they reach
//!   `failure_threshold`
//! - Open blocks dispatch until `recovery_timeout` has passed since the last
//!   failure; the first `can_execute()` after that moves to HalfOpen
//! - HalfOpen closes after `half_open_max_calls` successes and re-opens on
//!   any failure
//!
//! One breaker exists per agent id. The [`CircuitBreakerManager`] creates them
//! lazily and drops them when the agent is terminated.

use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    pub failure_threshold: u32,

    /// Seconds to wait after the last failure before probing (default: 60)
    pub recovery_timeout_secs: u64,

    /// Successful trial calls needed in HalfOpen to close (default: 3)
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(FleetError::ConfigError(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(FleetError::ConfigError(
                "breaker.half_open_max_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub agent_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_state_change_at: DateTime<Utc>,
    pub seconds_in_state: f64,
}

/// Failure-isolation state machine for one agent
#[derive(Debug)]
pub struct CircuitBreaker {
    agent_id: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Consecutive failures while Closed
    failure_count: u32,
    /// Successes since the last state change
    success_count: u32,
    half_open_successes: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    total_failures: u64,
    total_successes: u64,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_successes: 0,
            last_failure_time: None,
            last_failure_at: None,
            last_error: None,
            last_state_change: Instant::now(),
            last_state_change_at: Utc::now(),
            total_failures: 0,
            total_successes: 0,
            trips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn half_open_successes(&self) -> u32 {
        self.half_open_successes
    }

    fn transition_to(&mut self, new_state: CircuitState) {
        let old = self.state;
        self.state = new_state;
        self.last_state_change = Instant::now();
        self.last_state_change_at = Utc::now();
        self.success_count = 0;

        match new_state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.half_open_successes = 0;
            }
            CircuitState::Open => {
                self.half_open_successes = 0;
                self.trips += 1;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
            }
        }

        debug!(
            "Circuit breaker for {} transitioned {} -> {}",
            self.agent_id, old, new_state
        );
    }

    /// Record a successful execution
    pub fn record_success(&mut self) {
        self.total_successes += 1;
        self.success_count += 1;

        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_max_calls {
                    info!(
                        "Circuit breaker for {} recovered after {} trial calls",
                        self.agent_id, self.half_open_successes
                    );
                    self.transition_to(CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {
                // dispatch is blocked while open, so this is a late result
                debug!("Success recorded for {} while circuit is open", self.agent_id);
            }
        }
    }

    /// Record a failed execution
    pub fn record_failure(&mut self, error: Option<&str>) {
        self.failure_count += 1;
        self.total_failures += 1;
        self.last_failure_time = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }

        match self.state {
            CircuitState::HalfOpen => {
                warn!(
                    "Trial call failed for {}, re-opening circuit",
                    self.agent_id
                );
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker for {} opened after {} consecutive failures",
                        self.agent_id, self.failure_count
                    );
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Whether work may be dispatched to the agent
    ///
    /// An open breaker whose recovery window has passed moves to HalfOpen here.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map(|at| at.elapsed() >= self.config.recovery_timeout())
                    .unwrap_or(true);

                if elapsed {
                    info!(
                        "Recovery timeout elapsed for {}, circuit half-open",
                        self.agent_id
                    );
                    self.transition_to(CircuitState::HalfOpen);
                }
                elapsed
            }
        }
    }

    /// Manually close the circuit
    pub fn reset(&mut self) {
        info!("Circuit breaker for {} manually reset", self.agent_id);
        self.transition_to(CircuitState::Closed);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            agent_id: self.agent_id.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_successes: self.half_open_successes,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            trips: self.trips,
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
            last_state_change_at: self.last_state_change_at,
            seconds_in_state: self.last_state_change.elapsed().as_secs_f64(),
        }
    }
}

/// Aggregate health of all breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    /// closed / total × 100, or 100 when there are no breakers
    pub health_percentage: f64,
}

/// Registry of breakers keyed by agent id
pub struct CircuitBreakerManager {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Fetch the breaker for `agent_id`, creating it on first access
    ///
    /// `overrides` only applies when the breaker is created.
    pub fn get_or_create(
        &self,
        agent_id: &str,
        overrides: Option<CircuitBreakerConfig>,
    ) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(agent_id) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(agent_id.to_string()).or_insert_with(|| {
            debug!("Creating circuit breaker for {}", agent_id);
            let config = overrides.unwrap_or_else(|| self.defaults.clone());
            Arc::new(Mutex::new(CircuitBreaker::new(agent_id, config)))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Mutex<CircuitBreaker>>> {
        self.breakers.get(agent_id).map(|b| Arc::clone(b.value()))
    }

    /// Drop the breaker of a terminated agent
    pub fn remove(&self, agent_id: &str) -> bool {
        let removed = self.breakers.remove(agent_id).is_some();
        if removed {
            debug!("Removed circuit breaker for {}", agent_id);
        }
        removed
    }

    pub fn can_execute(&self, agent_id: &str) -> bool {
        self.get_or_create(agent_id, None).lock().can_execute()
    }

    pub fn record_success(&self, agent_id: &str) {
        self.get_or_create(agent_id, None).lock().record_success();
    }

    pub fn record_failure(&self, agent_id: &str, error: Option<&str>) {
        self.get_or_create(agent_id, None).lock().record_failure(error);
    }

    pub fn reset(&self, agent_id: &str) -> bool {
        match self.get(agent_id) {
            Some(breaker) => {
                breaker.lock().reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().lock().reset();
        }
    }

    fn ids_in_state(&self, state: CircuitState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().lock().state() == state)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn open_circuits(&self) -> Vec<String> {
        self.ids_in_state(CircuitState::Open)
    }

    pub fn half_open_circuits(&self) -> Vec<String> {
        self.ids_in_state(CircuitState::HalfOpen)
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().lock().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        snapshots
    }

    pub fn summary(&self) -> BreakerSummary {
        let mut summary = BreakerSummary {
            total: 0,
            closed: 0,
            open: 0,
            half_open: 0,
            health_percentage: 100.0,
        };

        for entry in self.breakers.iter() {
            summary.total += 1;
            match entry.value().lock().state() {
                CircuitState::Closed => summary.closed += 1,
                CircuitState::Open => summary.open += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
            }
        }

        if summary.total > 0 {
            summary.health_percentage = summary.closed as f64 / summary.total as f64 * 100.0;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(threshold: u32, recovery_secs: u64, trial_calls: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            half_open_max_calls: trial_calls,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_scenario() {
        let mut breaker = CircuitBreaker::new("agent-1", config(3, 60, 2));

        for _ in 0..3 {
            breaker.record_failure(Some("timeout"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_blocks_until_timeout() {
        let mut breaker = CircuitBreaker::new("agent-1", config(2, 30, 1));
        breaker.record_failure(None);
        breaker.record_failure(None);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new("agent-1", config(1, 10, 3));
        breaker.record_failure(Some("crash"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_execute());

        breaker.record_success();
        breaker.record_failure(Some("crash again"));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.trips, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("crash again"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new("agent-1", config(3, 60, 1));
        breaker.record_failure(None);
        breaker.record_failure(None);
        breaker.record_success();
        breaker.record_failure(None);
        breaker.record_failure(None);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[test]
    fn test_manual_reset() {
        let mut breaker = CircuitBreaker::new("agent-1", config(1, 600, 1));
        breaker.record_failure(None);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_manager_lazy_creation_and_removal() {
        let manager = CircuitBreakerManager::new(config(2, 60, 1));
        assert!(manager.is_empty());

        let first = manager.get_or_create("agent-1", None);
        let second = manager.get_or_create("agent-1", Some(config(9, 9, 9)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().config().failure_threshold, 2);

        let custom = manager.get_or_create("agent-2", Some(config(9, 9, 9)));
        assert_eq!(custom.lock().config().failure_threshold, 9);

        assert!(manager.remove("agent-1"));
        assert!(!manager.remove("agent-1"));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_manager_summary() {
        let manager = CircuitBreakerManager::new(config(1, 600, 1));
        assert_eq!(manager.summary().health_percentage, 100.0);

        manager.record_success("agent-1");
        manager.record_success("agent-2");
        manager.record_success("agent-3");
        manager.record_failure("agent-4", Some("boom"));

        let summary = manager.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.closed, 3);
        assert_eq!(summary.open, 1);
        assert_eq!(summary.health_percentage, 75.0);
        assert_eq!(manager.open_circuits(), vec!["agent-4".to_string()]);
        assert!(manager.half_open_circuits().is_empty());
        assert!(!manager.can_execute("agent-4"));

        manager.reset_all();
        assert!(manager.open_circuits().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(config(0, 60, 1).validate().is_err());
        assert!(config(1, 60, 0).validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_closed_never_holds_threshold_failures(
            threshold in 1u32..6,
            outcomes in proptest::collection::vec(any::<bool>(), 0..64),
        ) {
            // recovery window far in the future so the breaker never half-opens
            let mut breaker = CircuitBreaker::new("agent", config(threshold, 3600, 1));
            let mut consecutive = 0u32;

            for success in outcomes {
                let before = breaker.state();
                if success {
                    breaker.record_success();
                    consecutive = 0;
                } else {
                    breaker.record_failure(None);
                    consecutive += 1;
                }

                if breaker.state() == CircuitState::Closed {
                    prop_assert!(breaker.failure_count() < threshold);
                }
                if before == CircuitState::Closed && consecutive >= threshold {
                    prop_assert_eq!(breaker.state(), CircuitState::Open);
                }
                // closing only happens through HalfOpen
                if before == CircuitState::Open {
                    prop_assert_eq!(breaker.state(), CircuitState::Open);
                }
            }
        }
    }
}
