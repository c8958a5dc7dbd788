//! Per-project upstream circuit breaker.
//!
//! Counts consecutive transport failures (connect errors, timeouts) against
//! each project's upstream. Upstream HTTP statuses, 5xx included, are
//! answers and never trip the breaker.
//!
//! ```text
//!            success
//!      ┌──────────────────┐
//!      ▼                  │
//! ┌──────────┐       ┌──────────┐        ┌──────────┐
//! │  CLOSED  │ ────► │   OPEN   │ ─────► │HALF-OPEN │
//! │ (normal) │ fails │ (502 now)│ timeout│  (trial) │
//! └──────────┘       └──────────┘        └──────────┘
//!      ▲                                      │
//!      └──────────────────────────────────────┘
//!                 success_threshold trials
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::config::CircuitBreakerConfig;
use crate::domain::types::ProjectId;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Requests fail fast
    Open,
    /// Probing whether the upstream recovered
    HalfOpen,
}

struct ProjectCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_failures: u64,
}

impl ProjectCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            total_failures: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
    }
}

/// Statistics for one project's circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub project_id: ProjectId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

/// Circuit breakers for all project upstreams
pub struct CircuitBreakerManager {
    circuits: DashMap<ProjectId, Mutex<ProjectCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
        }
    }

    /// Whether a request to this project's upstream may proceed.
    pub fn should_allow(&self, project_id: &ProjectId) -> bool {
        if !self.config.enabled {
            return true;
        }
        let Some(circuit) = self.circuits.get(project_id) else {
            return true;
        };
        let mut circuit = circuit.lock();

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match circuit.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.config.open_timeout => {
                    info!(project_id = %project_id, "Upstream circuit half-open, probing");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                    true
                }
                Some(_) => {
                    debug!(project_id = %project_id, "Upstream circuit open, failing fast");
                    false
                }
                None => true,
            },
        }
    }

    pub fn record_success(&self, project_id: &ProjectId) {
        if !self.config.enabled {
            return;
        }
        let Some(circuit) = self.circuits.get(project_id) else {
            return;
        };
        let mut circuit = circuit.lock();

        match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.success_threshold {
                    info!(project_id = %project_id, "Upstream circuit closed after successful trial requests");
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, project_id: &ProjectId) {
        if !self.config.enabled {
            return;
        }
        let circuit = self
            .circuits
            .entry(project_id.clone())
            .or_insert_with(|| Mutex::new(ProjectCircuit::new()));
        let mut circuit = circuit.lock();
        circuit.total_failures += 1;

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        project_id = %project_id,
                        failures = circuit.consecutive_failures,
                        open_secs = self.config.open_timeout.as_secs(),
                        "Upstream circuit opening"
                    );
                    circuit.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!(project_id = %project_id, "Upstream circuit reopening after failed trial request");
                circuit.open();
            }
            CircuitState::Open => circuit.opened_at = Some(Instant::now()),
        }
    }

    pub fn get_state(&self, project_id: &ProjectId) -> CircuitState {
        self.circuits
            .get(project_id)
            .map_or(CircuitState::Closed, |c| c.lock().state)
    }

    pub fn get_stats(&self) -> Vec<CircuitStats> {
        self.circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value().lock();
                CircuitStats {
                    project_id: entry.key().clone(),
                    state: circuit.state,
                    consecutive_failures: circuit.consecutive_failures,
                    total_failures: circuit.total_failures,
                }
            })
            .collect()
    }

    pub fn reset(&self, project_id: &ProjectId) {
        if self.circuits.remove(project_id).is_some() {
            info!(project_id = %project_id, "Upstream circuit manually reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(100),
        }
    }

    fn pid() -> ProjectId {
        ProjectId::new("p1")
    }

    fn trip(manager: &CircuitBreakerManager) {
        for _ in 0..3 {
            manager.should_allow(&pid());
            manager.record_failure(&pid());
        }
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let manager = CircuitBreakerManager::new(test_config());
        assert_eq!(manager.get_state(&pid()), CircuitState::Closed);

        manager.record_failure(&pid());
        manager.record_failure(&pid());
        manager.record_success(&pid());
        manager.record_failure(&pid());
        assert_eq!(manager.get_state(&pid()), CircuitState::Closed);

        trip(&manager);
        assert_eq!(manager.get_state(&pid()), CircuitState::Open);
        assert!(!manager.should_allow(&pid()));
        // other projects unaffected
        assert!(manager.should_allow(&ProjectId::new("p2")));
    }

    #[test]
    fn test_half_open_then_closed() {
        let manager = CircuitBreakerManager::new(test_config());
        trip(&manager);
        std::thread::sleep(Duration::from_millis(150));

        assert!(manager.should_allow(&pid()));
        assert_eq!(manager.get_state(&pid()), CircuitState::HalfOpen);
        manager.record_success(&pid());
        assert_eq!(manager.get_state(&pid()), CircuitState::HalfOpen);
        manager.record_success(&pid());
        assert_eq!(manager.get_state(&pid()), CircuitState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let manager = CircuitBreakerManager::new(test_config());
        trip(&manager);
        std::thread::sleep(Duration::from_millis(150));
        manager.should_allow(&pid());
        manager.record_failure(&pid());
        assert_eq!(manager.get_state(&pid()), CircuitState::Open);
        assert!(!manager.should_allow(&pid()));
    }

    #[test]
    fn test_disabled_and_reset() {
        let mut config = test_config();
        config.enabled = false;
        let manager = CircuitBreakerManager::new(config);
        trip(&manager);
        assert!(manager.should_allow(&pid()));

        let manager = CircuitBreakerManager::new(test_config());
        trip(&manager);
        manager.reset(&pid());
        assert_eq!(manager.get_state(&pid()), CircuitState::Closed);
        assert!(manager.get_stats().is_empty());
    }
}
