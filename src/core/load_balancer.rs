//! Backend selection among equivalent candidates
//!
//! Optional collaborator of the router, disabled by default. Candidates are
//! first filtered through their circuit breakers, then one is picked by the
//! configured strategy.

use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStatus};
use crate::core::models::RegisteredServer;
use crate::utils::errors::{McpError, McpResult};
use dashmap::DashMap;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

pub const MIN_WEIGHT: u32 = 1;
pub const MAX_WEIGHT: u32 = 100;
const DEFAULT_WEIGHT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Per-group counter modulo the candidate count
    #[default]
    RoundRobin,
    /// Cumulative-weight draw
    Weighted,
    /// Fewest in-flight calls
    LeastConnections,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub enabled: bool,
    pub strategy: LoadBalancingStrategy,
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Decrements the in-flight count of a backend when dropped
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    counters: DashMap<String, AtomicUsize>,
    weights: DashMap<String, HashMap<String, u32>>,
    connections: DashMap<String, Arc<AtomicUsize>>,
    breakers: CircuitBreakerManager,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalancerConfig) -> Self {
        Self {
            strategy: config.strategy,
            counters: DashMap::new(),
            weights: DashMap::new(),
            connections: DashMap::new(),
            breakers: CircuitBreakerManager::new(config.circuit_breaker.clone()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Pick one of `candidates` for a call within `group_key`.
    ///
    /// Candidates whose circuit is open are skipped. Fails with
    /// `NoServerAvailable` for an empty set and `CircuitOpen` when every
    /// candidate is excluded by its breaker.
    pub fn select(&self, group_key: &str, candidates: &[RegisteredServer]) -> McpResult<RegisteredServer> {
        if candidates.is_empty() {
            return Err(McpError::NoServerAvailable(format!(
                "no candidates in '{}'",
                group_key
            )));
        }

        let available: Vec<&RegisteredServer> = candidates
            .iter()
            .filter(|s| {
                self.breakers
                    .existing(&s.id)
                    .map(|b| b.is_available())
                    .unwrap_or(true)
            })
            .collect();

        if available.is_empty() {
            let ids: Vec<&str> = candidates.iter().map(|s| s.id.as_str()).collect();
            return Err(McpError::CircuitOpen(ids.join(",")));
        }

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let counter = self
                    .counters
                    .entry(group_key.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                counter.fetch_add(1, Ordering::SeqCst) % available.len()
            }
            LoadBalancingStrategy::Weighted => {
                let weights: Vec<u32> = available
                    .iter()
                    .map(|s| self.weight(group_key, &s.id))
                    .collect();
                let total: u32 = weights.iter().sum();
                let draw = rand::thread_rng().gen_range(0..total);
                pick_weighted(&weights, draw)
            }
            LoadBalancingStrategy::LeastConnections => available
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| self.connections(&s.id))
                .map(|(i, _)| i)
                .unwrap_or(0),
            LoadBalancingStrategy::Random => rand::thread_rng().gen_range(0..available.len()),
        };

        let chosen = available[index];
        if let Some(breaker) = self.breakers.existing(&chosen.id) {
            breaker.on_dispatch();
        }
        debug!(
            "Load balancer ({:?}) picked '{}' in '{}'",
            self.strategy, chosen.id, group_key
        );
        Ok(chosen.clone())
    }

    /// Count a call as in flight until the guard is dropped
    pub fn track(&self, backend_id: &str) -> ConnectionGuard {
        let counter = self
            .connections
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard { counter }
    }

    pub fn connections(&self, backend_id: &str) -> usize {
        self.connections
            .get(backend_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Undo the trial bookkeeping of a `select` whose pick was not dispatched
    pub fn release(&self, backend_id: &str) {
        if let Some(breaker) = self.breakers.existing(backend_id) {
            breaker.release();
        }
    }

    pub fn record_success(&self, backend_id: &str) {
        self.breakers.breaker(backend_id).record_success();
    }

    pub fn record_failure(&self, backend_id: &str) {
        self.breakers.breaker(backend_id).record_failure();
    }

    pub fn set_weight(&self, group_key: &str, backend_id: &str, weight: u32) -> McpResult<()> {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
            return Err(McpError::Configuration(format!(
                "weight for '{}' must be between {} and {}, got {}",
                backend_id, MIN_WEIGHT, MAX_WEIGHT, weight
            )));
        }
        self.weights
            .entry(group_key.to_string())
            .or_default()
            .insert(backend_id.to_string(), weight);
        Ok(())
    }

    pub fn weight(&self, group_key: &str, backend_id: &str) -> u32 {
        self.weights
            .get(group_key)
            .and_then(|w| w.get(backend_id).copied())
            .unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn breaker_status(&self, backend_id: &str) -> Option<CircuitBreakerStatus> {
        self.breakers.existing(backend_id).map(|b| b.status())
    }

    pub fn all_breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        self.breakers.all_statuses()
    }

    pub fn reset_breaker(&self, backend_id: &str) {
        self.breakers.reset(backend_id);
    }
}

/// Index whose cumulative weight range contains `draw` (`0 <= draw < sum`).
fn pick_weighted(weights: &[u32], draw: u32) -> usize {
    let mut cumulative = 0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if draw < cumulative {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitState;
    use crate::core::models::ServerStatus;
    use serde_json::json;

    fn server(id: &str) -> RegisteredServer {
        RegisteredServer {
            id: id.into(),
            user_id: "u1".into(),
            name: id.into(),
            protocol: "http".into(),
            config: json!({"baseUrl": "http://localhost"}),
            namespace: None,
            status: ServerStatus::Active,
        }
    }

    fn balancer(strategy: LoadBalancingStrategy) -> LoadBalancer {
        LoadBalancer::new(&LoadBalancerConfig {
            enabled: true,
            strategy,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                timeout_ms: 60_000,
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_round_robin_per_group() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        let servers = vec![server("a"), server("b")];

        assert_eq!(lb.select("g1", &servers).unwrap().id, "a");
        assert_eq!(lb.select("g1", &servers).unwrap().id, "b");
        assert_eq!(lb.select("g2", &servers).unwrap().id, "a");
        assert_eq!(lb.select("g1", &servers).unwrap().id, "a");
    }

    #[test]
    fn test_least_connections() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections);
        let servers = vec![server("a"), server("b")];

        let _busy = lb.track("a");
        assert_eq!(lb.select("g", &servers).unwrap().id, "b");

        let _b1 = lb.track("b");
        let _b2 = lb.track("b");
        assert_eq!(lb.select("g", &servers).unwrap().id, "a");
    }

    #[test]
    fn test_connection_guard_decrements() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections);
        {
            let _guard = lb.track("a");
            assert_eq!(lb.connections("a"), 1);
        }
        assert_eq!(lb.connections("a"), 0);
    }

    #[test]
    fn test_pick_weighted_ranges() {
        let weights = [1, 3, 6];
        assert_eq!(pick_weighted(&weights, 0), 0);
        assert_eq!(pick_weighted(&weights, 1), 1);
        assert_eq!(pick_weighted(&weights, 3), 1);
        assert_eq!(pick_weighted(&weights, 4), 2);
        assert_eq!(pick_weighted(&weights, 9), 2);
    }

    #[test]
    fn test_weighted_only_picks_candidates() {
        let lb = balancer(LoadBalancingStrategy::Weighted);
        lb.set_weight("g", "a", 100).unwrap();
        let servers = vec![server("a"), server("b")];
        for _ in 0..20 {
            let id = lb.select("g", &servers).unwrap().id;
            assert!(id == "a" || id == "b");
        }
    }

    #[test]
    fn test_weight_bounds() {
        let lb = balancer(LoadBalancingStrategy::Weighted);
        assert!(matches!(lb.set_weight("g", "a", 0), Err(McpError::Configuration(_))));
        assert!(matches!(lb.set_weight("g", "a", 101), Err(McpError::Configuration(_))));
        lb.set_weight("g", "a", 50).unwrap();
        assert_eq!(lb.weight("g", "a"), 50);
        assert_eq!(lb.weight("g", "b"), 1);
    }

    #[test]
    fn test_open_circuit_excluded() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        lb.record_failure("a");
        lb.record_failure("a");
        assert_eq!(lb.breaker_status("a").unwrap().state, CircuitState::Open);

        let servers = vec![server("a"), server("b")];
        for _ in 0..4 {
            assert_eq!(lb.select("g", &servers).unwrap().id, "b");
        }
    }

    #[test]
    fn test_all_open_is_circuit_error() {
        let lb = balancer(LoadBalancingStrategy::Random);
        lb.record_failure("a");
        lb.record_failure("a");
        let err = lb.select("g", &[server("a")]).unwrap_err();
        assert!(matches!(err, McpError::CircuitOpen(_)));
    }

    #[test]
    fn test_empty_candidates() {
        let lb = balancer(LoadBalancingStrategy::Random);
        assert!(matches!(
            lb.select("g", &[]),
            Err(McpError::NoServerAvailable(_))
        ));
    }
}
