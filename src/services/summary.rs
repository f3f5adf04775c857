//! Serializable connection summary for health endpoints.

use crate::models::{ConnectionState, DependencyState};
use crate::resilience::{CircuitBreakerStats, HealthCheckSnapshot, HealthStatus};
use crate::storage::{FallbackCacheStats, PoolStats};
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything a `/health` handler needs in one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    /// Whether `initialize` has completed and `shutdown` has not run since.
    pub initialized: bool,
    /// Per-dependency and overall connection state.
    pub state: ConnectionState,
    /// Health check snapshots by check name.
    pub health: BTreeMap<String, HealthCheckSnapshot>,
    /// Breaker stats by breaker name.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStats>,
    /// Relational pool gauges, when a relational store is present.
    pub pool: Option<PoolStats>,
    /// In-process fallback cache counters.
    pub fallback_cache: FallbackCacheStats,
}

impl ConnectionSummary {
    /// Returns true when the service can answer requests, possibly degraded.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(
            self.state.overall,
            DependencyState::Connected | DependencyState::Degraded
        )
    }

    /// Returns the names of checks currently reported unhealthy.
    #[must_use]
    pub fn unhealthy_checks(&self) -> Vec<&str> {
        self.health
            .iter()
            .filter(|(_, snapshot)| snapshot.status == HealthStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
