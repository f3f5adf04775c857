//! Connection state model.

use crate::resilience::CircuitState;
use serde::Serialize;
use std::fmt;

/// Connection state of one dependency, or of the service overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    /// No connection settings were provided.
    NotConfigured,
    /// Not connected (initial and post-shutdown state).
    #[default]
    Disconnected,
    /// Initial connection in progress.
    Connecting,
    /// Connected and serving.
    Connected,
    /// Probes succeed again but the breaker has not yet closed.
    Reconnecting,
    /// Connection attempts or probes are failing.
    Error,
    /// The dependency's breaker is open.
    CircuitOpen,
    /// Serving with reduced capability (overall state only).
    Degraded,
}

impl DependencyState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::CircuitOpen => "circuit_open",
            Self::Degraded => "degraded",
        }
    }

    /// Returns true for states that mean the dependency is failing.
    #[must_use]
    pub const fn is_failing(&self) -> bool {
        matches!(self, Self::Error | Self::CircuitOpen)
    }
}

impl fmt::Display for DependencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Part of the connection state that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// The relational store.
    Relational,
    /// The cache store.
    Cache,
    /// The derived overall state.
    Overall,
}

impl Component {
    /// Returns the component as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Cache => "cache",
            Self::Overall => "overall",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of both dependencies plus the derived overall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    /// Relational store state.
    pub relational: DependencyState,
    /// Cache store state.
    pub cache: DependencyState,
    /// Derived overall state.
    pub overall: DependencyState,
}

impl ConnectionState {
    /// Returns the state of one component.
    #[must_use]
    pub const fn get(&self, component: Component) -> DependencyState {
        match component {
            Component::Relational => self.relational,
            Component::Cache => self.cache,
            Component::Overall => self.overall,
        }
    }

    /// Derives the overall state from the dependency states and breakers.
    ///
    /// The critical dependency is the relational store when configured,
    /// otherwise the cache store. Overall is:
    /// - `Connected` if the critical dependency is connected behind a closed breaker
    /// - `Degraded` if any breaker is open or any dependency is failing
    /// - `Disconnected` otherwise
    #[must_use]
    pub fn derive_overall(
        &self,
        relational_breaker: CircuitState,
        cache_breaker: CircuitState,
    ) -> DependencyState {
        let (critical, critical_breaker) = if self.relational == DependencyState::NotConfigured {
            (self.cache, cache_breaker)
        } else {
            (self.relational, relational_breaker)
        };

        if critical == DependencyState::Connected && critical_breaker == CircuitState::Closed {
            return DependencyState::Connected;
        }

        let breaker_open =
            relational_breaker == CircuitState::Open || cache_breaker == CircuitState::Open;
        if breaker_open || self.relational.is_failing() || self.cache.is_failing() {
            DependencyState::Degraded
        } else {
            DependencyState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn state(relational: DependencyState, cache: DependencyState) -> ConnectionState {
        ConnectionState {
            relational,
            cache,
            overall: DependencyState::Disconnected,
        }
    }

    #[test_case(DependencyState::Connected, DependencyState::Connected, CircuitState::Closed, CircuitState::Closed, DependencyState::Connected ; "both healthy")]
    #[test_case(DependencyState::Connected, DependencyState::Error, CircuitState::Closed, CircuitState::Closed, DependencyState::Connected ; "cache outage is invisible")]
    #[test_case(DependencyState::CircuitOpen, DependencyState::Connected, CircuitState::Open, CircuitState::Closed, DependencyState::Degraded ; "database breaker open")]
    #[test_case(DependencyState::Error, DependencyState::Connected, CircuitState::Closed, CircuitState::Closed, DependencyState::Degraded ; "database error")]
    #[test_case(DependencyState::NotConfigured, DependencyState::Connected, CircuitState::Closed, CircuitState::Closed, DependencyState::Connected ; "cache only")]
    #[test_case(DependencyState::NotConfigured, DependencyState::NotConfigured, CircuitState::Closed, CircuitState::Closed, DependencyState::Disconnected ; "nothing configured")]
    #[test_case(DependencyState::Disconnected, DependencyState::Disconnected, CircuitState::Closed, CircuitState::Closed, DependencyState::Disconnected ; "after shutdown")]
    #[test_case(DependencyState::Connected, DependencyState::CircuitOpen, CircuitState::HalfOpen, CircuitState::Open, DependencyState::Degraded ; "database on trial")]
    fn test_derive_overall(
        relational: DependencyState,
        cache: DependencyState,
        relational_breaker: CircuitState,
        cache_breaker: CircuitState,
        expected: DependencyState,
    ) {
        assert_eq!(
            state(relational, cache).derive_overall(relational_breaker, cache_breaker),
            expected
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&DependencyState::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(DependencyState::NotConfigured.to_string(), "not_configured");
    }
}
