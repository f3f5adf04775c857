//! Connection event types for observability and alerting.

use super::{Component, DependencyState};
use crate::current_timestamp;
use uuid::Uuid;

/// Shared event metadata required for observability.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Unique identifier for this event.
    pub event_id: String,
    /// Event source component.
    pub source: &'static str,
    /// Timestamp (Unix epoch seconds).
    pub timestamp: u64,
}

impl EventMeta {
    /// Creates new event metadata using the current timestamp.
    #[must_use]
    pub fn new(source: &'static str) -> Self {
        Self::with_timestamp(source, current_timestamp())
    }

    /// Creates new event metadata with a specified timestamp.
    #[must_use]
    pub fn with_timestamp(source: &'static str, timestamp: u64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source,
            timestamp,
        }
    }
}

/// Events broadcast by breakers, the health monitor, and the connection manager.
///
/// All events are informational. Nothing on the request path depends on them
/// being delivered.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A component's connection state changed.
    ConnectionStateChanged {
        /// Event metadata.
        meta: EventMeta,
        /// Which part of the connection state changed.
        component: Component,
        /// State before the change.
        previous: DependencyState,
        /// State after the change.
        current: DependencyState,
    },
    /// A circuit breaker opened.
    CircuitOpened {
        /// Event metadata.
        meta: EventMeta,
        /// Breaker name (the guarded dependency).
        breaker: String,
        /// Consecutive failures when the breaker opened.
        failure_count: u32,
        /// The error that tripped the breaker.
        error: String,
        /// Milliseconds until a trial call is admitted.
        retry_after_ms: u64,
    },
    /// A circuit breaker closed after a successful trial.
    CircuitReset {
        /// Event metadata.
        meta: EventMeta,
        /// Breaker name (the guarded dependency).
        breaker: String,
    },
    /// A health check crossed its failure threshold.
    HealthDegraded {
        /// Event metadata.
        meta: EventMeta,
        /// Health check name.
        check: String,
        /// Consecutive failed probes.
        consecutive_failures: u32,
        /// The error from the last probe.
        error: String,
    },
    /// A health check succeeded after not being healthy.
    HealthRecovered {
        /// Event metadata.
        meta: EventMeta,
        /// Health check name.
        check: String,
    },
    /// The overall connection state became degraded.
    ServiceDegraded {
        /// Event metadata.
        meta: EventMeta,
        /// Overall state before degradation.
        previous: DependencyState,
    },
    /// The overall connection state recovered from degradation.
    ServiceRecovered {
        /// Event metadata.
        meta: EventMeta,
    },
    /// A cache operation was served by the in-process fallback.
    CacheFallback {
        /// Event metadata.
        meta: EventMeta,
        /// The cache operation (`get`, `set`, `delete`).
        operation: &'static str,
        /// Why the remote cache was bypassed.
        reason: String,
    },
}

impl ConnectionEvent {
    /// Returns the event type as a string.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::CircuitOpened { .. } => "circuit_open",
            Self::CircuitReset { .. } => "circuit_reset",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::HealthRecovered { .. } => "health_recovered",
            Self::ServiceDegraded { .. } => "service_degraded",
            Self::ServiceRecovered { .. } => "service_recovered",
            Self::CacheFallback { .. } => "cache_fallback",
        }
    }

    /// Returns the fully qualified event name.
    ///
    /// Breaker events are qualified with the breaker name, e.g.
    /// `postgresql_circuit_open` or `redis_circuit_reset`.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::CircuitOpened { breaker, .. } | Self::CircuitReset { breaker, .. } => {
                format!("{breaker}_{}", self.event_type())
            },
            _ => self.event_type().to_string(),
        }
    }

    /// Returns the timestamp of the event.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.meta().timestamp
    }

    /// Returns the event metadata.
    #[must_use]
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::ConnectionStateChanged { meta, .. }
            | Self::CircuitOpened { meta, .. }
            | Self::CircuitReset { meta, .. }
            | Self::HealthDegraded { meta, .. }
            | Self::HealthRecovered { meta, .. }
            | Self::ServiceDegraded { meta, .. }
            | Self::ServiceRecovered { meta }
            | Self::CacheFallback { meta, .. } => meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_events_are_qualified() {
        let opened = ConnectionEvent::CircuitOpened {
            meta: EventMeta::new("circuit_breaker"),
            breaker: "postgresql".to_string(),
            failure_count: 5,
            error: "connection refused".to_string(),
            retry_after_ms: 60_000,
        };
        assert_eq!(opened.event_type(), "circuit_open");
        assert_eq!(opened.name(), "postgresql_circuit_open");

        let reset = ConnectionEvent::CircuitReset {
            meta: EventMeta::new("circuit_breaker"),
            breaker: "redis".to_string(),
        };
        assert_eq!(reset.name(), "redis_circuit_reset");
    }

    #[test]
    fn test_unqualified_event_names() {
        let event = ConnectionEvent::ServiceRecovered {
            meta: EventMeta::with_timestamp("connection_manager", 42),
        };
        assert_eq!(event.name(), "service_recovered");
        assert_eq!(event.timestamp(), 42);
        assert_eq!(event.meta().source, "connection_manager");
    }
}
