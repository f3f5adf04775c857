//! Failure isolation for external dependencies.
//!
//! - [`CircuitBreaker`]: fails fast while a dependency is down
//! - [`HealthMonitor`]: probes dependencies on a timer with hysteresis

mod circuit_breaker;
mod health;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use health::{HealthCheckSnapshot, HealthMonitor, HealthStatus};
