//! Periodic health checks with consecutive-failure hysteresis.
//!
//! A dependency becomes `Unhealthy` only after `threshold` consecutive failed
//! probes, and returns to `Healthy` on the first success.

use crate::config::HealthMonitorConfig;
use crate::models::{ConnectionEvent, EventMeta};
use crate::observability::EventBus;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const EVENT_SOURCE: &str = "health_monitor";

type ProbeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ProbeFn = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

/// Derived health of one registered check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No probe has completed yet, or failures are still below the threshold.
    #[default]
    Unknown,
    /// The last probe succeeded.
    Healthy,
    /// Consecutive failures reached the threshold.
    Unhealthy,
}

impl HealthStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Read-only view of one health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckSnapshot {
    /// Current derived status.
    pub status: HealthStatus,
    /// Failed probes since the last success.
    pub consecutive_failures: u32,
    /// Failures needed to flip to unhealthy.
    pub threshold: u32,
    /// When the last probe finished.
    pub last_check_at: Option<DateTime<Utc>>,
    /// When the last probe succeeded.
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the last probe failed.
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct HealthCheckEntry {
    check: ProbeFn,
    threshold: u32,
    consecutive_failures: u32,
    last_check_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

struct MonitorInner {
    config: HealthMonitorConfig,
    entries: Mutex<HashMap<String, HealthCheckEntry>>,
    statuses: Mutex<HashMap<String, HealthStatus>>,
    event_bus: Option<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

/// Runs registered probes on a timer and tracks their health.
///
/// Cloning is cheap; clones share the same checks and background task.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    /// Creates a monitor with no checks registered.
    #[must_use]
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a monitor that publishes health events to `bus`.
    #[must_use]
    pub fn with_event_bus(config: HealthMonitorConfig, bus: EventBus) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: HealthMonitorConfig, event_bus: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                entries: Mutex::new(HashMap::new()),
                statuses: Mutex::new(HashMap::new()),
                event_bus,
                task: Mutex::new(None),
            }),
        }
    }

    /// Registers a named probe.
    ///
    /// A `threshold` of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `name` is already registered.
    pub fn add_health_check<F, Fut>(
        &self,
        name: impl Into<String>,
        check: F,
        threshold: u32,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut entries = lock(&self.inner.entries);
        if entries.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "health check '{name}' is already registered"
            )));
        }

        let check: ProbeFn = Arc::new(move || -> ProbeFuture { Box::pin(check()) });
        entries.insert(
            name.clone(),
            HealthCheckEntry {
                check,
                threshold: threshold.max(1),
                consecutive_failures: 0,
                last_check_at: None,
                last_success_at: None,
                last_failure_at: None,
                in_flight: false,
            },
        );
        drop(entries);

        lock(&self.inner.statuses).insert(name.clone(), HealthStatus::Unknown);
        tracing::debug!(check = %name, threshold = threshold.max(1), "Registered health check");
        Ok(())
    }

    /// Returns the registered check names, sorted.
    #[must_use]
    pub fn check_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.entries).keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the current status of one check.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        lock(&self.inner.statuses).get(name).copied()
    }

    /// Runs one probe now and records the outcome.
    ///
    /// If a probe for `name` is already running, nothing is run and the
    /// current status is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `name` is not registered. Probe
    /// failures are recorded, not returned.
    pub async fn perform_health_check(&self, name: &str) -> Result<HealthStatus> {
        let check = {
            let mut entries = lock(&self.inner.entries);
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown health check '{name}'")))?;
            if entry.in_flight {
                drop(entries);
                tracing::debug!(check = name, "Health check still in flight, skipping");
                metrics::counter!("health_check_total", "check" => name.to_string(), "status" => "skipped")
                    .increment(1);
                return Ok(self.status(name).unwrap_or_default());
            }
            entry.in_flight = true;
            Arc::clone(&entry.check)
        };

        let _in_flight = InFlightGuard {
            inner: &self.inner,
            name,
        };

        let start = Instant::now();
        let outcome = self.run_probe(name, &check).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("health_check_duration_ms", "check" => name.to_string())
            .record(elapsed_ms);

        Ok(self.record(name, outcome))
    }

    /// Runs every registered probe concurrently and returns the resulting statuses.
    pub async fn perform_all_health_checks(&self) -> BTreeMap<String, HealthStatus> {
        let handles: Vec<(String, JoinHandle<Result<HealthStatus>>)> = self
            .check_names()
            .into_iter()
            .map(|name| {
                let monitor = self.clone();
                let task_name = name.clone();
                let handle =
                    tokio::spawn(async move { monitor.perform_health_check(&task_name).await });
                (name, handle)
            })
            .collect();

        let mut statuses = BTreeMap::new();
        for (name, handle) in handles {
            if let Ok(Ok(status)) = handle.await {
                statuses.insert(name, status);
            }
        }
        statuses
    }

    /// Returns a snapshot of every registered check.
    #[must_use]
    pub fn get_health_status(&self) -> BTreeMap<String, HealthCheckSnapshot> {
        let entries = lock(&self.inner.entries);
        let statuses = lock(&self.inner.statuses);
        entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    HealthCheckSnapshot {
                        status: statuses.get(name).copied().unwrap_or_default(),
                        consecutive_failures: entry.consecutive_failures,
                        threshold: entry.threshold,
                        last_check_at: entry.last_check_at,
                        last_success_at: entry.last_success_at,
                        last_failure_at: entry.last_failure_at,
                    },
                )
            })
            .collect()
    }

    /// Starts the periodic probe task. Calling it again while running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Health monitoring already running");
            return;
        }

        let interval = self.inner.config.interval();
        let weak = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(monitor_loop(weak, interval)));
        drop(task);

        tracing::info!(
            interval_ms = self.inner.config.interval_ms,
            checks = self.check_names().len(),
            "Health monitoring started"
        );
    }

    /// Stops the periodic probe task. Probes already running finish on their own.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
            tracing::info!("Health monitoring stopped");
        }
    }

    /// Returns true while the periodic probe task is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run_probe(&self, name: &str, check: &ProbeFn) -> std::result::Result<(), String> {
        let timeout = self.inner.config.check_timeout();
        // Probes run on their own task so a panic is contained.
        let mut handle = tokio::spawn(check());
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(format!("health check '{name}' panicked"))
            },
            Ok(Err(join_err)) => Err(join_err.to_string()),
            Err(_) => {
                handle.abort();
                Err(Error::Timeout {
                    operation: format!("health_check_{name}"),
                    timeout_ms: self.inner.config.check_timeout_ms,
                }
                .to_string())
            },
        }
    }

    fn record(&self, name: &str, outcome: std::result::Result<(), String>) -> HealthStatus {
        let now = Utc::now();
        let mut entries = lock(&self.inner.entries);
        let Some(entry) = entries.get_mut(name) else {
            return HealthStatus::Unknown;
        };
        let mut statuses = lock(&self.inner.statuses);
        let previous = statuses.get(name).copied().unwrap_or_default();
        entry.last_check_at = Some(now);

        let (current, event) = match &outcome {
            Ok(()) => {
                entry.consecutive_failures = 0;
                entry.last_success_at = Some(now);
                if previous == HealthStatus::Healthy {
                    (previous, None)
                } else {
                    let event = ConnectionEvent::HealthRecovered {
                        meta: EventMeta::new(EVENT_SOURCE),
                        check: name.to_string(),
                    };
                    (HealthStatus::Healthy, Some(event))
                }
            },
            Err(error) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_failure_at = Some(now);
                if entry.consecutive_failures >= entry.threshold
                    && previous != HealthStatus::Unhealthy
                {
                    let event = ConnectionEvent::HealthDegraded {
                        meta: EventMeta::new(EVENT_SOURCE),
                        check: name.to_string(),
                        consecutive_failures: entry.consecutive_failures,
                        error: error.clone(),
                    };
                    (HealthStatus::Unhealthy, Some(event))
                } else {
                    (previous, None)
                }
            },
        };
        let consecutive_failures = entry.consecutive_failures;
        statuses.insert(name.to_string(), current);
        drop(statuses);
        drop(entries);

        let status_label = if outcome.is_ok() { "success" } else { "failure" };
        metrics::counter!("health_check_total", "check" => name.to_string(), "status" => status_label)
            .increment(1);

        match (&outcome, current != previous) {
            (Ok(()), true) => {
                tracing::info!(check = name, previous = previous.as_str(), "Health check recovered");
            },
            (Err(error), true) => tracing::warn!(
                check = name,
                consecutive_failures,
                error = %error,
                "Health check marked unhealthy"
            ),
            (Err(error), false) => tracing::debug!(
                check = name,
                consecutive_failures,
                error = %error,
                "Health check failed"
            ),
            (Ok(()), false) => {},
        }

        if let (Some(event), Some(bus)) = (event, &self.inner.event_bus) {
            bus.publish(event);
        }
        current
    }
}

async fn monitor_loop(inner: Weak<MonitorInner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let monitor = HealthMonitor { inner };
        for name in monitor.check_names() {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                if let Err(err) = monitor.perform_health_check(&name).await {
                    tracing::debug!(check = %name, error = %err, "Health check vanished");
                }
            });
        }
    }
}

/// Clears the in-flight flag even if the probing future is dropped.
struct InFlightGuard<'a> {
    inner: &'a MonitorInner,
    name: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = lock(&self.inner.entries).get_mut(self.name) {
            entry.in_flight = false;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> HealthMonitorConfig {
        HealthMonitorConfig::default()
            .with_interval_ms(1_000)
            .with_check_timeout_ms(100)
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let monitor = HealthMonitor::new(config());
        monitor.add_health_check("db", || async { Ok(()) }, 3).unwrap();
        let err = monitor
            .add_health_check("db", || async { Ok(()) }, 3)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_name_is_invalid_input() {
        let monitor = HealthMonitor::new(config());
        let err = monitor.perform_health_check("missing").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_first_success_reports_healthy() {
        let monitor = HealthMonitor::new(config());
        monitor.add_health_check("db", || async { Ok(()) }, 3).unwrap();
        assert_eq!(monitor.status("db"), Some(HealthStatus::Unknown));

        let status = monitor.perform_health_check("db").await.unwrap();
        assert_eq!(status, HealthStatus::Healthy);
        let snapshot = &monitor.get_health_status()["db"];
        assert!(snapshot.last_success_at.is_some());
        assert!(snapshot.last_check_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let monitor = HealthMonitor::new(config());
        monitor
            .add_health_check("slow", || std::future::pending::<Result<()>>(), 1)
            .unwrap();

        let status = monitor.perform_health_check("slow").await.unwrap();
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(monitor.get_health_status()["slow"].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_failure_then_success_resets_counter() {
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(config());
        let flag = Arc::clone(&healthy);
        monitor
            .add_health_check(
                "cache",
                move || {
                    let ok = flag.load(Ordering::SeqCst);
                    async move {
                        if ok {
                            Ok(())
                        } else {
                            Err(Error::OperationFailed {
                                operation: "ping".to_string(),
                                cause: "refused".to_string(),
                            })
                        }
                    }
                },
                2,
            )
            .unwrap();

        monitor.perform_health_check("cache").await.unwrap();
        assert_eq!(monitor.get_health_status()["cache"].consecutive_failures, 1);
        assert_eq!(monitor.status("cache"), Some(HealthStatus::Unknown));

        healthy.store(true, Ordering::SeqCst);
        monitor.perform_health_check("cache").await.unwrap();
        assert_eq!(monitor.get_health_status()["cache"].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_monitoring_is_idempotent() {
        let calls = Arc::new(AtomicU32::new(0));
        let monitor = HealthMonitor::new(config());
        let counter = Arc::clone(&calls);
        monitor
            .add_health_check(
                "db",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                3,
            )
            .unwrap();

        monitor.start_monitoring();
        monitor.start_monitoring();
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // Ticks at 0s, 1s, 2s from a single task.
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
