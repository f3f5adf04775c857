//! Health monitor behavior under a paused tokio clock.
//!
//! - Hysteresis: unhealthy only after `threshold` consecutive failures
//! - Recovery on the first success
//! - No overlapping probes for the same check
//! - A panicking probe is isolated and counted as a failure

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use lokal_resilience::config::HealthMonitorConfig;
use lokal_resilience::resilience::{HealthMonitor, HealthStatus};
use lokal_resilience::{ConnectionEvent, Error, EventBus, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> HealthMonitorConfig {
    HealthMonitorConfig::default()
        .with_interval_ms(1000)
        .with_check_timeout_ms(500)
        .with_failure_threshold(3)
}

fn probe(healthy: Arc<AtomicBool>) -> impl Fn() -> std::future::Ready<Result<()>> + Send + Sync {
    move || {
        let result = if healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DependencyUnavailable {
                dependency: "postgresql".to_string(),
                reason: "connection refused".to_string(),
            })
        };
        std::future::ready(result)
    }
}

#[tokio::test(start_paused = true)]
async fn test_hysteresis_requires_consecutive_failures() {
    let bus = EventBus::new(32);
    let mut events = bus.subscribe();
    let monitor = HealthMonitor::with_event_bus(config(), bus);
    let healthy = Arc::new(AtomicBool::new(true));
    monitor
        .add_health_check("postgresql", probe(Arc::clone(&healthy)), 3)
        .unwrap();

    assert_eq!(
        monitor.perform_health_check("postgresql").await.unwrap(),
        HealthStatus::Healthy
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        ConnectionEvent::HealthRecovered { .. }
    ));

    healthy.store(false, Ordering::SeqCst);
    for expected_failures in 1..=2 {
        let status = monitor.perform_health_check("postgresql").await.unwrap();
        assert_eq!(status, HealthStatus::Healthy);
        let snapshots = monitor.get_health_status();
        assert_eq!(snapshots["postgresql"].consecutive_failures, expected_failures);
    }
    assert!(events.try_recv().is_err());

    let status = monitor.perform_health_check("postgresql").await.unwrap();
    assert_eq!(status, HealthStatus::Unhealthy);
    match events.try_recv().unwrap() {
        ConnectionEvent::HealthDegraded {
            check,
            consecutive_failures,
            ..
        } => {
            assert_eq!(check, "postgresql");
            assert_eq!(consecutive_failures, 3);
        },
        other => panic!("unexpected event {other:?}"),
    }

    // Further failures do not re-announce.
    monitor.perform_health_check("postgresql").await.unwrap();
    assert!(events.try_recv().is_err());

    healthy.store(true, Ordering::SeqCst);
    assert_eq!(
        monitor.perform_health_check("postgresql").await.unwrap(),
        HealthStatus::Healthy
    );
    assert!(matches!(
        events.try_recv().unwrap(),
        ConnectionEvent::HealthRecovered { .. }
    ));
    assert_eq!(monitor.get_health_status()["postgresql"].consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_isolated_failure_does_not_flip_status() {
    let monitor = HealthMonitor::new(config());
    let healthy = Arc::new(AtomicBool::new(true));
    monitor
        .add_health_check("redis", probe(Arc::clone(&healthy)), 3)
        .unwrap();

    monitor.perform_health_check("redis").await.unwrap();
    healthy.store(false, Ordering::SeqCst);
    monitor.perform_health_check("redis").await.unwrap();
    monitor.perform_health_check("redis").await.unwrap();
    healthy.store(true, Ordering::SeqCst);
    monitor.perform_health_check("redis").await.unwrap();
    healthy.store(false, Ordering::SeqCst);
    monitor.perform_health_check("redis").await.unwrap();
    monitor.perform_health_check("redis").await.unwrap();

    assert_eq!(monitor.status("redis"), Some(HealthStatus::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_is_not_overlapped() {
    let monitor = HealthMonitor::new(config().with_check_timeout_ms(10_000));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    {
        let (running, peak, started) =
            (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&started));
        monitor
            .add_health_check(
                "postgresql",
                move || {
                    let (running, peak, started) =
                        (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&started));
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        // Slower than three monitor intervals.
                        tokio::time::sleep(Duration::from_millis(3500)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                3,
            )
            .unwrap();
    }

    monitor.start_monitoring();
    tokio::time::sleep(Duration::from_millis(3000)).await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.status("postgresql"), Some(HealthStatus::Healthy));
    monitor.stop_monitoring();
}

async fn exploding_probe() -> Result<()> {
    panic!("probe exploded")
}

#[tokio::test(start_paused = true)]
async fn test_panicking_probe_is_isolated() {
    let monitor = HealthMonitor::new(config().with_failure_threshold(1));
    let healthy = Arc::new(AtomicBool::new(true));
    monitor
        .add_health_check("postgresql", exploding_probe, 1)
        .unwrap();
    monitor
        .add_health_check("redis", probe(Arc::clone(&healthy)), 1)
        .unwrap();

    let statuses = monitor.perform_all_health_checks().await;
    assert_eq!(statuses["postgresql"], HealthStatus::Unhealthy);
    assert_eq!(statuses["redis"], HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_probes_follow_interval() {
    let monitor = HealthMonitor::new(config());
    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = Arc::clone(&count);
        monitor
            .add_health_check(
                "redis",
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    std::future::ready(Ok(()))
                },
                3,
            )
            .unwrap();
    }

    monitor.start_monitoring();
    assert!(monitor.is_monitoring());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    // Ticks at 0, 1000, 2000, and 3000 ms.
    assert_eq!(count.load(Ordering::SeqCst), 4);

    monitor.stop_monitoring();
    assert!(!monitor.is_monitoring());
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(count.load(Ordering::SeqCst), 4);
}
