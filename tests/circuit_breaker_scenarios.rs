//! Circuit breaker scenarios driven by a paused tokio clock.
//!
//! Covers the full closed, open, half-open cycle and the single-trial
//! guarantee under concurrent callers.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use lokal_resilience::config::CircuitBreakerConfig;
use lokal_resilience::resilience::{CircuitBreaker, CircuitState};
use lokal_resilience::{ConnectionEvent, Error, EventBus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        "postgresql",
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout_ms(reset_ms),
    )
}

fn refused() -> Error {
    Error::DependencyUnavailable {
        dependency: "postgresql".to_string(),
        reason: "connection refused".to_string(),
    }
}

async fn fail(breaker: &CircuitBreaker) -> Error {
    breaker
        .execute(|| async { Err::<(), _>(refused()) })
        .await
        .unwrap_err()
}

// ============================================================================
// Open / half-open / closed cycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_cycle_with_reset_timeout() {
    let breaker = breaker(3, 1000);
    let counter = AtomicUsize::new(0);
    let invoked = &counter;

    for _ in 0..3 {
        let err = fail(&breaker).await;
        assert!(matches!(err, Error::DependencyUnavailable { .. }));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Still inside the reset window: rejected without invoking the operation.
    tokio::time::advance(Duration::from_millis(500)).await;
    let err = breaker
        .execute(|| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    match err {
        Error::CircuitOpen {
            dependency,
            retry_after_ms,
        } => {
            assert_eq!(dependency, "postgresql");
            assert_eq!(retry_after_ms, 500);
        },
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // Past the window: one trial is admitted and closes the breaker.
    tokio::time::advance(Duration::from_millis(501)).await;
    breaker
        .execute(|| async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = breaker.stats();
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.failed_requests, 3);
    assert_eq!(stats.rejected_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.next_attempt_in_ms, None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_restarts_reset_window() {
    let breaker = breaker(2, 1000);
    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1000)).await;
    let err = fail(&breaker).await;
    assert!(matches!(err, Error::DependencyUnavailable { .. }));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.stats().next_attempt_in_ms, Some(1000));

    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(breaker.execute(|| async { Ok(()) }).await.unwrap_err().is_circuit_open());
}

#[tokio::test(start_paused = true)]
async fn test_success_below_threshold_resets_count() {
    let breaker = breaker(3, 1000);
    fail(&breaker).await;
    fail(&breaker).await;
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 2);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_only_one_trial_runs_concurrently() {
    let breaker = Arc::new(breaker(1, 1000));
    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(1000)).await;

    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let trial = {
        let breaker = Arc::clone(&breaker);
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                })
                .await
        })
    };
    started.notified().await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let invoked = Arc::new(AtomicUsize::new(0));
    let mut others = Vec::new();
    for _ in 0..8 {
        let breaker = Arc::clone(&breaker);
        let invoked = Arc::clone(&invoked);
        others.push(tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for handle in others {
        assert!(handle.await.unwrap().unwrap_err().is_circuit_open());
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    release.notify_one();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().rejected_requests, 8);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_trial_reopens() {
    let breaker = Arc::new(breaker(1, 1000));
    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(1000)).await;

    let started = Arc::new(Notify::new());
    let trial = {
        let breaker = Arc::clone(&breaker);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    started.notify_one();
                    std::future::pending::<()>().await;
                    Ok(())
                })
                .await
        })
    };
    started.notified().await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    trial.abort();
    assert!(trial.await.unwrap_err().is_cancelled());
    assert_eq!(breaker.state(), CircuitState::Open);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_trip_and_reset_publish_events() {
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let breaker = breaker(2, 1000).with_event_bus(bus);

    fail(&breaker).await;
    fail(&breaker).await;
    match events.recv().await.unwrap() {
        ConnectionEvent::CircuitOpened {
            breaker: name,
            failure_count,
            retry_after_ms,
            ..
        } => {
            assert_eq!(name, "postgresql");
            assert_eq!(failure_count, 2);
            assert_eq!(retry_after_ms, 1000);
        },
        other => panic!("unexpected event {other:?}"),
    }

    tokio::time::advance(Duration::from_millis(1000)).await;
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::CircuitReset { .. }
    ));
    assert!(events.try_recv().is_err());
}
