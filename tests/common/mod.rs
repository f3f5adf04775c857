//! Shared in-process store doubles for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use lokal_resilience::storage::{CacheStore, PoolStats, RelationalStore, Row};
use lokal_resilience::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn failure(dependency: &str) -> Error {
    Error::DependencyUnavailable {
        dependency: dependency.to_string(),
        reason: "connection refused".to_string(),
    }
}

/// Relational store double with a failure switch and an active-call gauge.
#[derive(Default)]
pub struct MockRelational {
    failing: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
    pings: AtomicUsize,
    active: AtomicI64,
    peak_active: AtomicI64,
    closed: AtomicBool,
}

impl MockRelational {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every query by `delay` (tokio time).
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }

    /// Number of query or transaction calls that reached the store.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> i64 {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(failure("postgresql"))
        } else {
            Ok(rows)
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn echo_row(text: &str, params: &[Value]) -> Row {
    let mut row = Row::new();
    row.insert("query".to_string(), Value::String(text.to_string()));
    row.insert("params".to_string(), Value::Array(params.to_vec()));
    row
}

#[async_trait]
impl RelationalStore for MockRelational {
    async fn query(&self, text: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run(vec![echo_row(text, params)]).await
    }

    async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<Vec<Row>>> {
        let rows: Vec<Row> = statements
            .iter()
            .map(|(text, params)| echo_row(text, params))
            .collect();
        let rows = self.run(rows).await?;
        Ok(rows.into_iter().map(|row| vec![row]).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(failure("postgresql"))
        } else {
            Ok(())
        }
    }

    fn pool_stats(&self) -> PoolStats {
        let active = usize::try_from(self.active().max(0)).unwrap();
        PoolStats {
            max_size: 10,
            size: active,
            active,
            idle: 0,
            waiting: 0,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Cache store double backed by a `HashMap`, ignoring TTLs.
#[derive(Default)]
pub struct MockCache {
    entries: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(failure("redis"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for MockCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
