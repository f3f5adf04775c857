//! Connection manager composing stores, breakers, and the health monitor.
//!
//! # Request Routing
//!
//! ```text
//! query ──────> relational breaker ──> RelationalStore
//!                    │ open / no store
//!                    └──> error (CircuitOpen / DependencyUnavailable)
//!
//! cache_get ──> cache breaker ──> CacheStore ──hit──> value (backfilled)
//!                    │ open / error      │ miss
//!                    v                   v
//!               FallbackCache           None
//! ```
//!
//! Relational failures propagate to the caller. Cache failures degrade to
//! the in-process [`FallbackCache`] and are reported as
//! [`ConnectionEvent::CacheFallback`], never as errors.

use crate::config::ResilienceConfig;
use crate::models::{Component, ConnectionEvent, ConnectionState, DependencyState, EventMeta};
use crate::observability::{EventBus, FilteredReceiver};
use crate::resilience::{CircuitBreaker, CircuitState, HealthMonitor};
use crate::services::ConnectionSummary;
use crate::storage::{CacheStore, FallbackCache, RelationalStore, Row};
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Breaker and health check name of the relational store.
pub const RELATIONAL_DEPENDENCY: &str = "postgresql";
/// Breaker and health check name of the cache store.
pub const CACHE_DEPENDENCY: &str = "redis";

const EVENT_SOURCE: &str = "connection_manager";
const SLOW_QUERY_PREVIEW_CHARS: usize = 120;

/// Builder for [`ConnectionManager`] with injectable collaborators.
///
/// ```rust,ignore
/// let manager = ConnectionManager::builder(config)
///     .relational_store(Arc::new(my_store))
///     .event_bus(bus.clone())
///     .build()?;
/// ```
pub struct ConnectionManagerBuilder {
    config: ResilienceConfig,
    relational: Option<Arc<dyn RelationalStore>>,
    cache: Option<Arc<dyn CacheStore>>,
    event_bus: Option<EventBus>,
}

impl ConnectionManagerBuilder {
    /// Creates a builder for `config`.
    #[must_use]
    pub const fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            relational: None,
            cache: None,
            event_bus: None,
        }
    }

    /// Uses `store` instead of building one from `config.database`.
    #[must_use]
    pub fn relational_store(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.relational = Some(store);
        self
    }

    /// Uses `store` instead of building one from `config.cache`.
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Publishes events on `bus` instead of a private bus.
    #[must_use]
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validates the configuration and builds the manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn build(self) -> Result<ConnectionManager> {
        self.config.validate()?;

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.config.event_bus_capacity));
        let relational_breaker = Arc::new(
            CircuitBreaker::new(RELATIONAL_DEPENDENCY, self.config.database_breaker)
                .with_event_bus(event_bus.clone()),
        );
        let cache_breaker = Arc::new(
            CircuitBreaker::new(CACHE_DEPENDENCY, self.config.cache_breaker)
                .with_event_bus(event_bus.clone()),
        );
        let health = HealthMonitor::with_event_bus(self.config.health, event_bus.clone());
        let fallback = FallbackCache::new(self.config.fallback_cache.capacity);

        Ok(ConnectionManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                injected_relational: self.relational,
                injected_cache: self.cache,
                relational: RwLock::new(None),
                cache: RwLock::new(None),
                relational_breaker,
                cache_breaker,
                health,
                fallback,
                event_bus,
                state: Mutex::new(ConnectionState::default()),
                initialized: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct ManagerInner {
    config: ResilienceConfig,
    injected_relational: Option<Arc<dyn RelationalStore>>,
    injected_cache: Option<Arc<dyn CacheStore>>,
    relational: RwLock<Option<Arc<dyn RelationalStore>>>,
    cache: RwLock<Option<Arc<dyn CacheStore>>>,
    relational_breaker: Arc<CircuitBreaker>,
    cache_breaker: Arc<CircuitBreaker>,
    health: HealthMonitor,
    fallback: FallbackCache,
    event_bus: EventBus,
    state: Mutex<ConnectionState>,
    initialized: AtomicBool,
    /// Serializes `initialize` and `shutdown`.
    lifecycle: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.health.stop_monitoring();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Mediates access to the relational and cache stores.
///
/// Cloning is cheap; clones share the same stores, breakers, and state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Creates a manager that builds its stores from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn new(config: ResilienceConfig) -> Result<Self> {
        ConnectionManagerBuilder::new(config).build()
    }

    /// Returns a builder for injecting stores or an event bus.
    #[must_use]
    pub const fn builder(config: ResilienceConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(config)
    }

    /// Connects to the configured stores and starts background tasks.
    ///
    /// Either store may be unconfigured or unreachable. A store that fails
    /// its first ping stays registered in `Error` state so breaker trials and
    /// health probes can recover it. Calling this again while initialized
    /// logs a warning and changes nothing.
    ///
    /// Returns true when the overall state is `Connected` or `Degraded`.
    /// Must be called from within a tokio runtime.
    pub async fn initialize(&self) -> bool {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if inner.initialized.load(Ordering::Acquire) {
            tracing::warn!("Connection manager already initialized");
            return is_available(inner.connection_state().overall);
        }

        tracing::info!(
            database = inner.config.database.is_configured() || inner.injected_relational.is_some(),
            cache = inner.config.cache.is_configured() || inner.injected_cache.is_some(),
            "Initializing connection manager"
        );

        // Subscribe before any component publishes.
        let events = inner.event_bus.subscribe_filtered(affects_state);

        inner.connect_relational().await;
        inner.connect_cache().await;
        self.register_health_checks();
        inner.health.start_monitoring();

        let weak = Arc::downgrade(inner);
        let watcher = tokio::spawn(watch_events(weak.clone(), events));
        let sweeper = tokio::spawn(sweep_fallback(
            weak,
            inner.config.fallback_cache.sweep_interval(),
        ));
        lock(&inner.tasks).extend([watcher, sweeper]);

        inner.initialized.store(true, Ordering::Release);
        let state = inner.connection_state();
        tracing::info!(
            relational = %state.relational,
            cache = %state.cache,
            overall = %state.overall,
            "Connection manager initialized"
        );
        is_available(state.overall)
    }

    fn register_health_checks(&self) {
        let inner = &self.inner;
        let registered = inner.health.check_names();
        let threshold = inner.config.health.failure_threshold;

        if inner.relational_store().is_some() && !registered.iter().any(|n| n == RELATIONAL_DEPENDENCY) {
            let weak = Arc::downgrade(inner);
            let result = inner.health.add_health_check(
                RELATIONAL_DEPENDENCY,
                move || {
                    let store = weak.upgrade().and_then(|inner| inner.relational_store());
                    async move {
                        match store {
                            Some(store) => store.ping().await,
                            None => Err(unavailable(RELATIONAL_DEPENDENCY, "store released")),
                        }
                    }
                },
                threshold,
            );
            log_registration(RELATIONAL_DEPENDENCY, result);
        }

        if inner.cache_store().is_some() && !registered.iter().any(|n| n == CACHE_DEPENDENCY) {
            let weak = Arc::downgrade(inner);
            let result = inner.health.add_health_check(
                CACHE_DEPENDENCY,
                move || {
                    let store = weak.upgrade().and_then(|inner| inner.cache_store());
                    async move {
                        match store {
                            Some(store) => store.ping().await,
                            None => Err(unavailable(CACHE_DEPENDENCY, "store released")),
                        }
                    }
                },
                threshold,
            );
            log_registration(CACHE_DEPENDENCY, result);
        }
    }

    /// Runs one statement on the relational store.
    ///
    /// The call goes through the relational breaker and is bounded by the
    /// query timeout. Calls slower than the slow query threshold are logged
    /// and counted; their result is unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::DependencyUnavailable`] if no relational store is present
    /// - [`Error::CircuitOpen`] if the breaker rejects the call
    /// - [`Error::Timeout`] if the query timeout elapses
    /// - the store's own error otherwise
    pub async fn query(&self, text: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = &self.inner;
        let store = inner.require_relational()?;
        let timeout = inner.config.database.query_timeout();

        let start = Instant::now();
        let result = inner
            .relational_breaker
            .execute(|| bounded("query", timeout, store.query(text, params)))
            .await;
        inner.record_query(text, start.elapsed(), &result);
        result
    }

    /// Runs `statements` atomically on the relational store.
    ///
    /// Routed exactly like [`query`](Self::query).
    ///
    /// # Errors
    ///
    /// Same as [`query`](Self::query). On error nothing is committed.
    pub async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<Vec<Row>>> {
        let inner = &self.inner;
        let store = inner.require_relational()?;
        let timeout = inner.config.database.query_timeout();

        let start = Instant::now();
        let result = inner
            .relational_breaker
            .execute(|| bounded("transaction", timeout, store.transaction(statements)))
            .await;
        inner.record_query("<transaction>", start.elapsed(), &result);
        result
    }

    /// Reads `key`, from the remote cache when possible, else the fallback.
    ///
    /// Never fails: remote errors and an open breaker fall back to the
    /// in-process cache. A remote miss is authoritative. A remote hit is
    /// copied into the fallback for `fallback_cache.backfill_ttl_ms`.
    pub async fn cache_get(&self, key: &str) -> Option<String> {
        let inner = &self.inner;
        let Some(store) = inner.cache_store() else {
            return inner.fallback_get(key);
        };
        let timeout = inner.config.cache.command_timeout();

        let result = inner
            .cache_breaker
            .execute(|| bounded("cache_get", timeout, store.get(key)))
            .await;
        inner.observe_outcome(Component::Cache, &result);

        match result {
            Ok(Some(value)) => {
                metrics::counter!("cache_requests_total", "operation" => "get", "tier" => "remote", "result" => "hit")
                    .increment(1);
                inner
                    .fallback
                    .set(key, &value, inner.config.fallback_cache.backfill_ttl());
                Some(value)
            },
            Ok(None) => {
                metrics::counter!("cache_requests_total", "operation" => "get", "tier" => "remote", "result" => "miss")
                    .increment(1);
                inner.fallback.remove(key);
                None
            },
            Err(err) => {
                inner.report_cache_fallback("get", &err);
                inner.fallback_get(key)
            },
        }
    }

    /// Stores `value` under `key` for `ttl` in both tiers.
    ///
    /// The remote write happens first; a remote failure is logged and
    /// reported as a `cache_fallback` event. The fallback is then always
    /// written. Returns false only when `ttl` is zero.
    #[allow(clippy::cast_precision_loss)]
    pub async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            tracing::debug!(key, "Ignoring cache_set with zero ttl");
            return false;
        }

        let inner = &self.inner;
        if let Some(store) = inner.cache_store() {
            let timeout = inner.config.cache.command_timeout();
            let result = inner
                .cache_breaker
                .execute(|| bounded("cache_set", timeout, store.set(key, value, ttl)))
                .await;
            inner.observe_outcome(Component::Cache, &result);
            match result {
                Ok(()) => {
                    metrics::counter!("cache_requests_total", "operation" => "set", "tier" => "remote", "result" => "ok")
                        .increment(1);
                },
                Err(err) => inner.report_cache_fallback("set", &err),
            }
        }

        let stored = inner.fallback.set(key, value, ttl);
        metrics::gauge!("fallback_cache_entries").set(inner.fallback.len() as f64);
        stored
    }

    /// Removes `key` from both tiers. Returns true if either tier held it.
    pub async fn cache_delete(&self, key: &str) -> bool {
        let inner = &self.inner;
        let mut removed = false;
        if let Some(store) = inner.cache_store() {
            let timeout = inner.config.cache.command_timeout();
            let result = inner
                .cache_breaker
                .execute(|| bounded("cache_delete", timeout, store.delete(key)))
                .await;
            inner.observe_outcome(Component::Cache, &result);
            match result {
                Ok(existed) => removed = existed,
                Err(err) => inner.report_cache_fallback("delete", &err),
            }
        }
        inner.fallback.remove(key) || removed
    }

    /// Reads `key` and deserializes it as JSON.
    ///
    /// A payload that does not deserialize is logged and treated as a miss.
    pub async fn cache_get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.cache_get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, error = %err, "Cached payload failed to deserialize");
                None
            },
        }
    }

    /// Serializes `value` as JSON and stores it like [`cache_set`](Self::cache_set).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `value` cannot be serialized.
    pub async fn cache_set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool> {
        let payload = serde_json::to_string(value)
            .map_err(|e| Error::InvalidInput(format!("cache payload for '{key}': {e}")))?;
        Ok(self.cache_set(key, &payload, ttl).await)
    }

    /// Returns state, health, breaker, pool, and fallback figures in one snapshot.
    #[must_use]
    pub fn get_connection_summary(&self) -> ConnectionSummary {
        let inner = &self.inner;
        let circuit_breakers: BTreeMap<String, _> = [&inner.relational_breaker, &inner.cache_breaker]
            .into_iter()
            .map(|breaker| (breaker.name().to_string(), breaker.stats()))
            .collect();

        ConnectionSummary {
            initialized: self.is_initialized(),
            state: inner.connection_state(),
            health: inner.health.get_health_status(),
            circuit_breakers,
            pool: inner.relational_store().map(|store| store.pool_stats()),
            fallback_cache: inner.fallback.stats(),
        }
    }

    /// Stops background tasks, closes both stores, and clears the fallback.
    ///
    /// Safe after a partial initialization and safe to call repeatedly.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        inner.health.stop_monitoring();
        let tasks: Vec<JoinHandle<()>> = lock(&inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let relational = write(&inner.relational).take();
        if let Some(store) = relational {
            store.close().await;
        }
        let cache = write(&inner.cache).take();
        if let Some(store) = cache {
            store.close().await;
        }
        inner.fallback.clear();

        let was_initialized = inner.initialized.swap(false, Ordering::AcqRel);
        inner.update_state(|state| {
            for current in [&mut state.relational, &mut state.cache] {
                if *current != DependencyState::NotConfigured {
                    *current = DependencyState::Disconnected;
                }
            }
        });
        if was_initialized {
            tracing::info!("Connection manager shut down");
        }
    }

    /// Subscribes to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_bus.subscribe()
    }

    /// Returns the event bus events are published on.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    /// Returns true between a completed `initialize` and the next `shutdown`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Returns the health monitor.
    #[must_use]
    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.inner.health
    }
}

impl ManagerInner {
    fn relational_store(&self) -> Option<Arc<dyn RelationalStore>> {
        read(&self.relational).clone()
    }

    fn cache_store(&self) -> Option<Arc<dyn CacheStore>> {
        read(&self.cache).clone()
    }

    fn require_relational(&self) -> Result<Arc<dyn RelationalStore>> {
        self.relational_store().ok_or_else(|| {
            let reason = match self.connection_state().relational {
                DependencyState::NotConfigured => "not configured",
                DependencyState::Disconnected => "not connected",
                _ => "store unavailable",
            };
            unavailable(RELATIONAL_DEPENDENCY, reason)
        })
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn connect_relational(&self) {
        let store = match self.injected_relational.clone() {
            Some(store) => Some(store),
            None if self.config.database.is_configured() => match build_relational(&self.config) {
                Ok(store) => Some(store),
                Err(err @ Error::FeatureNotEnabled(_)) => {
                    tracing::warn!(error = %err, "Database URL configured but backend not compiled in");
                    None
                },
                Err(err) => {
                    tracing::error!(error = %err, "Failed to create relational store");
                    self.set_state(Component::Relational, DependencyState::Error);
                    return;
                },
            },
            None => None,
        };

        let Some(store) = store else {
            self.set_state(Component::Relational, DependencyState::NotConfigured);
            return;
        };

        *write(&self.relational) = Some(Arc::clone(&store));
        self.set_state(Component::Relational, DependencyState::Connecting);

        let timeout = self.config.database.acquire_timeout();
        let result = self
            .relational_breaker
            .execute(|| bounded("postgres_connect", timeout, store.ping()))
            .await;
        match result {
            Ok(()) => {
                tracing::info!(dependency = RELATIONAL_DEPENDENCY, "Relational store connected");
                self.set_state(Component::Relational, DependencyState::Connected);
            },
            Err(err) => {
                tracing::error!(
                    dependency = RELATIONAL_DEPENDENCY,
                    error = %err,
                    "Relational store unreachable, continuing without it"
                );
                self.set_state(Component::Relational, breaker_failure_state(&self.relational_breaker));
            },
        }
    }

    async fn connect_cache(&self) {
        let store = match self.injected_cache.clone() {
            Some(store) => Some(store),
            None if self.config.cache.is_configured() => match build_cache(&self.config) {
                Ok(store) => Some(store),
                Err(err @ Error::FeatureNotEnabled(_)) => {
                    tracing::warn!(error = %err, "Cache URL configured but backend not compiled in");
                    None
                },
                Err(err) => {
                    tracing::error!(error = %err, "Failed to create cache store");
                    self.set_state(Component::Cache, DependencyState::Error);
                    return;
                },
            },
            None => None,
        };

        let Some(store) = store else {
            self.set_state(Component::Cache, DependencyState::NotConfigured);
            return;
        };

        *write(&self.cache) = Some(Arc::clone(&store));
        self.set_state(Component::Cache, DependencyState::Connecting);

        let timeout = self.config.cache.command_timeout();
        let result = self
            .cache_breaker
            .execute(|| bounded("redis_connect", timeout, store.ping()))
            .await;
        match result {
            Ok(()) => {
                tracing::info!(dependency = CACHE_DEPENDENCY, "Cache store connected");
                self.set_state(Component::Cache, DependencyState::Connected);
            },
            Err(err) => {
                tracing::warn!(
                    dependency = CACHE_DEPENDENCY,
                    error = %err,
                    "Cache store unreachable, serving from in-process fallback"
                );
                self.set_state(Component::Cache, breaker_failure_state(&self.cache_breaker));
            },
        }
    }

    fn fallback_get(&self, key: &str) -> Option<String> {
        let value = self.fallback.get(key);
        let result = if value.is_some() { "hit" } else { "miss" };
        metrics::counter!("cache_requests_total", "operation" => "get", "tier" => "fallback", "result" => result)
            .increment(1);
        value
    }

    fn report_cache_fallback(&self, operation: &'static str, err: &Error) {
        tracing::warn!(
            operation,
            error = %err,
            "Cache degraded, using in-process fallback"
        );
        metrics::counter!("cache_fallback_total", "operation" => operation).increment(1);
        self.event_bus.publish(ConnectionEvent::CacheFallback {
            meta: EventMeta::new(EVENT_SOURCE),
            operation,
            reason: err.to_string(),
        });
    }

    fn record_query<T>(&self, text: &str, elapsed: Duration, result: &Result<T>) {
        self.observe_outcome(Component::Relational, result);
        if matches!(result, Err(Error::CircuitOpen { .. })) {
            return;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::histogram!("connection_query_duration_ms", "status" => status).record(elapsed_ms);

        if is_slow(elapsed, self.config.database.slow_query_threshold()) {
            metrics::counter!("connection_slow_queries_total").increment(1);
            tracing::warn!(
                duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                threshold_ms = self.config.database.slow_query_threshold_ms,
                status,
                query = %preview(text),
                "Slow query"
            );
        }
    }

    /// Folds a request outcome into the component state.
    fn observe_outcome<T>(&self, component: Component, result: &Result<T>) {
        let breaker = self.breaker(component);
        let current = self.connection_state().get(component);
        let next = match (breaker.state(), result) {
            (CircuitState::Open, _) => DependencyState::CircuitOpen,
            (CircuitState::Closed, Ok(_)) => DependencyState::Connected,
            _ => current,
        };
        if next != current && current != DependencyState::NotConfigured {
            self.set_state(component, next);
        }
    }

    /// Applies a breaker or health event to the component states.
    fn apply_event(&self, event: &ConnectionEvent) {
        let (name, transition) = match event {
            ConnectionEvent::CircuitOpened { breaker, .. } => (breaker, Transition::CircuitOpened),
            ConnectionEvent::CircuitReset { breaker, .. } => (breaker, Transition::CircuitReset),
            ConnectionEvent::HealthDegraded { check, .. } => (check, Transition::HealthDegraded),
            ConnectionEvent::HealthRecovered { check, .. } => (check, Transition::HealthRecovered),
            _ => return,
        };
        let Some(component) = component_for(name) else {
            return;
        };
        let current = self.connection_state().get(component);
        if matches!(
            current,
            DependencyState::NotConfigured | DependencyState::Disconnected
        ) {
            return;
        }

        let next = match transition {
            Transition::CircuitOpened => DependencyState::CircuitOpen,
            Transition::CircuitReset => DependencyState::Connected,
            Transition::HealthDegraded => DependencyState::Error,
            Transition::HealthRecovered => match self.breaker(component).state() {
                CircuitState::Closed => DependencyState::Connected,
                CircuitState::Open | CircuitState::HalfOpen => DependencyState::Reconnecting,
            },
        };
        self.set_state(component, next);
    }

    /// Re-derives breaker-driven states after the watcher lagged.
    fn resync(&self) {
        for component in [Component::Relational, Component::Cache] {
            let current = self.connection_state().get(component);
            if current == DependencyState::NotConfigured {
                continue;
            }
            if self.breaker(component).state() == CircuitState::Open {
                self.set_state(component, DependencyState::CircuitOpen);
            }
        }
        self.update_state(|_| {});
    }

    fn breaker(&self, component: Component) -> &CircuitBreaker {
        match component {
            Component::Cache => &self.cache_breaker,
            Component::Relational | Component::Overall => &self.relational_breaker,
        }
    }

    fn set_state(&self, component: Component, next: DependencyState) {
        self.update_state(|state| match component {
            Component::Relational => state.relational = next,
            Component::Cache => state.cache = next,
            Component::Overall => {},
        });
    }

    /// Mutates the state, re-derives `overall`, and emits every transition.
    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        let (previous, current) = {
            let mut state = lock(&self.state);
            let previous = *state;
            f(&mut state);
            state.overall =
                state.derive_overall(self.relational_breaker.state(), self.cache_breaker.state());
            (previous, *state)
        };
        self.emit_transitions(previous, current);
    }

    fn emit_transitions(&self, previous: ConnectionState, current: ConnectionState) {
        for component in [Component::Relational, Component::Cache, Component::Overall] {
            let (before, after) = (previous.get(component), current.get(component));
            if before == after {
                continue;
            }
            tracing::info!(
                component = component.as_str(),
                previous = before.as_str(),
                current = after.as_str(),
                "Connection state changed"
            );
            self.event_bus.publish(ConnectionEvent::ConnectionStateChanged {
                meta: EventMeta::new(EVENT_SOURCE),
                component,
                previous: before,
                current: after,
            });
        }

        let (before, after) = (previous.overall, current.overall);
        if after == DependencyState::Degraded && before != DependencyState::Degraded {
            tracing::warn!(previous = before.as_str(), "Service degraded");
            self.event_bus.publish(ConnectionEvent::ServiceDegraded {
                meta: EventMeta::new(EVENT_SOURCE),
                previous: before,
            });
        } else if before == DependencyState::Degraded && after == DependencyState::Connected {
            tracing::info!("Service recovered");
            self.event_bus.publish(ConnectionEvent::ServiceRecovered {
                meta: EventMeta::new(EVENT_SOURCE),
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    CircuitOpened,
    CircuitReset,
    HealthDegraded,
    HealthRecovered,
}

fn component_for(name: &str) -> Option<Component> {
    match name {
        RELATIONAL_DEPENDENCY => Some(Component::Relational),
        CACHE_DEPENDENCY => Some(Component::Cache),
        _ => None,
    }
}

fn breaker_failure_state(breaker: &CircuitBreaker) -> DependencyState {
    if breaker.state() == CircuitState::Open {
        DependencyState::CircuitOpen
    } else {
        DependencyState::Error
    }
}

const fn is_available(overall: DependencyState) -> bool {
    matches!(overall, DependencyState::Connected | DependencyState::Degraded)
}

fn unavailable(dependency: &str, reason: &str) -> Error {
    Error::DependencyUnavailable {
        dependency: dependency.to_string(),
        reason: reason.to_string(),
    }
}

/// Bounds `fut` by `timeout`, mapping expiry to [`Error::Timeout`].
async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
}

fn preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > SLOW_QUERY_PREVIEW_CHARS {
        let truncated: String = collapsed.chars().take(SLOW_QUERY_PREVIEW_CHARS).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}

fn log_registration(name: &str, result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(check = name, error = %err, "Health check registration failed");
    }
}

#[cfg(feature = "postgres")]
fn build_relational(config: &ResilienceConfig) -> Result<Arc<dyn RelationalStore>> {
    let store = crate::storage::PostgresStore::new(&config.database)?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
fn build_relational(_config: &ResilienceConfig) -> Result<Arc<dyn RelationalStore>> {
    Err(Error::FeatureNotEnabled("postgres".to_string()))
}

#[cfg(feature = "redis")]
fn build_cache(config: &ResilienceConfig) -> Result<Arc<dyn CacheStore>> {
    let store = crate::storage::RedisStore::new(&config.cache)?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
fn build_cache(_config: &ResilienceConfig) -> Result<Arc<dyn CacheStore>> {
    Err(Error::FeatureNotEnabled("redis".to_string()))
}

/// A call is slow only when it runs strictly longer than the threshold.
fn is_slow(elapsed: Duration, threshold: Duration) -> bool {
    elapsed > threshold
}

/// Breaker and health events drive component state; the rest are ignored.
fn affects_state(event: &ConnectionEvent) -> bool {
    matches!(
        event,
        ConnectionEvent::CircuitOpened { .. }
            | ConnectionEvent::CircuitReset { .. }
            | ConnectionEvent::HealthDegraded { .. }
            | ConnectionEvent::HealthRecovered { .. }
    )
}

async fn watch_events<F>(inner: Weak<ManagerInner>, mut events: FilteredReceiver<F>)
where
    F: Fn(&ConnectionEvent) -> bool + Send,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.apply_event(&event);
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Connection event watcher lagged, resyncing state");
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.resync();
            },
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn sweep_fallback(inner: Weak<ManagerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let purged = inner.fallback.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Swept expired fallback cache entries");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("SELECT 1", "SELECT 1" ; "short query unchanged")]
    #[test_case("SELECT *\n  FROM videos\n  WHERE id = $1", "SELECT * FROM videos WHERE id = $1" ; "whitespace collapsed")]
    fn test_preview(input: &str, expected: &str) {
        assert_eq!(preview(input), expected);
    }

    #[test]
    fn test_preview_truncates_long_queries() {
        let long = format!("SELECT {}", "x, ".repeat(100));
        let out = preview(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), SLOW_QUERY_PREVIEW_CHARS + 3);
    }

    #[test_case(999, false ; "under threshold")]
    #[test_case(1_000, false ; "at threshold")]
    #[test_case(1_001, true ; "over threshold")]
    fn test_is_slow(elapsed_ms: u64, expected: bool) {
        let threshold = Duration::from_millis(1_000);
        assert_eq!(is_slow(Duration::from_millis(elapsed_ms), threshold), expected);
    }

    #[test]
    fn test_component_for_dependency_names() {
        assert_eq!(component_for("postgresql"), Some(Component::Relational));
        assert_eq!(component_for("redis"), Some(Component::Cache));
        assert_eq!(component_for("other"), None);
    }

    #[tokio::test]
    async fn test_query_without_store_is_unavailable() {
        let manager = ConnectionManager::new(ResilienceConfig::default()).unwrap();
        assert!(!manager.initialize().await);

        let err = manager.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyUnavailable { ref reason, .. } if reason == "not configured"
        ));
        assert_eq!(
            manager.connection_state().relational,
            DependencyState::NotConfigured
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_without_store_uses_fallback_only() {
        let manager = ConnectionManager::new(ResilienceConfig::default()).unwrap();
        manager.initialize().await;

        assert!(manager.cache_set("k", "v", Duration::from_secs(60)).await);
        assert_eq!(manager.cache_get("k").await.as_deref(), Some("v"));
        assert!(!manager.cache_set("k", "v", Duration::ZERO).await);
        assert!(manager.cache_delete("k").await);
        assert_eq!(manager.cache_get("k").await, None);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ResilienceConfig::default();
        config.event_bus_capacity = 0;
        assert!(matches!(
            ConnectionManager::new(config),
            Err(Error::Configuration(_))
        ));
    }
}
