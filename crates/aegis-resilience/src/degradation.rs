//! Graceful degradation with ordered fallback chains.
//!
//! A service is at one of four levels, from best to worst:
//! `Full > Degraded > CriticalOnly > Unavailable`. At `Full` the primary
//! operation runs; below `Full` it is skipped and the fallback chain is walked
//! directly. Counter-driven transitions move one level at a time; fallback
//! selection, exhaustion and operator overrides may jump.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};
use crate::schedule::PeriodicTask;

/// Functional level of a service. Later variants are worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevel {
    /// Everything works.
    Full,
    /// Reduced functionality.
    Degraded,
    /// Only critical functionality.
    CriticalOnly,
    /// Nothing can be served.
    Unavailable,
}

impl ServiceLevel {
    /// One level worse, saturating at `Unavailable`.
    #[must_use]
    pub fn degrade(self) -> Self {
        match self {
            Self::Full => Self::Degraded,
            Self::Degraded => Self::CriticalOnly,
            Self::CriticalOnly | Self::Unavailable => Self::Unavailable,
        }
    }

    /// One level better, saturating at `Full`.
    #[must_use]
    pub fn improve(self) -> Self {
        match self {
            Self::Full | Self::Degraded => Self::Full,
            Self::CriticalOnly => Self::Degraded,
            Self::Unavailable => Self::CriticalOnly,
        }
    }
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Degraded => write!(f, "degraded"),
            Self::CriticalOnly => write!(f, "critical_only"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

type FallbackHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Predicate over the error that triggered the fallback chain.
pub type FallbackPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

/// When a fallback may be used.
#[derive(Clone, Default)]
pub enum FallbackCondition {
    /// Always eligible.
    #[default]
    Always,
    /// Eligible when the triggering error satisfies the predicate.
    /// Without a triggering error (primary skipped) the fallback is eligible.
    When(FallbackPredicate),
}

impl fmt::Debug for FallbackCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::When(_) => write!(f, "When(..)"),
        }
    }
}

/// One entry in a fallback chain.
#[derive(Clone)]
pub struct Fallback {
    /// Fallback identifier.
    pub id: String,
    /// Level the service runs at while this fallback is serving.
    pub level: ServiceLevel,
    /// Optional deadline for the fallback itself.
    pub timeout: Option<Duration>,
    /// Eligibility rule.
    pub condition: FallbackCondition,
    handler: FallbackHandler,
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("timeout", &self.timeout)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

impl Fallback {
    /// Creates a fallback backed by an async handler.
    pub fn new<F, Fut>(id: impl Into<String>, level: ServiceLevel, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            level,
            timeout: None,
            condition: FallbackCondition::Always,
            handler: Arc::new(move || Box::pin(handler())),
        }
    }

    /// Creates a fallback that always returns `value`.
    pub fn static_value(id: impl Into<String>, level: ServiceLevel, value: Value) -> Self {
        Self::new(id, level, move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Sets a deadline for this fallback.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Restricts this fallback to triggering errors accepted by `predicate`.
    #[must_use]
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.condition = FallbackCondition::When(Arc::new(predicate));
        self
    }

    fn is_eligible(&self, current: ServiceLevel, trigger: Option<&ResilienceError>) -> bool {
        if self.level < current {
            return false;
        }
        match (&self.condition, trigger) {
            (FallbackCondition::Always, _) | (FallbackCondition::When(_), None) => true,
            (FallbackCondition::When(predicate), Some(err)) => predicate(err),
        }
    }

    async fn run(&self) -> Result<Value> {
        let future = (self.handler)();
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| ResilienceError::Timeout(limit))?,
            None => future.await,
        }
    }
}

/// Degradation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationConfig {
    /// Consecutive failures that step the level down (default: 3).
    pub degradation_threshold: u32,
    /// Consecutive successes that step the level up (default: 5).
    pub recovery_threshold: u32,
    /// Interval of the optional health probe (default: none).
    pub health_check_interval: Option<Duration>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self { degradation_threshold: 3, recovery_threshold: 5, health_check_interval: None }
    }
}

/// Periodic health probe for a degradation service.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Returns `true` when the underlying service looks healthy.
    async fn probe(&self) -> bool;
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub level: ServiceLevel,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub active_fallback: Option<String>,
    pub last_change: DateTime<Utc>,
}

#[derive(Debug)]
struct StatusRecord {
    level: ServiceLevel,
    consecutive_failures: u32,
    consecutive_successes: u32,
    active_fallback: Option<String>,
    last_change: DateTime<Utc>,
}

impl StatusRecord {
    fn new() -> Self {
        Self {
            level: ServiceLevel::Full,
            consecutive_failures: 0,
            consecutive_successes: 0,
            active_fallback: None,
            last_change: Utc::now(),
        }
    }

    fn set_level(&mut self, to: ServiceLevel) -> Option<(ServiceLevel, ServiceLevel)> {
        let from = self.level;
        if from == to {
            return None;
        }
        self.level = to;
        self.last_change = Utc::now();
        if to == ServiceLevel::Full {
            self.active_fallback = None;
        }
        Some((from, to))
    }
}

struct ServiceInner {
    name: String,
    config: DegradationConfig,
    fallbacks: Vec<Fallback>,
    status: Mutex<StatusRecord>,
    events: EventBus,
}

impl ServiceInner {
    fn lock(&self) -> MutexGuard<'_, StatusRecord> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, change: Option<(ServiceLevel, ServiceLevel)>, reason: &str) {
        let Some((from, to)) = change else {
            return;
        };
        if to > from {
            warn!(service = %self.name, from = %from, to = %to, reason = reason, "Service degraded");
        } else {
            info!(service = %self.name, from = %from, to = %to, reason = reason, "Service recovered");
        }
        self.events.publish(ResilienceEvent::ServiceLevelChanged {
            service: self.name.clone(),
            from,
            to,
            reason: reason.to_string(),
        });
        if to > from {
            self.events.publish(ResilienceEvent::ServiceDegraded { service: self.name.clone(), level: to });
        } else if to == ServiceLevel::Full {
            self.events.publish(ResilienceEvent::ServiceRecovered { service: self.name.clone(), from });
        }
    }

    fn record_success(&self) {
        let change = {
            let mut status = self.lock();
            status.consecutive_failures = 0;
            status.consecutive_successes += 1;
            if status.level != ServiceLevel::Full && status.consecutive_successes >= self.config.recovery_threshold.max(1)
            {
                status.consecutive_successes = 0;
                let target = status.level.improve();
                status.set_level(target)
            } else {
                None
            }
        };
        self.announce(change, "recovery threshold reached");
    }

    fn record_failure(&self) {
        let change = {
            let mut status = self.lock();
            status.consecutive_successes = 0;
            status.consecutive_failures += 1;
            if status.level != ServiceLevel::Unavailable
                && status.consecutive_failures >= self.config.degradation_threshold.max(1)
            {
                status.consecutive_failures = 0;
                let target = status.level.degrade();
                status.set_level(target)
            } else {
                None
            }
        };
        self.announce(change, "degradation threshold reached");
    }

    fn apply_probe(&self, healthy: bool) {
        let change = {
            let mut status = self.lock();
            status.consecutive_failures = 0;
            status.consecutive_successes = 0;
            let target = if healthy { status.level.improve() } else { status.level.degrade() };
            status.set_level(target)
        };
        self.announce(change, if healthy { "health probe passed" } else { "health probe failed" });
    }

    fn force_level(&self, level: ServiceLevel, reason: &str) {
        let change = {
            let mut status = self.lock();
            status.consecutive_failures = 0;
            status.consecutive_successes = 0;
            status.set_level(level)
        };
        self.announce(change, reason);
    }
}

/// A logical service with a primary operation and an ordered fallback chain.
pub struct GracefulDegradationService {
    inner: Arc<ServiceInner>,
    probe_task: Mutex<Option<PeriodicTask>>,
}

impl fmt::Debug for GracefulDegradationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulDegradationService")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("fallbacks", &self.inner.fallbacks)
            .finish_non_exhaustive()
    }
}

impl GracefulDegradationService {
    /// Creates a service at `Full`.
    ///
    /// # Arguments
    /// * `name` - Service name
    /// * `config` - Thresholds
    /// * `fallbacks` - Fallback chain, tried in declaration order
    /// * `events` - Bus receiving level-change notifications
    #[must_use]
    pub fn new(name: impl Into<String>, config: DegradationConfig, fallbacks: Vec<Fallback>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                config,
                fallbacks,
                status: Mutex::new(StatusRecord::new()),
                events,
            }),
            probe_task: Mutex::new(None),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current level.
    pub fn level(&self) -> ServiceLevel {
        self.inner.lock().level
    }

    /// Returns a status snapshot.
    pub fn status(&self) -> ServiceStatus {
        let status = self.inner.lock();
        ServiceStatus {
            name: self.inner.name.clone(),
            level: status.level,
            consecutive_failures: status.consecutive_failures,
            consecutive_successes: status.consecutive_successes,
            active_fallback: status.active_fallback.clone(),
            last_change: status.last_change,
        }
    }

    /// Runs the primary operation (at `Full`) or the fallback chain.
    pub async fn execute<F, Fut>(&self, primary: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let inner = &self.inner;
        let trigger = if self.level() == ServiceLevel::Full {
            match primary().await {
                Ok(value) => {
                    inner.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    debug!(service = %inner.name, error = %err, "Primary operation failed");
                    inner.record_failure();
                    Some(err)
                }
            }
        } else {
            None
        };

        let current = self.level();
        let mut tried = 0usize;
        for fallback in &inner.fallbacks {
            if !fallback.is_eligible(current, trigger.as_ref()) {
                continue;
            }
            tried += 1;
            match fallback.run().await {
                Ok(value) => {
                    // Fallback successes say nothing about the primary and never
                    // count toward recovery.
                    let change = {
                        let mut status = inner.lock();
                        status.consecutive_failures = 0;
                        status.active_fallback = Some(fallback.id.clone());
                        if status.level == ServiceLevel::Full {
                            status.set_level(fallback.level)
                        } else {
                            None
                        }
                    };
                    inner.announce(change, "fallback engaged");
                    inner.events.publish(ResilienceEvent::FallbackUsed {
                        service: inner.name.clone(),
                        fallback: fallback.id.clone(),
                        level: fallback.level,
                    });
                    debug!(service = %inner.name, fallback = %fallback.id, "Served fallback response");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(service = %inner.name, fallback = %fallback.id, error = %err, "Fallback failed");
                }
            }
        }

        inner.force_level(ServiceLevel::Unavailable, "fallbacks exhausted");
        let reason = match (tried, trigger) {
            (0, Some(err)) => format!("no eligible fallback after primary failure: {}", err),
            (0, None) => format!("no eligible fallback at level {}", current),
            (n, _) => format!("all {} eligible fallbacks failed", n),
        };
        Err(ResilienceError::DegradationUnavailable { service: inner.name.clone(), reason })
    }

    /// Counts a success toward recovery.
    pub fn record_success(&self) {
        self.inner.record_success();
    }

    /// Counts a failure toward degradation.
    pub fn record_failure(&self) {
        self.inner.record_failure();
    }

    /// Sets the level directly, bypassing the one-step rule.
    pub fn force_service_level(&self, level: ServiceLevel, reason: &str) {
        self.inner.force_level(level, reason);
    }

    /// Returns to `Full` with cleared counters.
    pub fn reset(&self) {
        self.inner.force_level(ServiceLevel::Full, "reset");
    }

    /// Starts the periodic health probe.
    ///
    /// Returns `false` without starting anything when no
    /// `health_check_interval` is configured.
    pub fn start_probe(&self, probe: Arc<dyn ServiceProbe>) -> bool {
        let Some(interval) = self.inner.config.health_check_interval else {
            warn!(service = %self.inner.name, "No health check interval configured, probe not started");
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let mut task = PeriodicTask::new(format!("degradation-probe:{}", self.inner.name), interval, move || {
            let inner = Arc::clone(&inner);
            let probe = Arc::clone(&probe);
            async move {
                let healthy = probe.probe().await;
                inner.apply_probe(healthy);
            }
        });
        task.start();
        let mut slot = self.probe_task.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(task);
        true
    }

    /// Stops the health probe.
    pub fn shutdown(&self) {
        if let Some(mut task) = self.probe_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.stop();
        }
        debug!(service = %self.inner.name, "Degradation service shut down");
    }
}

/// Registry of named degradation services.
#[derive(Default)]
pub struct DegradationRegistry {
    services: RwLock<HashMap<String, Arc<GracefulDegradationService>>>,
}

impl fmt::Debug for DegradationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationRegistry").field("service_count", &self.all().len()).finish()
    }
}

impl DegradationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, replacing (and shutting down) any previous one with the same name.
    pub fn register(&self, service: GracefulDegradationService) -> Arc<GracefulDegradationService> {
        let service = Arc::new(service);
        let previous = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.name().to_string(), Arc::clone(&service));
        if let Some(previous) = previous {
            previous.shutdown();
        }
        service
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<Arc<GracefulDegradationService>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// All services, sorted by name.
    pub fn all(&self) -> Vec<Arc<GracefulDegradationService>> {
        let mut services: Vec<_> =
            self.services.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Status of every service, sorted by name.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.all().iter().map(|service| service.status()).collect()
    }

    /// Stops every health probe.
    pub fn shutdown_all(&self) {
        for service in self.all() {
            service.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn service(fallbacks: Vec<Fallback>) -> GracefulDegradationService {
        GracefulDegradationService::new(
            "catalog",
            DegradationConfig { degradation_threshold: 3, recovery_threshold: 2, health_check_interval: None },
            fallbacks,
            EventBus::new(),
        )
    }

    async fn failing_primary() -> Result<Value> {
        Err(OperationError::http(503, "down").into())
    }

    #[test]
    fn test_level_steps() {
        assert_eq!(ServiceLevel::Full.degrade(), ServiceLevel::Degraded);
        assert_eq!(ServiceLevel::Unavailable.degrade(), ServiceLevel::Unavailable);
        assert_eq!(ServiceLevel::Unavailable.improve(), ServiceLevel::CriticalOnly);
        assert_eq!(ServiceLevel::Full.improve(), ServiceLevel::Full);
        assert!(ServiceLevel::CriticalOnly > ServiceLevel::Degraded);
    }

    #[test]
    fn test_threshold_failures_step_exactly_one_level() {
        let service = service(vec![]);
        for _ in 0..3 {
            service.record_failure();
        }
        assert_eq!(service.level(), ServiceLevel::Degraded);

        // Another two failures are not enough for a second step.
        service.record_failure();
        service.record_failure();
        assert_eq!(service.level(), ServiceLevel::Degraded);
        service.record_failure();
        assert_eq!(service.level(), ServiceLevel::CriticalOnly);
    }

    #[test]
    fn test_successes_recover_one_level_and_clear_failures() {
        let service = service(vec![]);
        service.force_service_level(ServiceLevel::CriticalOnly, "test");
        service.record_failure();

        service.record_success();
        service.record_success();
        let status = service.status();
        assert_eq!(status.level, ServiceLevel::Degraded);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn test_degraded_and_recovered_notifications() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let service = GracefulDegradationService::new("catalog", DegradationConfig::default(), vec![], events);

        service.force_service_level(ServiceLevel::Degraded, "maintenance");
        service.force_service_level(ServiceLevel::Full, "maintenance over");

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(received.iter().any(|e| matches!(e, ResilienceEvent::ServiceDegraded { level: ServiceLevel::Degraded, .. })));
        assert!(received.iter().any(|e| matches!(e, ResilienceEvent::ServiceRecovered { from: ServiceLevel::Degraded, .. })));
    }

    #[tokio::test]
    async fn test_primary_success_at_full() {
        let service = service(vec![Fallback::static_value("cache", ServiceLevel::Degraded, json!("stale"))]);
        let value = service.execute(|| async { Ok(json!("fresh")) }).await.unwrap();
        assert_eq!(value, json!("fresh"));
        assert_eq!(service.level(), ServiceLevel::Full);
    }

    #[tokio::test]
    async fn test_fallback_sets_declared_level() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let service = GracefulDegradationService::new(
            "catalog",
            DegradationConfig::default(),
            vec![
                Fallback::new("replica", ServiceLevel::Degraded, || async {
                    Err(OperationError::new("replica down").into())
                }),
                Fallback::static_value("static", ServiceLevel::CriticalOnly, json!({"items": []})),
            ],
            events,
        );

        let value = service.execute(failing_primary).await.unwrap();
        assert_eq!(value, json!({"items": []}));

        let status = service.status();
        assert_eq!(status.level, ServiceLevel::CriticalOnly);
        assert_eq!(status.active_fallback.as_deref(), Some("static"));
        assert_eq!(status.consecutive_failures, 0);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ResilienceEvent::ServiceLevelChanged { from: ServiceLevel::Full, to: ServiceLevel::CriticalOnly, .. }
        ));
    }

    #[tokio::test]
    async fn test_degraded_level_skips_primary_and_incompatible_fallbacks() {
        let primary_called = AtomicBool::new(false);
        let service = service(vec![
            Fallback::static_value("degraded-only", ServiceLevel::Degraded, json!("d")),
            Fallback::static_value("critical", ServiceLevel::CriticalOnly, json!("c")),
        ]);
        service.force_service_level(ServiceLevel::CriticalOnly, "test");

        let value = service
            .execute(|| {
                primary_called.store(true, Ordering::SeqCst);
                async { Ok(json!("primary")) }
            })
            .await
            .unwrap();

        assert_eq!(value, json!("c"));
        assert!(!primary_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fallback_successes_do_not_restore_full_service() {
        let primary_calls = AtomicU32::new(0);
        let service = service(vec![Fallback::static_value("cache", ServiceLevel::Degraded, json!("stale"))]);

        let mut levels = Vec::new();
        for _ in 0..12 {
            let value = service
                .execute(|| {
                    primary_calls.fetch_add(1, Ordering::SeqCst);
                    failing_primary()
                })
                .await
                .unwrap();
            assert_eq!(value, json!("stale"));
            levels.push(service.level());
        }

        assert!(levels.iter().all(|level| *level == ServiceLevel::Degraded));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.status().consecutive_successes, 0);

        // Explicit evidence from the primary still recovers the service.
        service.record_success();
        service.record_success();
        assert_eq!(service.level(), ServiceLevel::Full);
    }

    #[tokio::test]
    async fn test_condition_rejects_fallback() {
        let service = service(vec![
            Fallback::static_value("rate-limited", ServiceLevel::Degraded, json!("queued"))
                .when(|err| matches!(err, ResilienceError::Operation(op) if op.kind == crate::error::FailureKind::Http(429))),
            Fallback::static_value("generic", ServiceLevel::Degraded, json!("generic")),
        ]);

        let value = service.execute(failing_primary).await.unwrap();
        assert_eq!(value, json!("generic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timeout_moves_to_next() {
        let service = service(vec![
            Fallback::new("slow", ServiceLevel::Degraded, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("slow"))
            })
            .with_timeout(Duration::from_secs(1)),
            Fallback::static_value("fast", ServiceLevel::Degraded, json!("fast")),
        ]);

        let value = service.execute(failing_primary).await.unwrap();
        assert_eq!(value, json!("fast"));
    }

    #[tokio::test]
    async fn test_exhausted_fallbacks_make_service_unavailable() {
        let service = service(vec![Fallback::new("broken", ServiceLevel::Degraded, || async {
            Err(OperationError::new("broken").into())
        })]);

        let result = service.execute(failing_primary).await;
        assert!(matches!(result, Err(ResilienceError::DegradationUnavailable { .. })));
        assert_eq!(service.level(), ServiceLevel::Unavailable);

        service.reset();
        assert_eq!(service.level(), ServiceLevel::Full);
    }

    struct FlakyProbe {
        healthy: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ServiceProbe for FlakyProbe {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_steps_level() {
        let service = GracefulDegradationService::new(
            "search",
            DegradationConfig { health_check_interval: Some(Duration::from_secs(10)), ..Default::default() },
            vec![],
            EventBus::new(),
        );
        let probe = Arc::new(FlakyProbe { healthy: AtomicBool::new(false), calls: AtomicU32::new(0) });
        assert!(service.start_probe(probe.clone()));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(service.level(), ServiceLevel::Degraded);

        probe.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.level(), ServiceLevel::Full);

        service.shutdown();
        let calls = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_probe_requires_interval() {
        let service = service(vec![]);
        let probe = Arc::new(FlakyProbe { healthy: AtomicBool::new(true), calls: AtomicU32::new(0) });
        assert!(!service.start_probe(probe));
    }
}
