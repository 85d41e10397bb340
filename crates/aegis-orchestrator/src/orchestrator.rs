//! Self-healing orchestrator.
//!
//! Composes the resilience primitives behind one entry point
//! ([`SelfHealingOrchestrator::execute_with_protection`]), listens to their
//! events and turns them into recovery actions, and keeps a rolling history
//! of system snapshots.

use aegis_resilience::{
    AutoScaler, AutoScalerConfig, Bulkhead, BulkheadConfig, BulkheadRegistry, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, DegradationRegistry, EventBus, GracefulDegradationService,
    HealthCheckSpec, HealthMonitor, HealthMonitorConfig, HealthStatus, PeriodicTask, ResilienceError,
    ResilienceEvent, Result, RetryMechanism, ScalingHandler, ScalingRule, ServiceLevel,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AegisConfig;
use crate::metrics::{
    HealthSummary, MetricsHistory, PerformanceSummary, RequestOutcome, RequestTotals, RequestWindow,
    ResilienceSummary, SystemSnapshot,
};
use crate::options::ProtectionOptions;
use crate::recovery::{PlannedRecovery, RecoveryAction, RecoveryActionKind, RecoveryEngine, RecoveryHandler, RecoveryRecord, RecoveryReport};

/// Condition signalled while at least one circuit is open.
pub const CONDITION_CIRCUIT_OPEN: &str = "circuit_breaker_open";
pub const CONDITION_HEALTH_DEGRADED: &str = "health_degraded";
pub const CONDITION_HEALTH_UNHEALTHY: &str = "health_unhealthy";
pub const CONDITION_HEALTH_CRITICAL: &str = "health_critical";
pub const CONDITION_SERVICE_DEGRADED: &str = "service_degraded";
pub const CONDITION_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const CONDITION_BULKHEAD_EXHAUSTED: &str = "bulkhead_exhausted";
pub const CONDITION_SCALING_FAILED: &str = "scaling_failed";
/// Signalled on every metrics tick with the interval's error rate.
pub const CONDITION_ERROR_RATE: &str = "error_rate";
/// Signalled on every metrics tick with the interval's average latency in ms.
pub const CONDITION_RESPONSE_TIME: &str = "response_time";

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub metrics_interval: Duration,
    pub history_retention: Duration,
    pub recovery_history_size: usize,
    /// How long shutdown waits for running bulkhead work.
    pub shutdown_grace: Duration,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(86_400),
            recovery_history_size: crate::recovery::DEFAULT_RECOVERY_HISTORY,
            shutdown_grace: Duration::from_secs(30),
            event_capacity: aegis_resilience::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Builder for [`SelfHealingOrchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    circuit_defaults: CircuitBreakerConfig,
    bulkhead_defaults: BulkheadConfig,
    circuits: Vec<(String, CircuitBreakerConfig)>,
    bulkheads: Vec<(String, BulkheadConfig)>,
    health: HealthMonitorConfig,
    autoscaler: AutoScalerConfig,
    scaling_rules: Vec<ScalingRule>,
    scaling_handler: Option<Arc<dyn ScalingHandler>>,
    recovery_handler: Option<Arc<dyn RecoveryHandler>>,
    recovery_actions: Vec<RecoveryAction>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("circuits", &self.circuits)
            .field("bulkheads", &self.bulkheads)
            .field("scaling_rules", &self.scaling_rules.len())
            .field("recovery_actions", &self.recovery_actions.len())
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Settings for circuit breakers created on first use.
    #[must_use]
    pub fn circuit_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_defaults = config;
        self
    }

    /// Settings for bulkheads created on first use.
    #[must_use]
    pub fn bulkhead_defaults(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead_defaults = config;
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.circuits.push((name.into(), config));
        self
    }

    #[must_use]
    pub fn bulkhead(mut self, name: impl Into<String>, config: BulkheadConfig) -> Self {
        self.bulkheads.push((name.into(), config));
        self
    }

    #[must_use]
    pub fn health(mut self, config: HealthMonitorConfig) -> Self {
        self.health = config;
        self
    }

    #[must_use]
    pub fn autoscaler(mut self, config: AutoScalerConfig) -> Self {
        self.autoscaler = config;
        self
    }

    #[must_use]
    pub fn scaling_rule(mut self, rule: ScalingRule) -> Self {
        self.scaling_rules.push(rule);
        self
    }

    #[must_use]
    pub fn scaling_handler(mut self, handler: Arc<dyn ScalingHandler>) -> Self {
        self.scaling_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn recovery_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
        self.recovery_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn recovery_action(mut self, action: RecoveryAction) -> Self {
        self.recovery_actions.push(action);
        self
    }

    /// Creates the orchestrator. Background work starts with
    /// [`SelfHealingOrchestrator::start`].
    pub fn build(self) -> SelfHealingOrchestrator {
        let events = EventBus::with_capacity(self.config.event_capacity);

        let circuits = CircuitBreakerRegistry::new(self.circuit_defaults, events.clone());
        for (name, config) in self.circuits {
            circuits.register(&name, config);
        }
        let bulkheads = BulkheadRegistry::new(self.bulkhead_defaults, events.clone());
        for (name, config) in self.bulkheads {
            bulkheads.register(&name, config);
        }

        let mut autoscaler = AutoScaler::new(self.autoscaler, self.scaling_rules, events.clone());
        if let Some(handler) = self.scaling_handler {
            autoscaler = autoscaler.with_handler(handler);
        }

        let recovery = RecoveryEngine::new(self.config.recovery_history_size, events.clone());
        for action in self.recovery_actions {
            recovery.register(action);
        }

        let inner = Inner {
            health: HealthMonitor::new(self.health, events.clone()),
            history: Mutex::new(MetricsHistory::new(self.config.history_retention)),
            config: self.config,
            events,
            circuits,
            bulkheads,
            services: DegradationRegistry::new(),
            autoscaler,
            recovery,
            recovery_handler: self.recovery_handler,
            window: Mutex::new(RequestWindow::default()),
            totals: Mutex::new(RequestTotals::default()),
        };
        SelfHealingOrchestrator { inner: Arc::new(inner), background: Mutex::new(None) }
    }
}

struct Inner {
    config: OrchestratorConfig,
    events: EventBus,
    circuits: CircuitBreakerRegistry,
    bulkheads: BulkheadRegistry,
    services: DegradationRegistry,
    health: HealthMonitor,
    autoscaler: AutoScaler,
    recovery: RecoveryEngine,
    recovery_handler: Option<Arc<dyn RecoveryHandler>>,
    window: Mutex<RequestWindow>,
    totals: Mutex<RequestTotals>,
    history: Mutex<MetricsHistory>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn record_request(&self, outcome: RequestOutcome, latency: Duration) {
        lock(&self.window).record(outcome, latency);
    }

    fn build_snapshot(&self, window: &RequestWindow, mut totals: RequestTotals) -> SystemSnapshot {
        totals.absorb(window);
        SystemSnapshot {
            timestamp: chrono::Utc::now(),
            health: HealthSummary::from(&self.health.system_health()),
            performance: PerformanceSummary {
                requests: window.total(),
                error_rate: window.error_rate(),
                average_response_time_ms: window.average_latency_ms(),
                request_rate: window.rate(self.config.metrics_interval),
                instances: self.autoscaler.instances(),
                totals,
            },
            resilience: ResilienceSummary {
                circuits: self.circuits.metrics(),
                bulkheads: self.bulkheads.metrics(),
                services: self.services.statuses(),
            },
        }
    }

    /// Closes the current request window, stores a snapshot and feeds the
    /// autoscaler and the recovery engine.
    async fn collect_metrics(&self) -> SystemSnapshot {
        let window = std::mem::take(&mut *lock(&self.window));
        let totals = lock(&self.totals).clone();
        let snapshot = self.build_snapshot(&window, totals);
        lock(&self.totals).absorb(&window);
        lock(&self.history).push(snapshot.clone());

        let performance = &snapshot.performance;
        self.autoscaler.record_metric("error_rate", performance.error_rate);
        self.autoscaler.record_metric("response_time_ms", performance.average_response_time_ms);
        self.autoscaler.record_metric("request_rate", performance.request_rate);
        debug!(
            requests = performance.requests,
            error_rate = performance.error_rate,
            response_time_ms = performance.average_response_time_ms,
            "Collected system metrics"
        );

        self.trigger_condition(CONDITION_ERROR_RATE, performance.error_rate).await;
        self.trigger_condition(CONDITION_RESPONSE_TIME, performance.average_response_time_ms).await;
        snapshot
    }

    async fn trigger_condition(&self, condition: &str, value: f64) -> Vec<RecoveryRecord> {
        let planned = self.recovery.plan(condition, value);
        let mut records = Vec::with_capacity(planned.len());
        for plan in planned {
            info!(
                action = %plan.action.id,
                condition = condition,
                attempt = plan.attempt,
                "Dispatching recovery action"
            );
            let started = Instant::now();
            let outcome = self.execute_action(&plan).await;
            records.push(self.recovery.complete(&plan, &outcome, started.elapsed()));
        }
        records
    }

    async fn execute_action(&self, plan: &PlannedRecovery) -> Result<()> {
        let action = &plan.action;
        let reason = format!("recovery action {}", action.id);
        match &action.kind {
            RecoveryActionKind::Restart { .. } | RecoveryActionKind::Custom { .. } => match &self.recovery_handler {
                Some(handler) => handler.handle(action, &plan.trigger).await,
                None => Err(ResilienceError::RecoveryAction {
                    action: action.id.clone(),
                    reason: "no recovery handler installed".to_string(),
                }),
            },
            RecoveryActionKind::Scale { direction, amount } => {
                self.autoscaler.force_scale(*direction, *amount, &reason).await.map(|_| ())
            }
            RecoveryActionKind::Degrade { service, level } => {
                let service = self
                    .services
                    .get(service)
                    .ok_or_else(|| ResilienceError::NotRegistered { kind: "degradation service", name: service.clone() })?;
                service.force_service_level(*level, &reason);
                Ok(())
            }
            RecoveryActionKind::ResetCircuit { circuit: Some(name) } => self.circuits.reset(name),
            RecoveryActionKind::ResetCircuit { circuit: None } => {
                let reset = self.circuits.reset_open();
                debug!(circuits = ?reset, "Reset open circuits");
                Ok(())
            }
        }
    }

    /// Maps an event onto the conditions it signals.
    fn circuit_conditions(&self) -> Vec<(&'static str, f64)> {
        let open = self.circuits.metrics().iter().filter(|m| m.state == CircuitState::Open).count();
        vec![(CONDITION_CIRCUIT_OPEN, open as f64)]
    }

    fn service_conditions(&self) -> Vec<(&'static str, f64)> {
        let statuses = self.services.statuses();
        let degraded = statuses.iter().filter(|s| s.level != ServiceLevel::Full).count();
        let unavailable = statuses.iter().filter(|s| s.level == ServiceLevel::Unavailable).count();
        vec![(CONDITION_SERVICE_DEGRADED, degraded as f64), (CONDITION_SERVICE_UNAVAILABLE, unavailable as f64)]
    }

    fn conditions_for(&self, event: &ResilienceEvent) -> Vec<(&'static str, f64)> {
        match event {
            ResilienceEvent::CircuitStateChanged { .. } => self.circuit_conditions(),
            ResilienceEvent::HealthStatusChanged { to, .. } => health_conditions(*to),
            ResilienceEvent::ServiceLevelChanged { .. } => self.service_conditions(),
            ResilienceEvent::BulkheadRejected { .. } | ResilienceEvent::BulkheadTimedOut { .. } => {
                vec![(CONDITION_BULKHEAD_EXHAUSTED, 1.0)]
            }
            ResilienceEvent::ScalingFailed { .. } => vec![(CONDITION_SCALING_FAILED, 1.0)],
            _ => Vec::new(),
        }
    }

    async fn handle_event(&self, event: &ResilienceEvent) {
        for (condition, value) in self.conditions_for(event) {
            self.trigger_condition(condition, value).await;
        }
    }

    /// Re-signals every state-derived condition from current component status.
    ///
    /// Used after the listener lagged behind the bus. Edge-only conditions
    /// (bulkhead exhaustion, scaling failures) carried by the skipped events
    /// cannot be recovered and are dropped.
    async fn resync(&self) {
        let mut conditions = self.circuit_conditions();
        conditions.extend(health_conditions(self.health.status()));
        conditions.extend(self.service_conditions());
        for (condition, value) in conditions {
            self.trigger_condition(condition, value).await;
        }
    }
}

/// One value per health condition: 1 for `current`, 0 for the others.
fn health_conditions(current: HealthStatus) -> Vec<(&'static str, f64)> {
    [
        (HealthStatus::Degraded, CONDITION_HEALTH_DEGRADED),
        (HealthStatus::Unhealthy, CONDITION_HEALTH_UNHEALTHY),
        (HealthStatus::Critical, CONDITION_HEALTH_CRITICAL),
    ]
    .into_iter()
    .map(|(status, condition)| (condition, if current == status { 1.0 } else { 0.0 }))
    .collect()
}

struct Background {
    token: CancellationToken,
    listener: JoinHandle<()>,
    metrics: PeriodicTask,
}

/// Composes the resilience primitives and heals the system on their signals.
pub struct SelfHealingOrchestrator {
    inner: Arc<Inner>,
    background: Mutex<Option<Background>>,
}

impl fmt::Debug for SelfHealingOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealingOrchestrator")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn with_timeout<T, Fut>(future: Fut, limit: Option<Duration>) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| ResilienceError::Timeout(limit))?,
        None => future.await,
    }
}

impl SelfHealingOrchestrator {
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Builder preloaded from a configuration file model.
    pub fn from_config(config: &AegisConfig) -> OrchestratorBuilder {
        let mut builder = OrchestratorBuilder::new()
            .config(config.orchestrator.to_runtime())
            .health(config.health.to_runtime())
            .autoscaler(config.autoscaler.to_runtime());
        for (name, section) in &config.circuit_breakers {
            builder = builder.circuit_breaker(name, section.to_runtime());
        }
        for (name, section) in &config.bulkheads {
            builder = builder.bulkhead(name, section.to_runtime());
        }
        for rule in &config.scaling_rules {
            builder = builder.scaling_rule(rule.to_runtime());
        }
        for action in &config.recovery_actions {
            builder = builder.recovery_action(action.to_runtime());
        }
        builder
    }

    /// Starts the event listener, the metrics tick and the autoscaler.
    ///
    /// No-op if already running. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut background = lock(&self.background);
        if background.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let listener = {
            let inner = Arc::clone(&self.inner);
            let token = token.clone();
            let mut rx = self.inner.events.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(event) => inner.handle_event(&event).await,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped = skipped, "Recovery listener fell behind the event bus, resyncing");
                                inner.resync().await;
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
                debug!("Recovery listener stopped");
            })
        };

        let inner = Arc::clone(&self.inner);
        let mut metrics = PeriodicTask::new("metrics", self.inner.config.metrics_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.collect_metrics().await;
            }
        });
        metrics.start();
        self.inner.autoscaler.start();

        *background = Some(Background { token, listener, metrics });
        info!(
            metrics_interval_ms = self.inner.config.metrics_interval.as_millis() as u64,
            "Self-healing orchestrator started"
        );
    }

    /// Returns `true` between [`start`](Self::start) and [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        lock(&self.background).is_some()
    }

    /// Runs `operation` under the layers named in `options`.
    ///
    /// Without a degradation service the layers nest as circuit breaker, then
    /// retry, then bulkhead, with the per-attempt timeout innermost. With a
    /// degradation service the call is delegated to that service instead. A
    /// primary result is returned as is; fallback payloads are decoded into
    /// `T`, and a payload that does not decode yields
    /// [`ResilienceError::Serialization`] without touching the service counters.
    pub async fn execute_with_protection<T, F, Fut>(&self, operation: F, options: &ProtectionOptions) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let result = self.run_protected(&operation, options).await;
        let outcome = match &result {
            Ok(_) => RequestOutcome::Success,
            Err(err) if err.is_rejection() => RequestOutcome::Rejected,
            Err(_) => RequestOutcome::Failure,
        };
        self.inner.record_request(outcome, started.elapsed());
        result
    }

    async fn run_protected<T, F, Fut>(&self, operation: &F, options: &ProtectionOptions) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let timeout = options.timeout;
        let attempt = move || with_timeout(operation(), timeout);

        if let Some(name) = &options.graceful_degradation {
            let service = self
                .inner
                .services
                .get(name)
                .ok_or_else(|| ResilienceError::NotRegistered { kind: "degradation service", name: name.clone() })?;
            let mut primary = None;
            let slot = &mut primary;
            let value = service
                .execute(|| async move {
                    *slot = Some(attempt().await?);
                    Ok(serde_json::Value::Null)
                })
                .await?;
            return match primary {
                Some(value) => Ok(value),
                None => Ok(serde_json::from_value(value)?),
            };
        }

        let bulkhead = options.bulkhead.as_deref().map(|name| self.inner.bulkheads.get_or_create(name));
        let bulkhead = bulkhead.as_deref();
        let priority = options.priority;
        let guarded = move || async move {
            match bulkhead {
                Some(bulkhead) => bulkhead.execute(attempt, priority).await,
                None => attempt().await,
            }
        };

        let retry = options.retry.clone().map(RetryMechanism::new);
        let retry = retry.as_ref();
        let retried = move || async move {
            match retry {
                Some(retry) => retry.execute(guarded).await,
                None => guarded().await,
            }
        };

        let circuit = options.circuit_breaker.as_deref().map(|name| self.inner.circuits.get_or_create(name));
        match circuit.as_deref() {
            Some(circuit) => circuit.execute(retried).await,
            None => retried().await,
        }
    }

    /// Signals `condition` with `value` and runs the recovery actions it makes due.
    pub async fn trigger_condition(&self, condition: &str, value: f64) -> Vec<RecoveryRecord> {
        self.inner.trigger_condition(condition, value).await
    }

    /// Closes the current metrics interval now instead of waiting for the tick.
    pub async fn collect_metrics(&self) -> SystemSnapshot {
        self.inner.collect_metrics().await
    }

    /// Snapshot of the current state, including the open metrics interval.
    pub fn snapshot(&self) -> SystemSnapshot {
        let window = lock(&self.inner.window).clone();
        let totals = lock(&self.inner.totals).clone();
        self.inner.build_snapshot(&window, totals)
    }

    /// Stored snapshots, oldest first.
    pub fn metrics_history(&self) -> Vec<SystemSnapshot> {
        lock(&self.inner.history).snapshots()
    }

    pub fn register_circuit_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.inner.circuits.register(name, config)
    }

    pub fn register_bulkhead(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        self.inner.bulkheads.register(name, config)
    }

    pub fn register_degradation_service(&self, service: GracefulDegradationService) -> Arc<GracefulDegradationService> {
        self.inner.services.register(service)
    }

    /// Registers and schedules a health check.
    pub fn register_health_check(&self, spec: HealthCheckSpec) {
        self.inner.health.register(spec);
    }

    pub fn unregister_health_check(&self, name: &str) -> bool {
        self.inner.health.unregister(name)
    }

    pub fn add_scaling_rule(&self, rule: ScalingRule) {
        self.inner.autoscaler.add_rule(rule);
    }

    pub fn remove_scaling_rule(&self, id: &str) -> bool {
        self.inner.autoscaler.remove_rule(id)
    }

    pub fn register_recovery_action(&self, action: RecoveryAction) {
        self.inner.recovery.register(action);
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.circuits
    }

    pub fn bulkheads(&self) -> &BulkheadRegistry {
        &self.inner.bulkheads
    }

    pub fn degradation_services(&self) -> &DegradationRegistry {
        &self.inner.services
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub fn autoscaler(&self) -> &AutoScaler {
        &self.inner.autoscaler
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.inner.recovery
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.inner.recovery.report()
    }

    /// Stops all background work and drains the bulkheads.
    ///
    /// Returns `true` if every bulkhead drained within the shutdown grace period.
    pub async fn shutdown(&self) -> bool {
        info!("Shutting down self-healing orchestrator");
        self.inner.recovery.set_enabled(false);

        let background = lock(&self.background).take();
        if let Some(Background { token, listener, mut metrics }) = background {
            token.cancel();
            metrics.stop();
            if let Err(err) = listener.await {
                warn!(error = %err, "Recovery listener ended abnormally");
            }
        }

        self.inner.health.shutdown();
        self.inner.autoscaler.shutdown();
        let drained = self.inner.bulkheads.shutdown_all(self.inner.config.shutdown_grace).await;
        self.inner.services.shutdown_all();

        if drained {
            info!("Self-healing orchestrator stopped");
        } else {
            warn!("Self-healing orchestrator stopped with bulkhead work still running");
        }
        drained
    }
}

impl Drop for SelfHealingOrchestrator {
    fn drop(&mut self) {
        if let Some(background) = lock(&self.background).take() {
            background.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_resilience::{Fallback, OperationError, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(3).with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprotected_call_passes_through() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        let value: u32 = orchestrator.execute_with_protection(|| async { Ok(7) }, &ProtectionOptions::new()).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(orchestrator.snapshot().performance.requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_failures() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        let calls = AtomicU32::new(0);
        let options = ProtectionOptions::new().circuit_breaker("db").bulkhead("db-pool").retry(fast_retry());

        let value: String = orchestrator
            .execute_with_protection(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(OperationError::connection_reset("reset").into())
                        } else {
                            Ok("row".to_string())
                        }
                    }
                },
                &options,
            )
            .await
            .unwrap();

        assert_eq!(value, "row");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let circuit = orchestrator.circuit_breakers().get("db").unwrap();
        assert_eq!(circuit.metrics().failed_calls, 0);
        assert_eq!(orchestrator.bulkheads().get("db-pool").unwrap().metrics().total_executed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_per_attempt() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        let options = ProtectionOptions::new().timeout(Duration::from_millis(100));
        let result: Result<()> = orchestrator
            .execute_with_protection(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                &options,
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
        assert!((orchestrator.snapshot().performance.error_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_counted_as_rejection() {
        let orchestrator = SelfHealingOrchestrator::builder()
            .circuit_breaker("api", CircuitBreakerConfig { failure_threshold: 1, ..Default::default() })
            .build();
        let options = ProtectionOptions::new().circuit_breaker("api");
        let failing = || async { Err::<(), _>(OperationError::new("boom").into()) };

        assert!(matches!(
            orchestrator.execute_with_protection(failing, &options).await,
            Err(ResilienceError::Operation(_))
        ));
        assert!(matches!(
            orchestrator.execute_with_protection(failing, &options).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
        let totals = orchestrator.snapshot().performance.totals;
        assert_eq!((totals.failures, totals.rejections), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degradation_replaces_chain() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        orchestrator.register_degradation_service(GracefulDegradationService::new(
            "profile",
            aegis_resilience::DegradationConfig::default(),
            vec![Fallback::static_value("cached", ServiceLevel::Degraded, json!({"name": "cached"}))],
            orchestrator.events().clone(),
        ));

        #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
        struct Profile {
            name: String,
        }

        let options = ProtectionOptions::new().graceful_degradation("profile").circuit_breaker("ignored");
        let profile: Profile = orchestrator
            .execute_with_protection(|| async { Err(OperationError::http(503, "down").into()) }, &options)
            .await
            .unwrap();
        assert_eq!(profile, Profile { name: "cached".to_string() });
        assert!(orchestrator.circuit_breakers().get("ignored").is_none());

        let missing = ProtectionOptions::new().graceful_degradation("missing");
        let result: Result<Profile> =
            orchestrator.execute_with_protection(|| async { Ok(Profile { name: "x".into() }) }, &missing).await;
        assert!(matches!(result, Err(ResilienceError::NotRegistered { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degradation_returns_primary_value_untouched() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        let service = orchestrator.register_degradation_service(GracefulDegradationService::new(
            "pricing",
            aegis_resilience::DegradationConfig::default(),
            vec![Fallback::static_value("cached", ServiceLevel::Degraded, json!(1.0))],
            orchestrator.events().clone(),
        ));
        let options = ProtectionOptions::new().graceful_degradation("pricing");

        // Neither value can be represented in JSON.
        let nan: f64 = orchestrator.execute_with_protection(|| async { Ok(f64::NAN) }, &options).await.unwrap();
        assert!(nan.is_nan());
        let grid: std::collections::HashMap<(u8, u8), u8> = orchestrator
            .execute_with_protection(|| async { Ok([((1, 2), 3)].into_iter().collect()) }, &options)
            .await
            .unwrap();
        assert_eq!(grid.get(&(1, 2)), Some(&3));

        let status = service.status();
        assert_eq!(status.level, ServiceLevel::Full);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.active_fallback.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_fallback_leaves_counters_alone() {
        let orchestrator = SelfHealingOrchestrator::builder().build();
        let service = orchestrator.register_degradation_service(GracefulDegradationService::new(
            "pricing",
            aegis_resilience::DegradationConfig::default(),
            vec![Fallback::static_value("cached", ServiceLevel::Degraded, json!("not a number"))],
            orchestrator.events().clone(),
        ));
        service.force_service_level(ServiceLevel::Degraded, "maintenance");

        let options = ProtectionOptions::new().graceful_degradation("pricing");
        let result: Result<u32> = orchestrator.execute_with_protection(|| async { Ok(5) }, &options).await;

        assert!(matches!(result, Err(ResilienceError::Serialization(_))));
        let status = service.status();
        assert_eq!(status.level, ServiceLevel::Degraded);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.consecutive_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_listener_resyncs_from_component_state() {
        let orchestrator = SelfHealingOrchestrator::builder()
            .config(OrchestratorConfig { event_capacity: 4, ..Default::default() })
            .recovery_action(RecoveryAction::new(
                "reset-all",
                CONDITION_CIRCUIT_OPEN,
                RecoveryActionKind::ResetCircuit { circuit: None },
            ))
            .build();
        orchestrator.start();
        let circuit = orchestrator.register_circuit_breaker("search", CircuitBreakerConfig::default());

        // The listener has not run yet, so the open transition is pushed out
        // of the bus by the noise that follows it.
        circuit.force_open();
        for n in 0..16 {
            orchestrator.events().publish(ResilienceEvent::Alert {
                severity: aegis_resilience::AlertSeverity::Info,
                source: "test".to_string(),
                message: format!("noise {n}"),
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(orchestrator.recovery_report().total_dispatches, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_circuit_recovery_action() {
        let orchestrator = SelfHealingOrchestrator::builder()
            .recovery_action(RecoveryAction::new(
                "reset-all",
                CONDITION_CIRCUIT_OPEN,
                RecoveryActionKind::ResetCircuit { circuit: None },
            ))
            .build();
        let circuit = orchestrator.register_circuit_breaker("search", CircuitBreakerConfig::default());
        circuit.force_open();

        let records = orchestrator.trigger_condition(CONDITION_CIRCUIT_OPEN, 1.0).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_without_handler_fails_softly() {
        let orchestrator = SelfHealingOrchestrator::builder()
            .recovery_action(RecoveryAction::new(
                "restart-worker",
                CONDITION_HEALTH_CRITICAL,
                RecoveryActionKind::Restart { component: "worker".to_string() },
            ))
            .build();

        let records = orchestrator.trigger_condition(CONDITION_HEALTH_CRITICAL, 1.0).await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].error.as_deref().unwrap().contains("no recovery handler"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_metrics_feeds_history_and_autoscaler() {
        let orchestrator = SelfHealingOrchestrator::builder()
            .config(OrchestratorConfig { metrics_interval: Duration::from_secs(10), ..Default::default() })
            .build();
        let options = ProtectionOptions::new();
        let _: Result<()> = orchestrator
            .execute_with_protection(|| async { Err(OperationError::new("x").into()) }, &options)
            .await;
        let _: Result<()> = orchestrator.execute_with_protection(|| async { Ok(()) }, &options).await;

        let snapshot = orchestrator.collect_metrics().await;
        assert_eq!(snapshot.performance.requests, 2);
        assert!((snapshot.performance.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.performance.request_rate - 0.2).abs() < 1e-9);
        assert_eq!(orchestrator.autoscaler().metric_value("error_rate"), Some(0.5));
        assert_eq!(orchestrator.metrics_history().len(), 1);

        // The window was closed; totals carry over.
        let next = orchestrator.snapshot();
        assert_eq!(next.performance.requests, 0);
        assert_eq!(next.performance.totals.total, 2);
    }
}
