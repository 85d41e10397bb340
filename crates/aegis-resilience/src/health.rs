//! Periodic health checks and system-wide health aggregation.
//!
//! Every registered check runs on its own [`PeriodicTask`]. Results feed
//! per-check counters and a bounded history; the aggregate status is the worst
//! last-known status among all registered checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{AlertSeverity, EventBus, ResilienceEvent};
use crate::schedule::PeriodicTask;

/// Health of a check or of the whole system. Later variants are worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome reported by a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthReport {
    #[must_use]
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message.into()) }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()) }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Critical, message: Some(message.into()) }
    }
}

/// A health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probes the component. An error counts as a failed check.
    async fn check(&self) -> Result<HealthReport>;
}

struct FnHealthCheck<F> {
    probe: F,
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HealthReport>> + Send + 'static,
{
    async fn check(&self) -> Result<HealthReport> {
        (self.probe)().await
    }
}

/// Adapts an async closure into a [`HealthCheck`].
pub fn health_check_fn<F, Fut>(probe: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HealthReport>> + Send + 'static,
{
    Arc::new(FnHealthCheck { probe })
}

/// A registered probe and its schedule.
#[derive(Clone)]
pub struct HealthCheckSpec {
    pub name: String,
    pub check: Arc<dyn HealthCheck>,
    /// Delay between the end of one run and the start of the next (default: 30s).
    pub interval: Duration,
    /// Deadline of a single run (default: 5s).
    pub timeout: Duration,
    /// Failures of critical checks count as `Critical` instead of `Unhealthy`.
    pub critical: bool,
}

impl fmt::Debug for HealthCheckSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckSpec")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

impl HealthCheckSpec {
    pub fn new(name: impl Into<String>, check: Arc<dyn HealthCheck>) -> Self {
        Self {
            name: name.into(),
            check,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            critical: false,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

/// One probe outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-check view inside [`SystemHealth`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub critical: bool,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last: Option<HealthCheckResult>,
}

/// Aggregate health of all registered checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub checks: Vec<CheckSummary>,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub critical: usize,
    pub timestamp: DateTime<Utc>,
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Results kept per check (default: 100).
    pub history_size: usize,
    /// Consecutive failures that raise an alert (default: 3).
    pub alert_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self { history_size: 100, alert_threshold: 3 }
    }
}

struct CheckState {
    spec: HealthCheckSpec,
    generation: u64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    history: VecDeque<HealthCheckResult>,
}

impl CheckState {
    fn last(&self) -> Option<&HealthCheckResult> {
        self.history.back()
    }
}

struct MonitorState {
    checks: HashMap<String, CheckState>,
    aggregate: HealthStatus,
    next_generation: u64,
}

impl MonitorState {
    fn worst(&self) -> HealthStatus {
        self.checks
            .values()
            .filter_map(|check| check.last().map(|result| result.status))
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}

struct MonitorInner {
    config: HealthMonitorConfig,
    state: Mutex<MonitorState>,
    events: EventBus,
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_check(&self, name: &str) -> Result<HealthCheckResult> {
        let (check, timeout, critical, generation) = {
            let state = self.lock();
            let entry = state
                .checks
                .get(name)
                .ok_or_else(|| ResilienceError::NotRegistered { kind: "health check", name: name.to_string() })?;
            (Arc::clone(&entry.spec.check), entry.spec.timeout, entry.spec.critical, entry.generation)
        };

        let failure_status = if critical { HealthStatus::Critical } else { HealthStatus::Unhealthy };
        let started = Instant::now();
        let (status, message) = match tokio::time::timeout(timeout, check.check()).await {
            Ok(Ok(report)) => (report.status, report.message),
            Ok(Err(err)) => (failure_status, Some(err.to_string())),
            Err(_) => (failure_status, Some(format!("health check timed out after {:?}", timeout))),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = HealthCheckResult { name: name.to_string(), status, message, duration_ms, timestamp: Utc::now() };
        self.record(&result, generation);
        Ok(result)
    }

    fn record(&self, result: &HealthCheckResult, generation: u64) {
        let mut alert = None;
        let transition = {
            let mut state = self.lock();
            let Some(entry) = state.checks.get_mut(&result.name).filter(|entry| entry.generation == generation) else {
                debug!(check = %result.name, "Discarding result of unregistered health check");
                return;
            };

            if result.status == HealthStatus::Healthy {
                entry.consecutive_successes += 1;
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
                if entry.consecutive_failures == self.config.alert_threshold.max(1) {
                    alert = Some(entry.consecutive_failures);
                }
            }
            entry.history.push_back(result.clone());
            while entry.history.len() > self.config.history_size.max(1) {
                entry.history.pop_front();
            }

            let from = state.aggregate;
            let to = state.worst();
            state.aggregate = to;
            (from != to).then_some((from, to))
        };

        debug!(check = %result.name, status = %result.status, duration_ms = result.duration_ms, "Health check completed");
        self.events.publish(ResilienceEvent::HealthCheckCompleted {
            check: result.name.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });

        if let Some(failures) = alert {
            let severity =
                if result.status == HealthStatus::Critical { AlertSeverity::Critical } else { AlertSeverity::Warning };
            error!(check = %result.name, failures = failures, "Health check failing repeatedly");
            self.events.publish(ResilienceEvent::Alert {
                severity,
                source: format!("health:{}", result.name),
                message: format!(
                    "{} consecutive failures: {}",
                    failures,
                    result.message.as_deref().unwrap_or("no message")
                ),
            });
        }

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn recompute(&self) {
        let transition = {
            let mut state = self.lock();
            let from = state.aggregate;
            let to = state.worst();
            state.aggregate = to;
            (from != to).then_some((from, to))
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: HealthStatus, to: HealthStatus) {
        if to > from {
            warn!(from = %from, to = %to, "System health worsened");
        } else {
            info!(from = %from, to = %to, "System health improved");
        }
        self.events.publish(ResilienceEvent::HealthStatusChanged { from, to });
        if to == HealthStatus::Healthy {
            self.events.publish(ResilienceEvent::HealthRecovered { from });
        }
    }
}

/// Scheduler and aggregator of health checks.
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    tasks: Mutex<HashMap<String, PeriodicTask>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.inner.config)
            .field("checks", &self.check_names())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthMonitorConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                state: Mutex::new(MonitorState {
                    checks: HashMap::new(),
                    aggregate: HealthStatus::Healthy,
                    next_generation: 0,
                }),
                events,
            }),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, PeriodicTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a check and schedules it, running it once right away.
    ///
    /// Replaces any check with the same name. Must be called from within a
    /// tokio runtime.
    pub fn register(&self, spec: HealthCheckSpec) {
        let name = spec.name.clone();
        let interval = spec.interval;
        {
            let mut state = self.inner.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.checks.insert(
                name.clone(),
                CheckState {
                    spec,
                    generation,
                    consecutive_successes: 0,
                    consecutive_failures: 0,
                    history: VecDeque::new(),
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        let task_name = name.clone();
        let mut task = PeriodicTask::new(format!("health:{}", name), interval, move || {
            let inner = Arc::clone(&inner);
            let name = task_name.clone();
            async move {
                if let Err(err) = inner.run_check(&name).await {
                    debug!(check = %name, error = %err, "Scheduled health check skipped");
                }
            }
        })
        .run_immediately(true);
        task.start();

        if let Some(mut previous) = self.tasks().insert(name.clone(), task) {
            previous.stop();
        }
        info!(check = %name, interval_ms = interval.as_millis() as u64, "Registered health check");
        self.inner.recompute();
    }

    /// Cancels a check and drops it from aggregation. Returns `false` if unknown.
    pub fn unregister(&self, name: &str) -> bool {
        if let Some(mut task) = self.tasks().remove(name) {
            task.stop();
        }
        let removed = self.inner.lock().checks.remove(name).is_some();
        if removed {
            info!(check = %name, "Unregistered health check");
            self.inner.recompute();
        }
        removed
    }

    /// Runs a check now, outside its schedule.
    pub async fn run_check(&self, name: &str) -> Result<HealthCheckResult> {
        self.inner.run_check(name).await
    }

    /// Current aggregate status.
    pub fn status(&self) -> HealthStatus {
        self.inner.lock().aggregate
    }

    /// Aggregate status with per-check details, sorted by check name.
    pub fn system_health(&self) -> SystemHealth {
        let state = self.inner.lock();
        let mut checks: Vec<CheckSummary> = state
            .checks
            .values()
            .map(|entry| CheckSummary {
                name: entry.spec.name.clone(),
                critical: entry.spec.critical,
                consecutive_successes: entry.consecutive_successes,
                consecutive_failures: entry.consecutive_failures,
                last: entry.last().cloned(),
            })
            .collect();
        checks.sort_by(|a, b| a.name.cmp(&b.name));

        let count = |status: HealthStatus| {
            checks.iter().filter(|c| c.last.as_ref().is_some_and(|r| r.status == status)).count()
        };
        SystemHealth {
            status: state.worst(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            critical: count(HealthStatus::Critical),
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Recorded results of one check, oldest first.
    pub fn history(&self, name: &str) -> Option<Vec<HealthCheckResult>> {
        self.inner.lock().checks.get(name).map(|entry| entry.history.iter().cloned().collect())
    }

    pub fn check_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().checks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancels every scheduled check.
    pub fn shutdown(&self) {
        for (_, mut task) in self.tasks().drain() {
            task.stop();
        }
        debug!("Health monitor stopped");
    }
}
