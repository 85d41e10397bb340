//! Circuit breaker pattern for dependency failure isolation.
//!
//! Each named dependency gets its own breaker:
//!
//! - `Closed`: calls pass through; failures inside the monitoring period are counted.
//! - `Open`: calls fail fast with [`ResilienceError::CircuitOpen`] until the reset timeout elapses.
//! - `HalfOpen`: exactly one trial call is let through; success closes, failure reopens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - normal operation.
    Closed,
    /// Circuit is open - rejecting calls until the reset timeout expires.
    Open,
    /// Circuit is half-open - testing recovery with one request.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_period` that open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed (default: 60 seconds).
    pub reset_timeout: Duration,
    /// Sliding window for counting failures (default: 60 seconds).
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the monitoring period.
    pub failure_count: u32,
    /// Successful trial calls since the circuit last opened.
    pub success_count: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

/// Mutable per-dependency record.
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    /// Timestamps of failures (sliding window).
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            trial_in_flight: false,
            opened_at: None,
            last_failure_time: None,
            last_state_change: Utc::now(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
        }
    }

    /// Removes failures outside the monitoring period.
    fn cleanup(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Moves to `to`, returning the transition if the state actually changed.
    fn transition(&mut self, to: CircuitState, now: Instant) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.last_state_change = Utc::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                self.opened_at = None;
                self.failures.clear();
                self.trial_in_flight = false;
            }
        }
        Some((from, to))
    }
}

/// Admission granted by the breaker for one call.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        // A trial that was cancelled mid-flight frees the slot for the next caller.
        if self.trial && !self.settled {
            let mut record = self.breaker.lock();
            if record.state == CircuitState::HalfOpen {
                record.trial_in_flight = false;
            }
        }
    }
}

/// Circuit breaker guarding one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    record: Mutex<CircuitRecord>,
    events: EventBus,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    ///
    /// # Arguments
    /// * `name` - Dependency name, used in errors and events
    /// * `config` - Thresholds and timeouts
    /// * `events` - Bus receiving state-change notifications
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self { name: name.into(), config, record: Mutex::new(CircuitRecord::new()), events }
    }

    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker settings.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, change: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = change {
            self.events.publish(ResilienceEvent::CircuitStateChanged {
                circuit: self.name.clone(),
                from,
                to,
            });
        }
    }

    /// Runs `operation` through the breaker.
    ///
    /// The operation is not invoked at all while the circuit is open. Its own
    /// error is always returned unchanged after bookkeeping.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        match &result {
            // Refusals from inner layers (bulkhead pressure, shutdown) are local
            // and never count against the dependency. Dropping the unsettled
            // permit frees a half-open trial slot.
            Err(err) if err.is_rejection() => {
                debug!(circuit = %self.name, error = %err, "Inner layer refused the call, not counted");
            }
            Ok(_) => {
                permit.settled = true;
                self.on_success(permit.trial);
            }
            Err(err) => {
                permit.settled = true;
                self.on_failure(permit.trial, err);
            }
        }
        result
    }

    fn acquire(&self) -> Result<CallPermit<'_>> {
        let now = Instant::now();
        let mut change = None;
        let admitted = {
            let mut record = self.lock();
            let admitted = match record.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    let elapsed = record.opened_at.map_or(Duration::MAX, |opened| now.duration_since(opened));
                    if elapsed >= self.config.reset_timeout {
                        change = record.transition(CircuitState::HalfOpen, now);
                        record.trial_in_flight = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if record.trial_in_flight {
                        None
                    } else {
                        record.trial_in_flight = true;
                        Some(true)
                    }
                }
            };
            if admitted.is_some() {
                record.total_calls += 1;
            } else {
                record.rejected_calls += 1;
            }
            admitted
        };

        if change.is_some() {
            info!(circuit = %self.name, "Circuit breaker: Open -> HalfOpen (reset timeout elapsed)");
        }
        self.announce(change);

        match admitted {
            Some(trial) => Ok(CallPermit { breaker: self, trial, settled: false }),
            None => {
                debug!(circuit = %self.name, "Circuit breaker rejected call");
                Err(ResilienceError::CircuitOpen { name: self.name.clone() })
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let now = Instant::now();
        let change = {
            let mut record = self.lock();
            record.successful_calls += 1;
            if trial && record.state == CircuitState::HalfOpen {
                record.half_open_successes += 1;
                record.transition(CircuitState::Closed, now)
            } else {
                None
            }
        };
        if change.is_some() {
            info!(circuit = %self.name, "Circuit breaker: HalfOpen -> Closed (recovery successful)");
        }
        self.announce(change);
    }

    fn on_failure(&self, trial: bool, err: &ResilienceError) {
        let now = Instant::now();
        let window = self.config.monitoring_period;
        let threshold = self.config.failure_threshold.max(1) as usize;
        let change = {
            let mut record = self.lock();
            record.failed_calls += 1;
            record.last_failure_time = Some(Utc::now());
            record.failures.push_back(now);
            record.cleanup(now, window);

            match record.state {
                CircuitState::HalfOpen if trial => {
                    record.trial_in_flight = false;
                    record.transition(CircuitState::Open, now)
                }
                CircuitState::Closed if record.failures.len() >= threshold => {
                    record.transition(CircuitState::Open, now)
                }
                _ => None,
            }
        };

        if let Some((from, _)) = change {
            warn!(
                circuit = %self.name,
                from = %from,
                threshold = threshold,
                error = %err,
                "Circuit breaker: -> Open"
            );
        }
        self.announce(change);
    }

    /// Current state.
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open`
    /// until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Forces the circuit closed and clears its failure window.
    pub fn reset(&self) {
        let change = self.lock().transition(CircuitState::Closed, Instant::now());
        if change.is_some() {
            info!(circuit = %self.name, "Circuit breaker manually reset");
        }
        self.announce(change);
    }

    /// Forces the circuit open, as if the threshold had just been reached.
    pub fn force_open(&self) {
        let change = {
            let mut record = self.lock();
            record.trial_in_flight = false;
            record.transition(CircuitState::Open, Instant::now())
        };
        if change.is_some() {
            warn!(circuit = %self.name, "Circuit breaker manually opened");
        }
        self.announce(change);
    }

    /// Returns a metrics snapshot.
    pub fn metrics(&self) -> CircuitMetrics {
        let mut record = self.lock();
        record.cleanup(Instant::now(), self.config.monitoring_period);
        CircuitMetrics {
            name: self.name.clone(),
            state: record.state,
            failure_count: record.failures.len() as u32,
            success_count: record.half_open_successes,
            total_calls: record.total_calls,
            successful_calls: record.successful_calls,
            failed_calls: record.failed_calls,
            rejected_calls: record.rejected_calls,
            last_failure_time: record.last_failure_time,
            last_state_change: record.last_state_change,
        }
    }
}

/// Registry of named circuit breakers sharing one event bus.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("circuit_count", &self.read().len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self { default_config, breakers: RwLock::new(HashMap::new()), events }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a breaker. An existing breaker with the same name is kept and returned.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(circuit = %name, "Registering circuit breaker");
            Arc::new(CircuitBreaker::new(name, config, self.events.clone()))
        });
        Arc::clone(breaker)
    }

    /// Looks up a breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    /// Looks up a breaker, creating it with the default settings if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        self.register(name, self.default_config.clone())
    }

    /// Resets one breaker to closed.
    pub fn reset(&self, name: &str) -> Result<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| ResilienceError::NotRegistered { kind: "circuit breaker", name: name.to_string() })?;
        breaker.reset();
        Ok(())
    }

    /// Resets every breaker that is not closed. Returns the names that were reset.
    pub fn reset_open(&self) -> Vec<String> {
        let mut reset = Vec::new();
        for breaker in self.all() {
            if breaker.state() != CircuitState::Closed {
                breaker.reset();
                reset.push(breaker.name().to_string());
            }
        }
        reset
    }

    /// All registered breakers, sorted by name.
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut breakers: Vec<_> = self.read().values().cloned().collect();
        breakers.sort_by(|a, b| a.name().cmp(b.name()));
        breakers
    }

    /// Metrics for every breaker, sorted by name.
    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        self.all().iter().map(|breaker| breaker.metrics()).collect()
    }
}
