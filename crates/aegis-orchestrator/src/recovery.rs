//! Recovery-action engine.
//!
//! A [`RecoveryAction`] is keyed by a condition name. Every time the
//! orchestrator signals that condition, the engine decides which actions are
//! due, taking thresholds, sustained durations, cooldowns and attempt budgets
//! into account. The engine only plans; the orchestrator performs the action
//! and reports the outcome back through [`RecoveryEngine::complete`].
//!
//! Attempt counters reset once a full cooldown window passes without the
//! condition being signalled, or when an operator calls
//! [`RecoveryEngine::reset_attempts`]. Actions with a zero cooldown only reset
//! through the operator call.

use aegis_resilience::{EventBus, HealthStatus, ResilienceError, ResilienceEvent, ScaleDirection, ServiceLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default number of recovery records kept.
pub const DEFAULT_RECOVERY_HISTORY: usize = 1000;

/// What a recovery action does when dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryActionKind {
    /// Restart a component through the installed recovery handler.
    Restart { component: String },
    /// Adjust the instance count through the autoscaler.
    Scale { direction: ScaleDirection, amount: u32 },
    /// Force a degradation service to a level.
    Degrade { service: String, level: ServiceLevel },
    /// Reset one circuit, or every open circuit when `circuit` is absent.
    ResetCircuit {
        #[serde(default)]
        circuit: Option<String>,
    },
    /// Run a named action through the installed recovery handler.
    Custom { name: String },
}

/// A conditional remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: String,
    /// Condition name that triggers the action.
    pub condition: String,
    /// Minimum signalled value; without one any positive value triggers.
    pub threshold: Option<f64>,
    /// How long the condition must keep being signalled before dispatch.
    pub sustained_for: Duration,
    pub kind: RecoveryActionKind,
    /// Minimum time between dispatches (default: 5 minutes).
    pub cooldown: Duration,
    /// Dispatches allowed per window (default: 3).
    pub max_attempts: u32,
}

impl RecoveryAction {
    pub fn new(id: impl Into<String>, condition: impl Into<String>, kind: RecoveryActionKind) -> Self {
        Self {
            id: id.into(),
            condition: condition.into(),
            threshold: None,
            sustained_for: Duration::ZERO,
            kind,
            cooldown: Duration::from_secs(300),
            max_attempts: 3,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn sustained_for(mut self, duration: Duration) -> Self {
        self.sustained_for = duration;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn is_satisfied_by(&self, value: f64) -> bool {
        match self.threshold {
            Some(threshold) => value >= threshold,
            None => value > 0.0,
        }
    }
}

/// Performs `Restart` and `Custom` actions.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn handle(&self, action: &RecoveryAction, trigger: &str) -> aegis_resilience::Result<()>;
}

/// An action the engine decided to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRecovery {
    pub action: RecoveryAction,
    pub trigger: String,
    /// 1-indexed attempt within the current window.
    pub attempt: u32,
}

/// One recovery dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: Uuid,
    pub action: String,
    pub trigger: String,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Runtime view of one registered action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub id: String,
    pub condition: String,
    pub kind: RecoveryActionKind,
    pub attempts: u32,
    pub max_attempts: u32,
    pub exhausted: bool,
}

/// Per-action dispatch statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub id: String,
    pub dispatches: usize,
    pub successes: usize,
    pub success_rate: f64,
}

/// Summary of the recovery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub total_dispatches: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    /// Healthy above 80% success, degraded above 50%, critical otherwise.
    pub status: HealthStatus,
    pub actions: Vec<ActionReport>,
    pub registered: Vec<ActionStatus>,
}

#[derive(Debug)]
struct ActionState {
    action: RecoveryAction,
    attempts: u32,
    satisfied_since: Option<Instant>,
    last_signal: Option<Instant>,
    last_dispatch: Option<Instant>,
    exhausted_notified: bool,
}

impl ActionState {
    fn new(action: RecoveryAction) -> Self {
        Self {
            action,
            attempts: 0,
            satisfied_since: None,
            last_signal: None,
            last_dispatch: None,
            exhausted_notified: false,
        }
    }

    fn status(&self) -> ActionStatus {
        ActionStatus {
            id: self.action.id.clone(),
            condition: self.action.condition.clone(),
            kind: self.action.kind.clone(),
            attempts: self.attempts,
            max_attempts: self.action.max_attempts,
            exhausted: self.attempts >= self.action.max_attempts.max(1),
        }
    }
}

#[derive(Debug)]
struct EngineState {
    enabled: bool,
    actions: Vec<ActionState>,
    history: VecDeque<RecoveryRecord>,
}

/// Decides when recovery actions run and keeps their history.
#[derive(Debug)]
pub struct RecoveryEngine {
    state: Mutex<EngineState>,
    history_limit: usize,
    events: EventBus,
}

impl RecoveryEngine {
    /// Creates an enabled engine with no actions.
    #[must_use]
    pub fn new(history_limit: usize, events: EventBus) -> Self {
        Self {
            state: Mutex::new(EngineState { enabled: true, actions: Vec::new(), history: VecDeque::new() }),
            history_limit: history_limit.max(1),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an action, replacing any action with the same id.
    pub fn register(&self, action: RecoveryAction) {
        info!(action = %action.id, condition = %action.condition, "Registered recovery action");
        let mut state = self.lock();
        if let Some(existing) = state.actions.iter_mut().find(|s| s.action.id == action.id) {
            *existing = ActionState::new(action);
        } else {
            state.actions.push(ActionState::new(action));
        }
    }

    /// Removes an action. Returns `false` if unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.actions.len();
        state.actions.retain(|s| s.action.id != id);
        state.actions.len() != before
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Clears the attempt counter of one action. Returns `false` if unknown.
    pub fn reset_attempts(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.actions.iter_mut().find(|s| s.action.id == id) else {
            return false;
        };
        entry.attempts = 0;
        entry.exhausted_notified = false;
        entry.last_dispatch = None;
        info!(action = %id, "Recovery action attempts reset");
        true
    }

    /// Decides which actions `condition` dispatches now.
    ///
    /// Exhausted actions publish [`ResilienceEvent::RecoveryActionExhausted`]
    /// once per window instead of being planned.
    pub fn plan(&self, condition: &str, value: f64) -> Vec<PlannedRecovery> {
        let now = Instant::now();
        let mut planned = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut state = self.lock();
            if !state.enabled {
                return planned;
            }
            for entry in state.actions.iter_mut().filter(|s| s.action.condition == condition) {
                if !entry.action.is_satisfied_by(value) {
                    entry.satisfied_since = None;
                    continue;
                }

                let quiet_window = !entry.action.cooldown.is_zero()
                    && entry.last_signal.is_some_and(|last| now.duration_since(last) >= entry.action.cooldown);
                if quiet_window && entry.attempts > 0 {
                    debug!(action = %entry.action.id, "Recovery attempt window elapsed, resetting attempts");
                    entry.attempts = 0;
                    entry.exhausted_notified = false;
                }
                entry.last_signal = Some(now);

                let since = *entry.satisfied_since.get_or_insert(now);
                if now.duration_since(since) < entry.action.sustained_for {
                    continue;
                }

                if entry.attempts >= entry.action.max_attempts.max(1) {
                    if !entry.exhausted_notified {
                        entry.exhausted_notified = true;
                        exhausted.push((entry.action.id.clone(), entry.attempts));
                    }
                    continue;
                }

                if entry.last_dispatch.is_some_and(|last| now.duration_since(last) < entry.action.cooldown) {
                    debug!(action = %entry.action.id, condition = condition, "Recovery action in cooldown");
                    continue;
                }

                entry.attempts += 1;
                entry.last_dispatch = Some(now);
                planned.push(PlannedRecovery {
                    action: entry.action.clone(),
                    trigger: condition.to_string(),
                    attempt: entry.attempts,
                });
            }
        }

        for (action, attempts) in exhausted {
            warn!(action = %action, condition = condition, attempts = attempts, "Recovery action exhausted");
            self.events.publish(ResilienceEvent::RecoveryActionExhausted {
                action,
                trigger: condition.to_string(),
                attempts,
            });
        }
        planned
    }

    /// Records the outcome of a planned dispatch.
    pub fn complete(
        &self,
        planned: &PlannedRecovery,
        outcome: &aegis_resilience::Result<()>,
        duration: Duration,
    ) -> RecoveryRecord {
        let error = outcome.as_ref().err().map(|err| match err {
            ResilienceError::RecoveryAction { .. } => err.to_string(),
            other => ResilienceError::RecoveryAction { action: planned.action.id.clone(), reason: other.to_string() }
                .to_string(),
        });
        let record = RecoveryRecord {
            id: Uuid::new_v4(),
            action: planned.action.id.clone(),
            trigger: planned.trigger.clone(),
            attempt: planned.attempt,
            success: error.is_none(),
            error,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        };

        match &record.error {
            None => info!(
                action = %record.action,
                trigger = %record.trigger,
                attempt = record.attempt,
                "Recovery action succeeded"
            ),
            Some(reason) => error!(
                action = %record.action,
                trigger = %record.trigger,
                attempt = record.attempt,
                error = %reason,
                "Recovery action failed"
            ),
        }

        self.events.publish(ResilienceEvent::RecoveryActionDispatched {
            action: record.action.clone(),
            trigger: record.trigger.clone(),
            attempt: record.attempt,
            success: record.success,
        });
        if let Some(reason) = &record.error {
            self.events.publish(ResilienceEvent::RecoveryActionFailed {
                action: record.action.clone(),
                trigger: record.trigger.clone(),
                error: reason.clone(),
            });
        }

        let mut state = self.lock();
        state.history.push_back(record.clone());
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        record
    }

    /// Registered actions with their counters.
    pub fn actions(&self) -> Vec<ActionStatus> {
        self.lock().actions.iter().map(ActionState::status).collect()
    }

    /// Most recent records, newest last. `limit` of `None` returns everything.
    pub fn history(&self, limit: Option<usize>) -> Vec<RecoveryRecord> {
        let state = self.lock();
        let skip = limit.map_or(0, |limit| state.history.len().saturating_sub(limit));
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Success statistics over the recorded history.
    pub fn report(&self) -> RecoveryReport {
        let state = self.lock();
        let total = state.history.len();
        let successes = state.history.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 { 1.0 } else { successes as f64 / total as f64 };
        let status = if total == 0 || success_rate > 0.8 {
            HealthStatus::Healthy
        } else if success_rate > 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };

        let mut ids: Vec<&str> = state.history.iter().map(|r| r.action.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        let actions = ids
            .into_iter()
            .map(|id| {
                let dispatches = state.history.iter().filter(|r| r.action == id).count();
                let successes = state.history.iter().filter(|r| r.action == id && r.success).count();
                ActionReport {
                    id: id.to_string(),
                    dispatches,
                    successes,
                    success_rate: successes as f64 / dispatches as f64,
                }
            })
            .collect();

        RecoveryReport {
            total_dispatches: total,
            successes,
            failures: total - successes,
            success_rate,
            status,
            actions,
            registered: state.actions.iter().map(ActionState::status).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_resilience::OperationError;

    fn reset_action() -> RecoveryAction {
        RecoveryAction::new(
            "reset-circuits",
            "circuit_breaker_open",
            RecoveryActionKind::ResetCircuit { circuit: None },
        )
        .with_cooldown(Duration::from_secs(60))
        .with_max_attempts(2)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ResilienceEvent>) -> Vec<ResilienceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_dispatches() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        engine.register(reset_action());

        assert_eq!(engine.plan("circuit_breaker_open", 1.0).len(), 1);
        assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let planned = engine.plan("circuit_breaker_open", 1.0);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_notified_once_per_window() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let engine = RecoveryEngine::new(10, events);
        engine.register(reset_action().with_max_attempts(1));

        assert_eq!(engine.plan("circuit_breaker_open", 1.0).len(), 1);
        for _ in 0..3 {
            assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());
        }
        let exhausted = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ResilienceEvent::RecoveryActionExhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);
        assert!(engine.actions()[0].exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_window_resets_attempts() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        engine.register(reset_action().with_max_attempts(1));

        assert_eq!(engine.plan("circuit_breaker_open", 1.0).len(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());

        // No signal for a whole cooldown window.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let planned = engine.plan("circuit_breaker_open", 1.0);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_reset() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        engine.register(reset_action().with_max_attempts(1).with_cooldown(Duration::ZERO));
        assert_eq!(engine.plan("circuit_breaker_open", 1.0).len(), 1);
        assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());

        assert!(engine.reset_attempts("reset-circuits"));
        assert_eq!(engine.plan("circuit_breaker_open", 1.0).len(), 1);
        assert!(!engine.reset_attempts("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_and_sustained_duration() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        engine.register(
            RecoveryAction::new(
                "scale-on-errors",
                "error_rate",
                RecoveryActionKind::Scale { direction: ScaleDirection::Up, amount: 1 },
            )
            .with_threshold(0.5)
            .sustained_for(Duration::from_secs(120)),
        );

        assert!(engine.plan("error_rate", 0.7).is_empty());
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Dropping below the threshold clears the sustained clock.
        assert!(engine.plan("error_rate", 0.1).is_empty());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(engine.plan("error_rate", 0.9).is_empty());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.plan("error_rate", 0.9).len(), 1);
        assert!(engine.plan("other_condition", 0.9).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_engine_plans_nothing() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        engine.register(reset_action());
        engine.set_enabled(false);
        assert!(engine.plan("circuit_breaker_open", 1.0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_status_from_success_rate() {
        let engine = RecoveryEngine::new(10, EventBus::new());
        assert_eq!(engine.report().status, HealthStatus::Healthy);

        engine.register(reset_action().with_cooldown(Duration::ZERO).with_max_attempts(10));
        let ok: aegis_resilience::Result<()> = Ok(());
        let failed: aegis_resilience::Result<()> = Err(OperationError::new("restart refused").into());
        for outcome in [&ok, &failed, &failed] {
            let planned = engine.plan("circuit_breaker_open", 1.0).remove(0);
            engine.complete(&planned, outcome, Duration::from_millis(5));
        }

        let report = engine.report();
        assert_eq!(report.total_dispatches, 3);
        assert_eq!(report.successes, 1);
        assert_eq!(report.status, HealthStatus::Critical);
        assert_eq!(report.actions[0].dispatches, 3);
        assert_eq!(engine.history(Some(2)).len(), 2);
        assert!(engine.history(None)[1].error.as_deref().unwrap().contains("restart refused"));
    }

    #[test]
    fn test_action_kind_serialization() {
        let kind: RecoveryActionKind =
            serde_json::from_str(r#"{"kind":"scale","direction":"up","amount":2}"#).unwrap();
        assert_eq!(kind, RecoveryActionKind::Scale { direction: ScaleDirection::Up, amount: 2 });
        let kind: RecoveryActionKind = serde_json::from_str(r#"{"kind":"reset_circuit"}"#).unwrap();
        assert_eq!(kind, RecoveryActionKind::ResetCircuit { circuit: None });
    }
}
