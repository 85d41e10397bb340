//! Metric-driven autoscaling decisions.
//!
//! The autoscaler never touches infrastructure itself. It keeps time-windowed
//! metric series, evaluates [`ScalingRule`]s against them and hands the
//! resulting instance count to an injected [`ScalingHandler`]. The new count is
//! committed only when the handler succeeds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};
use crate::schedule::PeriodicTask;

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Comparison between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl Comparator {
    /// Applies the comparison `value <op> threshold`.
    #[must_use]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
        }
    }
}

/// How a rule reduces a metric series to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricAggregation {
    /// Most recent sample.
    #[default]
    Latest,
    /// Mean of the samples in the window.
    Average,
    /// Largest sample in the window.
    Max,
}

/// A threshold-triggered scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    /// Rule identifier, unique per autoscaler.
    pub id: String,
    /// Metric the rule watches.
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    /// How long the condition must hold before the rule fires.
    pub duration: Duration,
    pub direction: ScaleDirection,
    /// Instances added or removed when the rule fires.
    pub amount: u32,
    pub aggregation: MetricAggregation,
    /// Overrides the per-direction cooldown of the autoscaler.
    pub cooldown: Option<Duration>,
}

impl ScalingRule {
    /// Creates a rule that fires immediately and moves one instance.
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
        direction: ScaleDirection,
    ) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            comparator,
            threshold,
            duration: Duration::ZERO,
            direction,
            amount: 1,
            aggregation: MetricAggregation::Latest,
            cooldown: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_amount(mut self, amount: u32) -> Self {
        self.amount = amount;
        self
    }

    #[must_use]
    pub fn with_aggregation(mut self, aggregation: MetricAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }
}

/// Autoscaler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalerConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Starting instance count, clamped into `[min_instances, max_instances]`.
    pub initial_instances: u32,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub evaluation_interval: Duration,
    /// Retention of metric samples.
    pub metric_window: Duration,
    pub max_decision_history: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            initial_instances: 1,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(30),
            metric_window: Duration::from_secs(300),
            max_decision_history: 100,
        }
    }
}

impl AutoScalerConfig {
    fn clamp(&self, instances: u32) -> u32 {
        instances.clamp(self.min_instances, self.max_instances.max(self.min_instances))
    }

    fn cooldown(&self, direction: ScaleDirection) -> Duration {
        match direction {
            ScaleDirection::Up => self.scale_up_cooldown,
            ScaleDirection::Down => self.scale_down_cooldown,
        }
    }
}

/// Performs the actual infrastructure change.
#[async_trait]
pub trait ScalingHandler: Send + Sync {
    /// Moves the deployment from `from` to `to` instances.
    async fn scale(&self, from: u32, to: u32) -> Result<()>;
}

/// One committed or failed scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub from: u32,
    pub to: u32,
    pub direction: ScaleDirection,
    /// Rule id, or `forced: <reason>` for operator actions.
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ScalerState {
    instances: u32,
    rules: Vec<ScalingRule>,
    series: HashMap<String, VecDeque<(Instant, f64)>>,
    pending: HashMap<String, Instant>,
    last_scaled: HashMap<ScaleDirection, Instant>,
    decisions: VecDeque<ScalingDecision>,
}

impl ScalerState {
    fn prune(&mut self, window: Duration, now: Instant) {
        for samples in self.series.values_mut() {
            while samples.front().is_some_and(|(at, _)| now.duration_since(*at) > window) {
                samples.pop_front();
            }
        }
    }

    fn value(&self, metric: &str, aggregation: MetricAggregation) -> Option<f64> {
        let samples = self.series.get(metric).filter(|s| !s.is_empty())?;
        match aggregation {
            MetricAggregation::Latest => samples.back().map(|(_, v)| *v),
            #[allow(clippy::cast_precision_loss)]
            MetricAggregation::Average => Some(samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64),
            MetricAggregation::Max => samples.iter().map(|(_, v)| *v).reduce(f64::max),
        }
    }

    fn cooling_down(&self, direction: ScaleDirection, cooldown: Duration, now: Instant) -> bool {
        self.last_scaled.get(&direction).is_some_and(|at| now.duration_since(*at) < cooldown)
    }
}

struct ScalerInner {
    config: AutoScalerConfig,
    state: Mutex<ScalerState>,
    // Serializes scaling actions across ticks and forced calls.
    scale_lock: tokio::sync::Mutex<()>,
    handler: RwLock<Option<Arc<dyn ScalingHandler>>>,
    events: EventBus,
}

struct Candidate {
    rule_id: String,
    direction: ScaleDirection,
    target: u32,
}

impl ScalerInner {
    fn lock(&self) -> MutexGuard<'_, ScalerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn ScalingHandler>> {
        self.handler.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn select_candidate(&self, now: Instant) -> Option<Candidate> {
        let mut state = self.lock();
        state.prune(self.config.metric_window, now);

        let mut selected = None;
        let rules = state.rules.clone();
        for rule in &rules {
            let holds = state
                .value(&rule.metric, rule.aggregation)
                .is_some_and(|value| rule.comparator.holds(value, rule.threshold));
            if !holds {
                state.pending.remove(&rule.id);
                continue;
            }
            let since = *state.pending.entry(rule.id.clone()).or_insert(now);
            if selected.is_some() || now.duration_since(since) < rule.duration {
                continue;
            }
            let cooldown = rule.cooldown.unwrap_or_else(|| self.config.cooldown(rule.direction));
            if state.cooling_down(rule.direction, cooldown, now) {
                debug!(rule = %rule.id, direction = %rule.direction, "Scaling rule in cooldown");
                continue;
            }
            let current = state.instances;
            let target = match rule.direction {
                ScaleDirection::Up => self.config.clamp(current.saturating_add(rule.amount)),
                ScaleDirection::Down => self.config.clamp(current.saturating_sub(rule.amount)),
            };
            if target == current {
                continue;
            }
            selected = Some(Candidate { rule_id: rule.id.clone(), direction: rule.direction, target });
        }
        selected
    }

    /// Runs the handler and commits `to` on success. Caller holds `scale_lock`.
    async fn apply(&self, to: u32, direction: ScaleDirection, reason: String, rule_id: Option<&str>) -> Result<u32> {
        let from = self.lock().instances;
        let outcome = match self.handler() {
            Some(handler) => handler.scale(from, to).await,
            None => Ok(()),
        };

        let mut state = self.lock();
        let decision = match outcome {
            Ok(()) => {
                state.instances = to;
                state.last_scaled.insert(direction, Instant::now());
                if let Some(rule_id) = rule_id {
                    state.pending.remove(rule_id);
                }
                info!(from = from, to = to, direction = %direction, reason = %reason, "Scaled instances");
                self.events.publish(ResilienceEvent::Scaled { from, to, direction, reason: reason.clone() });
                ScalingDecision {
                    from,
                    to,
                    direction,
                    reason: reason.clone(),
                    success: true,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(err) => {
                warn!(from = from, to = to, reason = %reason, error = %err, "Scaling callback failed");
                self.events.publish(ResilienceEvent::ScalingFailed { from, to, error: err.to_string() });
                ScalingDecision {
                    from,
                    to,
                    direction,
                    reason: reason.clone(),
                    success: false,
                    error: Some(err.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };
        let success = decision.success;
        state.decisions.push_back(decision);
        while state.decisions.len() > self.config.max_decision_history.max(1) {
            state.decisions.pop_front();
        }
        drop(state);

        if success {
            Ok(to)
        } else {
            Err(ResilienceError::ScalingCallback { from, to, reason })
        }
    }

    async fn evaluate(&self) -> Option<ScalingDecision> {
        let _serial = self.scale_lock.lock().await;
        let candidate = self.select_candidate(Instant::now())?;
        let reason = format!("rule:{}", candidate.rule_id);
        // Failures are reported through events and the decision history.
        let _ = self.apply(candidate.target, candidate.direction, reason, Some(&candidate.rule_id)).await;
        self.lock().decisions.back().cloned()
    }
}

/// Rule-driven instance count manager.
pub struct AutoScaler {
    inner: Arc<ScalerInner>,
    task: Mutex<Option<PeriodicTask>>,
}

impl fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoScaler")
            .field("config", &self.inner.config)
            .field("instances", &self.instances())
            .field("has_handler", &self.inner.handler().is_some())
            .finish_non_exhaustive()
    }
}

impl AutoScaler {
    /// Creates an autoscaler without a scaling handler.
    ///
    /// # Arguments
    /// * `config` - Bounds, cooldowns and windows
    /// * `rules` - Scaling rules, evaluated in declaration order
    /// * `events` - Bus receiving scaling notifications
    #[must_use]
    pub fn new(config: AutoScalerConfig, rules: Vec<ScalingRule>, events: EventBus) -> Self {
        let instances = config.clamp(config.initial_instances);
        Self {
            inner: Arc::new(ScalerInner {
                state: Mutex::new(ScalerState {
                    instances,
                    rules,
                    series: HashMap::new(),
                    pending: HashMap::new(),
                    last_scaled: HashMap::new(),
                    decisions: VecDeque::new(),
                }),
                config,
                scale_lock: tokio::sync::Mutex::new(()),
                handler: RwLock::new(None),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Installs the handler that performs the infrastructure change.
    #[must_use]
    pub fn with_handler(self, handler: Arc<dyn ScalingHandler>) -> Self {
        self.set_handler(handler);
        self
    }

    /// Replaces the scaling handler. Takes effect from the next scaling action,
    /// including on a started autoscaler.
    pub fn set_handler(&self, handler: Arc<dyn ScalingHandler>) {
        *self.inner.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.inner.config
    }

    /// Committed instance count.
    pub fn instances(&self) -> u32 {
        self.inner.lock().instances
    }

    /// Records an observation of `metric`.
    pub fn record_metric(&self, metric: &str, value: f64) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.series.entry(metric.to_string()).or_default().push_back((now, value));
        state.prune(self.inner.config.metric_window, now);
    }

    /// Latest in-window value of `metric`.
    pub fn metric_value(&self, metric: &str) -> Option<f64> {
        let mut state = self.inner.lock();
        state.prune(self.inner.config.metric_window, Instant::now());
        state.value(metric, MetricAggregation::Latest)
    }

    /// Adds a rule, replacing any rule with the same id.
    pub fn add_rule(&self, rule: ScalingRule) {
        let mut state = self.inner.lock();
        state.pending.remove(&rule.id);
        if let Some(existing) = state.rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            state.rules.push(rule);
        }
    }

    /// Removes a rule. Returns `false` if it did not exist.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        state.pending.remove(id);
        let before = state.rules.len();
        state.rules.retain(|rule| rule.id != id);
        state.rules.len() != before
    }

    pub fn rules(&self) -> Vec<ScalingRule> {
        self.inner.lock().rules.clone()
    }

    /// Scaling decisions, oldest first.
    pub fn decisions(&self) -> Vec<ScalingDecision> {
        self.inner.lock().decisions.iter().cloned().collect()
    }

    /// Runs one evaluation pass. Returns the decision taken, if any.
    pub async fn evaluate(&self) -> Option<ScalingDecision> {
        self.inner.evaluate().await
    }

    /// Adjusts the instance count outside the rule engine, with the same clamping.
    ///
    /// Returns the committed count. A clamped no-op returns the current count
    /// without calling the handler.
    pub async fn force_scale(&self, direction: ScaleDirection, amount: u32, reason: &str) -> Result<u32> {
        let _serial = self.inner.scale_lock.lock().await;
        let current = self.instances();
        let target = match direction {
            ScaleDirection::Up => self.inner.config.clamp(current.saturating_add(amount)),
            ScaleDirection::Down => self.inner.config.clamp(current.saturating_sub(amount)),
        };
        if target == current {
            debug!(instances = current, direction = %direction, "Forced scale clamped to no-op");
            return Ok(current);
        }
        self.inner.apply(target, direction, format!("forced: {}", reason), None).await
    }

    /// Starts periodic rule evaluation. No-op if already running.
    pub fn start(&self) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut task = PeriodicTask::new("autoscaler", self.inner.config.evaluation_interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.evaluate().await;
            }
        });
        task.start();
        *slot = Some(task);
    }

    /// Stops periodic evaluation.
    pub fn shutdown(&self) {
        if let Some(mut task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.stop();
        }
        debug!("Autoscaler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn config() -> AutoScalerConfig {
        AutoScalerConfig {
            min_instances: 1,
            max_instances: 5,
            initial_instances: 2,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(10),
            metric_window: Duration::from_secs(300),
            max_decision_history: 10,
        }
    }

    fn cpu_up() -> ScalingRule {
        ScalingRule::new("cpu-high", "cpu", Comparator::GreaterThan, 80.0, ScaleDirection::Up)
            .with_duration(Duration::from_secs(30))
    }

    struct RecordingHandler {
        fail: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScalingHandler for RecordingHandler {
        async fn scale(&self, from: u32, to: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(ResilienceError::ScalingCallback { from, to, reason: "provider error".to_string() })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::GreaterThan.holds(2.0, 1.0));
        assert!(!Comparator::GreaterThan.holds(1.0, 1.0));
        assert!(Comparator::GreaterOrEqual.holds(1.0, 1.0));
        assert!(Comparator::LessThan.holds(0.5, 1.0));
        assert!(Comparator::LessOrEqual.holds(1.0, 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_must_be_sustained() {
        let scaler = AutoScaler::new(config(), vec![cpu_up()], EventBus::new());

        scaler.record_metric("cpu", 90.0);
        assert!(scaler.evaluate().await.is_none());

        tokio::time::sleep(Duration::from_secs(29)).await;
        scaler.record_metric("cpu", 90.0);
        assert!(scaler.evaluate().await.is_none());

        // Condition clears just before the duration elapses.
        tokio::time::sleep(Duration::from_millis(500)).await;
        scaler.record_metric("cpu", 40.0);
        assert!(scaler.evaluate().await.is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        scaler.record_metric("cpu", 90.0);
        assert!(scaler.evaluate().await.is_none());
        assert_eq!(scaler.instances(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_condition_scales_and_starts_cooldown() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let scaler = AutoScaler::new(config(), vec![cpu_up()], events);

        scaler.record_metric("cpu", 95.0);
        scaler.evaluate().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        scaler.record_metric("cpu", 95.0);

        let decision = scaler.evaluate().await.unwrap();
        assert!(decision.success);
        assert_eq!((decision.from, decision.to), (2, 3));
        assert_eq!(decision.reason, "rule:cpu-high");
        assert_eq!(scaler.instances(), 3);
        assert!(matches!(rx.recv().await.unwrap(), ResilienceEvent::Scaled { from: 2, to: 3, .. }));

        // Still hot, but within the scale-up cooldown.
        tokio::time::sleep(Duration::from_secs(30)).await;
        scaler.record_metric("cpu", 95.0);
        scaler.evaluate().await;
        assert_eq!(scaler.instances(), 3);

        tokio::time::sleep(Duration::from_secs(31)).await;
        scaler.record_metric("cpu", 95.0);
        scaler.evaluate().await;
        assert_eq!(scaler.instances(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamped_noop_consumes_no_cooldown() {
        let cfg = AutoScalerConfig { initial_instances: 5, ..config() };
        let rules = vec![
            ScalingRule::new("up", "load", Comparator::GreaterThan, 1.0, ScaleDirection::Up),
            ScalingRule::new("down", "idle", Comparator::GreaterThan, 1.0, ScaleDirection::Down),
        ];
        let scaler = AutoScaler::new(cfg, rules, EventBus::new());

        scaler.record_metric("load", 2.0);
        assert!(scaler.evaluate().await.is_none());
        assert_eq!(scaler.instances(), 5);
        assert!(scaler.decisions().is_empty());

        scaler.record_metric("idle", 2.0);
        let decision = scaler.evaluate().await.unwrap();
        assert_eq!(decision.to, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_keeps_instance_count() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let handler = Arc::new(RecordingHandler { fail: AtomicBool::new(true), calls: AtomicU32::new(0) });
        let rule = ScalingRule::new("up", "load", Comparator::GreaterThan, 1.0, ScaleDirection::Up);
        let scaler = AutoScaler::new(config(), vec![rule], events).with_handler(handler.clone());

        scaler.record_metric("load", 2.0);
        let decision = scaler.evaluate().await.unwrap();
        assert!(!decision.success);
        assert_eq!(scaler.instances(), 2);
        assert!(matches!(rx.recv().await.unwrap(), ResilienceEvent::ScalingFailed { from: 2, to: 3, .. }));

        // A failed attempt does not start the cooldown.
        handler.fail.store(false, Ordering::SeqCst);
        let decision = scaler.evaluate().await.unwrap();
        assert!(decision.success);
        assert_eq!(scaler.instances(), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_scale_clamps() {
        let scaler = AutoScaler::new(config(), vec![], EventBus::new());
        assert_eq!(scaler.force_scale(ScaleDirection::Up, 10, "test").await.unwrap(), 5);
        assert_eq!(scaler.force_scale(ScaleDirection::Up, 1, "test").await.unwrap(), 5);
        assert_eq!(scaler.force_scale(ScaleDirection::Down, 10, "test").await.unwrap(), 1);
        assert_eq!(scaler.decisions().len(), 2);
        assert_eq!(scaler.decisions()[0].reason, "forced: test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_aggregation_and_window() {
        let rule = ScalingRule::new("avg", "latency", Comparator::GreaterOrEqual, 100.0, ScaleDirection::Up)
            .with_aggregation(MetricAggregation::Average);
        let cfg = AutoScalerConfig { metric_window: Duration::from_secs(60), ..config() };
        let scaler = AutoScaler::new(cfg, vec![rule], EventBus::new());

        scaler.record_metric("latency", 400.0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        scaler.record_metric("latency", 50.0);
        scaler.record_metric("latency", 90.0);

        // The 400ms sample has aged out of the window.
        assert!(scaler.evaluate().await.is_none());
        assert_eq!(scaler.metric_value("latency"), Some(90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_management() {
        let scaler = AutoScaler::new(config(), vec![cpu_up()], EventBus::new());
        scaler.add_rule(cpu_up().with_amount(2));
        assert_eq!(scaler.rules().len(), 1);
        assert_eq!(scaler.rules()[0].amount, 2);
        assert!(scaler.remove_rule("cpu-high"));
        assert!(!scaler.remove_rule("cpu-high"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_evaluation() {
        let rule = ScalingRule::new("up", "load", Comparator::GreaterThan, 1.0, ScaleDirection::Up);
        let scaler = AutoScaler::new(config(), vec![rule], EventBus::new());
        scaler.record_metric("load", 2.0);
        scaler.start();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(scaler.instances(), 3);

        scaler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_installed_after_start() {
        let rule = ScalingRule::new("up", "load", Comparator::GreaterThan, 1.0, ScaleDirection::Up);
        let scaler = AutoScaler::new(config(), vec![rule], EventBus::new());
        scaler.start();

        let handler = Arc::new(RecordingHandler { fail: AtomicBool::new(false), calls: AtomicU32::new(0) });
        scaler.set_handler(handler.clone());
        scaler.record_metric("load", 2.0);
        let decision = scaler.evaluate().await.unwrap();

        assert!(decision.success);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(format!("{scaler:?}").contains("has_handler: true"));
        scaler.shutdown();
    }
}
