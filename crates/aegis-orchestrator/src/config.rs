//! TOML configuration model.
//!
//! Every section mirrors one runtime config struct with integer `*_ms` /
//! `*_secs` fields and defaults matching the runtime defaults. A missing
//! section means "use the defaults".
//!
//! ```toml
//! [orchestrator]
//! metrics_interval_secs = 60
//!
//! [circuit_breakers.payments]
//! failure_threshold = 5
//! reset_timeout_ms = 30000
//!
//! [[recovery_actions]]
//! id = "reset-circuits"
//! condition = "circuit_breaker_open"
//! action = { kind = "reset_circuit" }
//! ```

use aegis_resilience::{
    AutoScalerConfig, BackoffStrategy, BulkheadConfig, CircuitBreakerConfig, Comparator, DegradationConfig,
    HealthMonitorConfig, MetricAggregation, RetryPolicy, ScaleDirection, ScalingRule,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::orchestrator::OrchestratorConfig;
use crate::recovery::{RecoveryAction, RecoveryActionKind};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete Aegis configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AegisConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Default retry policy for callers that do not bring their own.
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSection>,
    #[serde(default)]
    pub bulkheads: BTreeMap<String, BulkheadSection>,
    #[serde(default)]
    pub degradation_services: BTreeMap<String, DegradationSection>,
    #[serde(default)]
    pub autoscaler: AutoScalerSection,
    #[serde(default)]
    pub scaling_rules: Vec<ScalingRuleSection>,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub recovery_actions: Vec<RecoveryActionSection>,
}

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl AegisConfig {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.retry.validate()?;
        for (name, section) in &self.circuit_breakers {
            section.validate(name)?;
        }
        for (name, section) in &self.bulkheads {
            section.validate(name)?;
        }
        for (name, section) in &self.degradation_services {
            section.validate(name)?;
        }
        self.autoscaler.validate()?;
        self.health.validate()?;

        let mut rule_ids = HashSet::new();
        for rule in &self.scaling_rules {
            rule.validate()?;
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate scaling rule id '{}'", rule.id)));
            }
        }

        let mut action_ids = HashSet::new();
        for action in &self.recovery_actions {
            action.validate()?;
            if !action_ids.insert(action.id.as_str()) {
                return Err(invalid(format!("duplicate recovery action id '{}'", action.id)));
            }
            match &action.action {
                RecoveryActionKind::Degrade { service, .. } if !self.degradation_services.contains_key(service) => {
                    return Err(invalid(format!(
                        "recovery action '{}' degrades unknown service '{}'",
                        action.id, service
                    )));
                }
                RecoveryActionKind::ResetCircuit { circuit: Some(circuit) }
                    if !self.circuit_breakers.contains_key(circuit) =>
                {
                    return Err(invalid(format!(
                        "recovery action '{}' resets unknown circuit '{}'",
                        action.id, circuit
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// `[orchestrator]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorSection {
    /// Metrics tick interval (default: 60).
    pub metrics_interval_secs: u64,
    /// Snapshot retention (default: 86400 = 24 hours).
    pub history_retention_secs: u64,
    pub recovery_history_size: usize,
    /// How long shutdown waits for running bulkhead work (default: 30).
    pub shutdown_grace_secs: u64,
    pub event_capacity: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 60,
            history_retention_secs: 86_400,
            recovery_history_size: crate::recovery::DEFAULT_RECOVERY_HISTORY,
            shutdown_grace_secs: 30,
            event_capacity: aegis_resilience::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl OrchestratorSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_interval_secs == 0 {
            return Err(invalid("orchestrator.metrics_interval_secs must be greater than 0"));
        }
        if self.history_retention_secs < self.metrics_interval_secs {
            return Err(invalid("orchestrator.history_retention_secs must cover at least one metrics interval"));
        }
        if self.recovery_history_size == 0 || self.event_capacity == 0 {
            return Err(invalid("orchestrator history and event capacities must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
            history_retention: Duration::from_secs(self.history_retention_secs),
            recovery_history_size: self.recovery_history_size,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            event_capacity: self.event_capacity,
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::default(),
            jitter: true,
        }
    }
}

impl RetrySection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.strategy, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter)
    }
}

/// `[circuit_breakers.<name>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 60_000, monitoring_period_ms: 60_000 }
    }
}

impl CircuitBreakerSection {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid(format!("circuit_breakers.{}.failure_threshold must be at least 1", name)));
        }
        if self.reset_timeout_ms == 0 || self.monitoring_period_ms == 0 {
            return Err(invalid(format!("circuit_breakers.{} durations must be greater than 0", name)));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            monitoring_period: Duration::from_millis(self.monitoring_period_ms),
        }
    }
}

/// `[bulkheads.<name>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadSection {
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// Queue wait limit; 0 disables it (default: 30000).
    pub queue_timeout_ms: u64,
    pub priority_queue: bool,
}

impl Default for BulkheadSection {
    fn default() -> Self {
        Self { max_concurrent: 10, max_queue: 100, queue_timeout_ms: 30_000, priority_queue: false }
    }
}

impl BulkheadSection {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid(format!("bulkheads.{}.max_concurrent must be at least 1", name)));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> BulkheadConfig {
        BulkheadConfig {
            max_concurrent: self.max_concurrent,
            max_queue: self.max_queue,
            queue_timeout: (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms)),
            priority_queue: self.priority_queue,
        }
    }
}

/// `[degradation_services.<name>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DegradationSection {
    pub degradation_threshold: u32,
    pub recovery_threshold: u32,
    /// Health probe interval; 0 disables the probe (default: 0).
    pub health_check_interval_secs: u64,
}

impl Default for DegradationSection {
    fn default() -> Self {
        Self { degradation_threshold: 3, recovery_threshold: 5, health_check_interval_secs: 0 }
    }
}

impl DegradationSection {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.degradation_threshold == 0 || self.recovery_threshold == 0 {
            return Err(invalid(format!("degradation_services.{} thresholds must be at least 1", name)));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> DegradationConfig {
        DegradationConfig {
            degradation_threshold: self.degradation_threshold,
            recovery_threshold: self.recovery_threshold,
            health_check_interval: (self.health_check_interval_secs > 0)
                .then(|| Duration::from_secs(self.health_check_interval_secs)),
        }
    }
}

/// `[autoscaler]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoScalerSection {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Starting count; defaults to `min_instances`.
    pub initial_instances: Option<u32>,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub evaluation_interval_secs: u64,
    pub metric_window_secs: u64,
    pub max_decision_history: usize,
}

impl Default for AutoScalerSection {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            initial_instances: None,
            scale_up_cooldown_secs: 60,
            scale_down_cooldown_secs: 300,
            evaluation_interval_secs: 30,
            metric_window_secs: 300,
            max_decision_history: 100,
        }
    }
}

impl AutoScalerSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 || self.min_instances > self.max_instances {
            return Err(invalid("autoscaler requires 0 < max_instances and min_instances <= max_instances"));
        }
        if let Some(initial) = self.initial_instances {
            if initial < self.min_instances || initial > self.max_instances {
                return Err(invalid("autoscaler.initial_instances must lie within [min_instances, max_instances]"));
            }
        }
        if self.evaluation_interval_secs == 0 || self.metric_window_secs == 0 {
            return Err(invalid("autoscaler intervals must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> AutoScalerConfig {
        AutoScalerConfig {
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            initial_instances: self.initial_instances.unwrap_or(self.min_instances),
            scale_up_cooldown: Duration::from_secs(self.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(self.scale_down_cooldown_secs),
            evaluation_interval: Duration::from_secs(self.evaluation_interval_secs),
            metric_window: Duration::from_secs(self.metric_window_secs),
            max_decision_history: self.max_decision_history,
        }
    }
}

/// `[[scaling_rules]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingRuleSection {
    pub id: String,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub direction: ScaleDirection,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default = "default_amount")]
    pub amount: u32,
    #[serde(default)]
    pub aggregation: MetricAggregation,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

fn default_amount() -> u32 {
    1
}

impl ScalingRuleSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() || self.metric.is_empty() {
            return Err(invalid("scaling rules need a non-empty id and metric"));
        }
        if !self.threshold.is_finite() {
            return Err(invalid(format!("scaling rule '{}' threshold must be finite", self.id)));
        }
        if self.amount == 0 {
            return Err(invalid(format!("scaling rule '{}' amount must be at least 1", self.id)));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> ScalingRule {
        let rule = ScalingRule::new(&self.id, &self.metric, self.comparator, self.threshold, self.direction)
            .with_duration(Duration::from_secs(self.duration_secs))
            .with_amount(self.amount)
            .with_aggregation(self.aggregation);
        match self.cooldown_secs {
            Some(secs) => rule.with_cooldown(Duration::from_secs(secs)),
            None => rule,
        }
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub history_size: usize,
    pub alert_threshold: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self { history_size: 100, alert_threshold: 3 }
    }
}

impl HealthSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 || self.alert_threshold == 0 {
            return Err(invalid("health.history_size and health.alert_threshold must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> HealthMonitorConfig {
        HealthMonitorConfig { history_size: self.history_size, alert_threshold: self.alert_threshold }
    }
}

/// `[[recovery_actions]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryActionSection {
    pub id: String,
    pub condition: String,
    pub action: RecoveryActionKind,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub sustained_secs: u64,
    #[serde(default = "default_recovery_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_recovery_cooldown_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl RecoveryActionSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() || self.condition.is_empty() {
            return Err(invalid("recovery actions need a non-empty id and condition"));
        }
        if self.max_attempts == 0 {
            return Err(invalid(format!("recovery action '{}' max_attempts must be at least 1", self.id)));
        }
        if self.threshold.is_some_and(|t| !t.is_finite()) {
            return Err(invalid(format!("recovery action '{}' threshold must be finite", self.id)));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_runtime(&self) -> RecoveryAction {
        let action = RecoveryAction::new(&self.id, &self.condition, self.action.clone())
            .sustained_for(Duration::from_secs(self.sustained_secs))
            .with_cooldown(Duration::from_secs(self.cooldown_secs))
            .with_max_attempts(self.max_attempts);
        match self.threshold {
            Some(threshold) => action.with_threshold(threshold),
            None => action,
        }
    }
}
