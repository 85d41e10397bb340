//! Fault-tolerance primitives for Aegis.
//!
//! This crate provides the building blocks the orchestrator composes: a
//! circuit breaker, a retry executor, a bulkhead, a graceful degradation
//! service, an autoscaler and a health monitor. Components report state
//! changes on a shared [`EventBus`].

pub mod autoscaler;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod degradation;
pub mod error;
pub mod events;
pub mod health;
pub mod retry;
pub mod schedule;

pub use autoscaler::{
    AutoScaler, AutoScalerConfig, Comparator, MetricAggregation, ScaleDirection, ScalingDecision,
    ScalingHandler, ScalingRule,
};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadRegistry, Priority};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitState,
};
pub use degradation::{
    DegradationConfig, DegradationRegistry, Fallback, FallbackCondition, GracefulDegradationService,
    ServiceLevel, ServiceProbe, ServiceStatus,
};
pub use error::{FailureKind, OperationError, ResilienceError, Result};
pub use events::{AlertSeverity, EventBus, ResilienceEvent};
pub use health::{
    health_check_fn, CheckSummary, HealthCheck, HealthCheckResult, HealthCheckSpec, HealthMonitor,
    HealthMonitorConfig, HealthReport, HealthStatus, SystemHealth,
};
pub use retry::{BackoffStrategy, RetryCondition, RetryMechanism, RetryPolicy};
pub use schedule::PeriodicTask;
