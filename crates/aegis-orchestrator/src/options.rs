//! Per-call protection options.

use aegis_resilience::{Priority, RetryPolicy};
use std::time::Duration;

/// Which protection layers wrap a call to
/// [`SelfHealingOrchestrator::execute_with_protection`](crate::SelfHealingOrchestrator::execute_with_protection).
///
/// Layers nest as circuit breaker, then retry, then bulkhead around the
/// operation. Naming a degradation service replaces that chain entirely.
#[derive(Debug, Clone, Default)]
pub struct ProtectionOptions {
    /// Circuit breaker name; created with default settings if unknown.
    pub circuit_breaker: Option<String>,
    /// Bulkhead name; created with default settings if unknown.
    pub bulkhead: Option<String>,
    /// Queue priority inside the bulkhead.
    pub priority: Priority,
    pub retry: Option<RetryPolicy>,
    /// Advisory deadline for each attempt of the operation.
    pub timeout: Option<Duration>,
    /// Degradation service name; must be registered.
    pub graceful_degradation: Option<String>,
}

impl ProtectionOptions {
    /// No protection at all.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn circuit_breaker(mut self, name: impl Into<String>) -> Self {
        self.circuit_breaker = Some(name.into());
        self
    }

    #[must_use]
    pub fn bulkhead(mut self, name: impl Into<String>) -> Self {
        self.bulkhead = Some(name.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn graceful_degradation(mut self, service: impl Into<String>) -> Self {
        self.graceful_degradation = Some(service.into());
        self
    }
}
