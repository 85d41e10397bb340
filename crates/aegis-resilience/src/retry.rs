//! Retry policies with configurable backoff.
//!
//! [`RetryMechanism`] holds no per-call state, so a single instance can be
//! shared by any number of concurrent callers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ResilienceError, Result};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`
    #[default]
    Exponential,
    /// `base * n`
    Linear,
    /// `base`
    Fixed,
    /// `base * fib(n)` with fib(1) = fib(2) = 1
    Fibonacci,
}

/// Predicate deciding whether an error on attempt `n` should be retried.
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError, u32) -> bool + Send + Sync>;

/// Retry eligibility rule.
#[derive(Clone, Default)]
pub enum RetryCondition {
    /// Retry transient failures (see [`ResilienceError::is_retriable`]).
    #[default]
    Default,
    /// Retry when the predicate returns `true`.
    Custom(RetryPredicate),
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl RetryCondition {
    fn should_retry(&self, err: &ResilienceError, attempt: u32) -> bool {
        match self {
            Self::Default => err.is_retriable(),
            Self::Custom(predicate) => predicate(err, attempt),
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default: 3).
    pub max_attempts: u32,
    /// Delay unit fed to the strategy (default: 100ms).
    pub base_delay: Duration,
    /// Upper bound applied before jitter (default: 30 seconds).
    pub max_delay: Duration,
    /// Delay growth (default: exponential).
    pub strategy: BackoffStrategy,
    /// Multiply each delay by a random factor in `[0.5, 1.0]` (default: true).
    pub jitter: bool,
    /// Which errors are retried.
    pub condition: RetryCondition,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
            condition: RetryCondition::Default,
        }
    }
}

impl RetryPolicy {
    /// Sets the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the strategy and its base delay.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy, base_delay: Duration) -> Self {
        self.strategy = strategy;
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the default classifier with a predicate.
    #[must_use]
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError, u32) -> bool + Send + Sync + 'static,
    {
        self.condition = RetryCondition::Custom(Arc::new(predicate));
        self
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut previous, mut current) = (0u64, 1u64);
    for _ in 1..n {
        let next = previous.saturating_add(current);
        previous = current;
        current = next;
    }
    current
}

/// Stateless retry executor.
#[derive(Debug, Clone, Default)]
pub struct RetryMechanism {
    policy: RetryPolicy,
}

impl RetryMechanism {
    /// Creates a retry executor for `policy`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before the attempt that follows failed attempt `attempt` (1-indexed),
    /// clamped to `max_delay`, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.policy.base_delay;
        let delay = match self.policy.strategy {
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Fibonacci => {
                base.saturating_mul(u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX))
            }
        };
        delay.min(self.policy.max_delay)
    }

    /// Delay for `attempt` with jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.policy.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Invokes `operation` until it succeeds, the budget runs out, or an
    /// error is not retriable.
    ///
    /// A non-retriable error is returned unchanged; running out of attempts
    /// returns [`ResilienceError::RetryExhausted`] wrapping the last error.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.policy.condition.should_retry(&err, attempt) {
                debug!(attempt = attempt, error = %err, "Error is not retriable");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "Retry attempts exhausted");
                return Err(ResilienceError::RetryExhausted { attempts: attempt, source: Box::new(err) });
            }

            let delay = self.delay_for(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying operation"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
