//! Request statistics and the rolling snapshot history.

use aegis_resilience::{BulkheadMetrics, CircuitMetrics, CircuitState, HealthStatus, ServiceLevel, ServiceStatus, SystemHealth};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// How a protected call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    /// The operation ran and failed.
    Failure,
    /// A protection layer refused to run the operation.
    Rejected,
}

/// Counters for one metrics interval.
#[derive(Debug, Clone, Default)]
pub struct RequestWindow {
    successes: u64,
    failures: u64,
    rejections: u64,
    total_latency: Duration,
}

impl RequestWindow {
    pub fn record(&mut self, outcome: RequestOutcome, latency: Duration) {
        match outcome {
            RequestOutcome::Success => self.successes += 1,
            RequestOutcome::Failure => self.failures += 1,
            RequestOutcome::Rejected => self.rejections += 1,
        }
        self.total_latency += latency;
    }

    pub fn total(&self) -> u64 {
        self.successes + self.failures + self.rejections
    }

    /// Failed or rejected calls over all calls; zero when idle.
    pub fn error_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { (self.failures + self.rejections) as f64 / total as f64 }
    }

    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.total_latency.as_secs_f64() * 1000.0 / total as f64 }
    }

    /// Calls per second over `interval`.
    pub fn rate(&self, interval: Duration) -> f64 {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 { 0.0 } else { self.total() as f64 / secs }
    }
}

/// Running totals since the orchestrator started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTotals {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

impl RequestTotals {
    pub fn absorb(&mut self, window: &RequestWindow) {
        self.total += window.total();
        self.successes += window.successes;
        self.failures += window.failures;
        self.rejections += window.rejections;
    }
}

/// Health part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub checks: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub critical: usize,
}

impl From<&SystemHealth> for HealthSummary {
    fn from(health: &SystemHealth) -> Self {
        Self {
            status: health.status,
            checks: health.checks.len(),
            healthy: health.healthy,
            degraded: health.degraded,
            unhealthy: health.unhealthy,
            critical: health.critical,
        }
    }
}

/// Performance part of a snapshot, measured over the last interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub requests: u64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub request_rate: f64,
    pub instances: u32,
    pub totals: RequestTotals,
}

/// Protection-layer part of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSummary {
    pub circuits: Vec<CircuitMetrics>,
    pub bulkheads: Vec<BulkheadMetrics>,
    pub services: Vec<ServiceStatus>,
}

impl ResilienceSummary {
    pub fn open_circuits(&self) -> usize {
        self.circuits.iter().filter(|c| c.state == CircuitState::Open).count()
    }

    pub fn degraded_services(&self) -> usize {
        self.services.iter().filter(|s| s.level != ServiceLevel::Full).count()
    }
}

/// Point-in-time rollup of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub health: HealthSummary,
    pub performance: PerformanceSummary,
    pub resilience: ResilienceSummary,
}

/// Snapshots kept for a retention window.
#[derive(Debug)]
pub struct MetricsHistory {
    retention: Duration,
    entries: VecDeque<(Instant, SystemSnapshot)>,
}

impl MetricsHistory {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self { retention, entries: VecDeque::new() }
    }

    /// Appends a snapshot and drops the ones older than the retention window.
    pub fn push(&mut self, snapshot: SystemSnapshot) {
        let now = Instant::now();
        self.entries.push_back((now, snapshot));
        while self.entries.front().is_some_and(|(at, _)| now.duration_since(*at) > self.retention) {
            self.entries.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&SystemSnapshot> {
        self.entries.back().map(|(_, snapshot)| snapshot)
    }

    pub fn snapshots(&self) -> Vec<SystemSnapshot> {
        self.entries.iter().map(|(_, snapshot)| snapshot.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
