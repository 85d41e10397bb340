//! Resilience event model and broadcast bus.
//!
//! Every primitive publishes its state changes here. Consumers (the
//! orchestrator, loggers, dashboards) subscribe independently; there is no
//! ordering guarantee between events from different components.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::autoscaler::ScaleDirection;
use crate::circuit_breaker::CircuitState;
use crate::degradation::ServiceLevel;
use crate::health::HealthStatus;

/// Default capacity of the broadcast buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Severity attached to alert events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

/// Notifications emitted by resilience components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A circuit breaker moved between states.
    CircuitStateChanged { circuit: String, from: CircuitState, to: CircuitState },

    /// A bulkhead refused an operation because its queue was full.
    BulkheadRejected { bulkhead: String, running: usize, queued: usize },

    /// A queued operation timed out before it could run.
    BulkheadTimedOut { bulkhead: String, waited_ms: u64 },

    /// A degradation service changed level.
    ServiceLevelChanged { service: String, from: ServiceLevel, to: ServiceLevel, reason: String },

    /// A degradation service moved to a worse level.
    ServiceDegraded { service: String, level: ServiceLevel },

    /// A degradation service returned to full service.
    ServiceRecovered { service: String, from: ServiceLevel },

    /// A degradation service served a fallback response.
    FallbackUsed { service: String, fallback: String, level: ServiceLevel },

    /// The autoscaler committed a new instance count.
    Scaled { from: u32, to: u32, direction: ScaleDirection, reason: String },

    /// The scaling callback failed; the instance count was not changed.
    ScalingFailed { from: u32, to: u32, error: String },

    /// A single health check produced a result.
    HealthCheckCompleted { check: String, status: HealthStatus, duration_ms: u64 },

    /// The aggregate system health changed.
    HealthStatusChanged { from: HealthStatus, to: HealthStatus },

    /// The aggregate system health returned to healthy.
    HealthRecovered { from: HealthStatus },

    /// Something needs operator attention.
    Alert { severity: AlertSeverity, source: String, message: String },

    /// A recovery action was dispatched.
    RecoveryActionDispatched { action: String, trigger: String, attempt: u32, success: bool },

    /// A recovery action failed while running.
    RecoveryActionFailed { action: String, trigger: String, error: String },

    /// A recovery action used up its attempt budget.
    RecoveryActionExhausted { action: String, trigger: String, attempts: u32 },
}

/// Broadcast channel shared by every component of one orchestrator.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    /// Creates a bus with the default buffer capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a bus with a custom buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: ResilienceEvent) {
        trace!(event = ?event, "Publishing resilience event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ResilienceEvent::HealthRecovered { from: HealthStatus::Degraded });

        assert_eq!(
            first.recv().await.unwrap(),
            ResilienceEvent::HealthRecovered { from: HealthStatus::Degraded }
        );
        assert_eq!(
            second.recv().await.unwrap(),
            ResilienceEvent::HealthRecovered { from: HealthStatus::Degraded }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(ResilienceEvent::Alert {
            severity: AlertSeverity::Info,
            source: "test".to_string(),
            message: "nobody listening".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ResilienceEvent::CircuitStateChanged {
            circuit: "db".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit_state_changed");
        assert_eq!(json["circuit"], "db");
        assert_eq!(json["to"], "open");
    }
}
