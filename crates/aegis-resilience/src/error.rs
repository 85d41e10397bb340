// Error types for resilience primitives

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Coarse classification of a protected operation's failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum FailureKind {
    /// The peer reset or refused the connection.
    ConnectionReset,
    /// The operation timed out on its own.
    Timeout,
    /// An HTTP response with a non-success status code.
    Http(u16),
    /// Anything else.
    Other,
}

/// A failure reported by a protected operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    /// Failure classification used by the default retry classifier.
    pub kind: FailureKind,
    /// Human-readable message.
    pub message: String,
}

impl OperationError {
    /// Creates an unclassified operation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Other, message: message.into() }
    }

    /// Creates a connection-reset error.
    #[must_use]
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::ConnectionReset, message: message.into() }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Timeout, message: message.into() }
    }

    /// Creates an HTTP status error.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { kind: FailureKind::Http(status), message: message.into() }
    }

    /// Returns `true` for connection resets, timeouts and HTTP 5xx/408/429.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FailureKind::ConnectionReset | FailureKind::Timeout => true,
            FailureKind::Http(status) => status >= 500 || status == 408 || status == 429,
            FailureKind::Other => false,
        }
    }
}

impl From<io::Error> for OperationError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe => FailureKind::ConnectionReset,
            io::ErrorKind::TimedOut => FailureKind::Timeout,
            _ => FailureKind::Other,
        };
        Self { kind, message: err.to_string() }
    }
}

/// Resilience errors
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The protected operation itself failed
    #[error("Operation failed: {0}")]
    Operation(#[from] OperationError),

    /// Circuit breaker is open and rejected the call without running it
    #[error("Circuit '{name}' is open")]
    CircuitOpen {
        /// Circuit name
        name: String,
    },

    /// Bulkhead is saturated and its queue is full
    #[error("Bulkhead '{name}' exhausted ({running} running, {queued} queued)")]
    ResourceExhausted {
        /// Bulkhead name
        name: String,
        /// Operations running at rejection time
        running: usize,
        /// Operations queued at rejection time
        queued: usize,
    },

    /// Operation waited in the bulkhead queue for too long
    #[error("Bulkhead '{name}' queue timeout after {waited:?}")]
    BulkheadTimeout {
        /// Bulkhead name
        name: String,
        /// Time spent queued
        waited: Duration,
    },

    /// Bulkhead was shut down while the operation was queued or before it arrived
    #[error("Bulkhead '{name}' is shut down")]
    BulkheadShutdown {
        /// Bulkhead name
        name: String,
    },

    /// Retry budget exhausted; wraps the last underlying error
    #[error("Operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: Box<ResilienceError>,
    },

    /// All fallbacks failed or none was eligible
    #[error("Service '{service}' unavailable: {reason}")]
    DegradationUnavailable {
        /// Degradation service name
        service: String,
        /// Why no response could be produced
        reason: String,
    },

    /// Advisory deadline elapsed before the operation finished
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Injected scaling callback failed
    #[error("Scaling callback failed ({from} -> {to}): {reason}")]
    ScalingCallback {
        /// Instance count before the attempt
        from: u32,
        /// Requested instance count
        to: u32,
        /// Failure reason
        reason: String,
    },

    /// Recovery action failed
    #[error("Recovery action '{action}' failed: {reason}")]
    RecoveryAction {
        /// Recovery action id
        action: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid runtime configuration or options
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A named component was looked up but never registered
    #[error("{kind} '{name}' is not registered")]
    NotRegistered {
        /// Component kind
        kind: &'static str,
        /// Component name
        name: String,
    },

    /// Payload conversion error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResilienceError {
    /// Default retry classifier.
    ///
    /// Transient operation failures and advisory timeouts are retriable;
    /// refusals from protection layers are not.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Operation(err) => err.is_transient(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns `true` when a protection layer refused to run the operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::ResourceExhausted { .. }
                | Self::BulkheadTimeout { .. }
                | Self::BulkheadShutdown { .. }
        )
    }
}

impl From<io::Error> for ResilienceError {
    fn from(err: io::Error) -> Self {
        Self::Operation(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OperationError::connection_reset("reset").is_transient());
        assert!(OperationError::timeout("slow").is_transient());
        assert!(OperationError::http(503, "unavailable").is_transient());
        assert!(OperationError::http(408, "request timeout").is_transient());
        assert!(OperationError::http(429, "too many").is_transient());
        assert!(!OperationError::http(404, "missing").is_transient());
        assert!(!OperationError::http(400, "bad").is_transient());
        assert!(!OperationError::new("boom").is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: ResilienceError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        match &err {
            ResilienceError::Operation(op) => assert_eq!(op.kind, FailureKind::ConnectionReset),
            _ => panic!("Expected Operation error variant"),
        }
        assert!(err.is_retriable());

        let err: ResilienceError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_rejections_are_not_retriable() {
        let err = ResilienceError::CircuitOpen { name: "db".to_string() };
        assert!(err.is_rejection());
        assert!(!err.is_retriable());
        assert!(ResilienceError::Timeout(Duration::from_secs(1)).is_retriable());
    }

    #[test]
    fn test_retry_exhausted_display() {
        let err = ResilienceError::RetryExhausted {
            attempts: 3,
            source: Box::new(OperationError::new("boom").into()),
        };
        assert_eq!(err.to_string(), "Operation failed after 3 attempts: Operation failed: boom");
    }
}
