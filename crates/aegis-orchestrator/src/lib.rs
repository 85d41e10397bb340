//! Self-healing orchestration for Aegis.
//!
//! [`SelfHealingOrchestrator`] wires the primitives from `aegis-resilience`
//! together, runs protected calls through them, maps their events onto
//! recovery conditions and keeps a rolling metrics history. Configuration
//! files are modelled by [`AegisConfig`].

pub mod config;
pub mod metrics;
pub mod options;
pub mod orchestrator;
pub mod recovery;

pub use config::{AegisConfig, ConfigError};
pub use metrics::{
    HealthSummary, MetricsHistory, PerformanceSummary, RequestOutcome, RequestTotals, RequestWindow,
    ResilienceSummary, SystemSnapshot,
};
pub use options::ProtectionOptions;
pub use orchestrator::{OrchestratorBuilder, OrchestratorConfig, SelfHealingOrchestrator};
pub use recovery::{
    ActionReport, ActionStatus, PlannedRecovery, RecoveryAction, RecoveryActionKind, RecoveryEngine,
    RecoveryHandler, RecoveryRecord, RecoveryReport,
};
