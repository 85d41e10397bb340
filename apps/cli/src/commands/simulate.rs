//! Simulated workload command.
//!
//! Drives randomly failing requests through the orchestrator so operators can
//! watch circuits, degradation, scaling and recovery react to a config.

use aegis_orchestrator::{
    AegisConfig, ProtectionOptions, RecoveryAction, RecoveryHandler, RecoveryReport, SelfHealingOrchestrator,
    SystemSnapshot,
};
use aegis_resilience::{
    health_check_fn, Fallback, GracefulDegradationService, HealthCheckSpec, HealthReport, OperationError,
    ScalingDecision, ScalingHandler, ServiceLevel, ServiceProbe,
};
use anyhow::Context;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Per-attempt deadline for simulated requests.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Arguments of the simulate command.
#[derive(Debug)]
pub struct SimulateArgs {
    pub config: Option<PathBuf>,
    pub duration_secs: u64,
    pub failure_rate: f64,
    pub seed: Option<u64>,
    pub request_interval_ms: u64,
}

/// Random request generator shared with the simulated probes.
struct Workload {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl Workload {
    fn new(failure_rate: f64, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self { rng: Mutex::new(rng), failure_rate, attempts: AtomicU64::new(0), failures: AtomicU64::new(0) }
    }

    /// Decides the fate of one attempt: whether it fails and how long it takes.
    fn roll(&self) -> (bool, Duration) {
        let (fails, latency_ms) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (rng.gen_bool(self.failure_rate), rng.gen_range(1..=25))
        };
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if fails {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        (fails, Duration::from_millis(latency_ms))
    }

    fn error_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 { 0.0 } else { self.failures.load(Ordering::Relaxed) as f64 / attempts as f64 }
    }
}

async fn simulated_request(fails: bool, latency: Duration) -> aegis_resilience::Result<Value> {
    tokio::time::sleep(latency).await;
    if fails {
        Err(OperationError::http(503, "simulated upstream failure").into())
    } else {
        Ok(json!({ "source": "primary" }))
    }
}

struct LoggingScaler;

#[async_trait]
impl ScalingHandler for LoggingScaler {
    async fn scale(&self, from: u32, to: u32) -> aegis_resilience::Result<()> {
        info!(from = from, to = to, "Simulated deployment resized");
        Ok(())
    }
}

struct LoggingRecovery;

#[async_trait]
impl RecoveryHandler for LoggingRecovery {
    async fn handle(&self, action: &RecoveryAction, trigger: &str) -> aegis_resilience::Result<()> {
        info!(action = %action.id, trigger = trigger, kind = ?action.kind, "Simulated recovery performed");
        Ok(())
    }
}

struct WorkloadProbe(Arc<Workload>);

#[async_trait]
impl ServiceProbe for WorkloadProbe {
    async fn probe(&self) -> bool {
        self.0.error_rate() < 0.5
    }
}

#[derive(Serialize)]
struct SimulationOutput {
    seed: Option<u64>,
    requests: u64,
    attempts: u64,
    snapshot: SystemSnapshot,
    recovery: RecoveryReport,
    scaling: Vec<ScalingDecision>,
}

/// Execute the simulate command.
pub async fn execute(args: SimulateArgs) -> anyhow::Result<()> {
    anyhow::ensure!((0.0..=1.0).contains(&args.failure_rate), "--failure-rate must be between 0.0 and 1.0");

    let config = match &args.config {
        Some(path) => AegisConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => AegisConfig::default(),
    };

    let workload = Arc::new(Workload::new(args.failure_rate, args.seed));
    let orchestrator = SelfHealingOrchestrator::from_config(&config)
        .scaling_handler(Arc::new(LoggingScaler))
        .recovery_handler(Arc::new(LoggingRecovery))
        .build();

    for (name, section) in &config.degradation_services {
        let service = orchestrator.register_degradation_service(GracefulDegradationService::new(
            name.clone(),
            section.to_runtime(),
            vec![
                Fallback::static_value("cache", ServiceLevel::Degraded, json!({ "source": "cache" })),
                Fallback::static_value("minimal", ServiceLevel::CriticalOnly, json!({ "source": "minimal" })),
            ],
            orchestrator.events().clone(),
        ));
        service.start_probe(Arc::new(WorkloadProbe(Arc::clone(&workload))));
    }

    let probe = Arc::clone(&workload);
    orchestrator.register_health_check(
        HealthCheckSpec::new(
            "workload",
            health_check_fn(move || {
                let rate = probe.error_rate();
                async move {
                    Ok(match rate {
                        r if r >= 0.5 => HealthReport::unhealthy(format!("error rate {:.2}", r)),
                        r if r >= 0.2 => HealthReport::degraded(format!("error rate {:.2}", r)),
                        _ => HealthReport::healthy(),
                    })
                }
            }),
        )
        .with_interval(Duration::from_secs(1)),
    );

    let chain = ProtectionOptions::new()
        .circuit_breaker(config.circuit_breakers.keys().next().map_or("simulated", String::as_str))
        .bulkhead(config.bulkheads.keys().next().map_or("simulated", String::as_str))
        .retry(config.retry.to_runtime())
        .timeout(REQUEST_TIMEOUT);
    let degraded = config
        .degradation_services
        .keys()
        .next()
        .map(|service| ProtectionOptions::new().graceful_degradation(service.as_str()).timeout(REQUEST_TIMEOUT));

    orchestrator.start();
    info!(
        duration_secs = args.duration_secs,
        failure_rate = args.failure_rate,
        "Starting simulated workload"
    );

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let pause = Duration::from_millis(args.request_interval_ms.max(1));
    let mut requests = 0u64;
    while Instant::now() < deadline {
        // Every other request goes through the degradation service, if any.
        let options = match &degraded {
            Some(degraded) if requests % 2 == 1 => degraded,
            _ => &chain,
        };
        let _: aegis_resilience::Result<Value> = orchestrator
            .execute_with_protection(
                || {
                    let (fails, latency) = workload.roll();
                    simulated_request(fails, latency)
                },
                options,
            )
            .await;
        requests += 1;
        tokio::time::sleep(pause).await;
    }

    let snapshot = orchestrator.collect_metrics().await;
    let output = SimulationOutput {
        seed: args.seed,
        requests,
        attempts: workload.attempts.load(Ordering::Relaxed),
        snapshot,
        recovery: orchestrator.recovery_report(),
        scaling: orchestrator.autoscaler().decisions(),
    };
    orchestrator.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
