//! Configuration validation command.

use aegis_orchestrator::AegisConfig;
use anyhow::Context;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct Summary {
    valid: bool,
    circuit_breakers: Vec<String>,
    bulkheads: Vec<String>,
    degradation_services: Vec<String>,
    scaling_rules: usize,
    recovery_actions: usize,
    instances: (u32, u32),
}

impl Summary {
    fn of(config: &AegisConfig) -> Self {
        Self {
            valid: true,
            circuit_breakers: config.circuit_breakers.keys().cloned().collect(),
            bulkheads: config.bulkheads.keys().cloned().collect(),
            degradation_services: config.degradation_services.keys().cloned().collect(),
            scaling_rules: config.scaling_rules.len(),
            recovery_actions: config.recovery_actions.len(),
            instances: (config.autoscaler.min_instances, config.autoscaler.max_instances),
        }
    }
}

/// Execute the validate command.
///
/// Fails with the parse or validation error when the file is not usable.
pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = AegisConfig::load(path).with_context(|| format!("Invalid configuration file {}", path.display()))?;
    let summary = Summary::of(&config);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{} {}", "✓".green(), format!("{} is valid", path.display()).bold());
    println!();
    println!("  Circuit breakers:     {}", list(&summary.circuit_breakers));
    println!("  Bulkheads:            {}", list(&summary.bulkheads));
    println!("  Degradation services: {}", list(&summary.degradation_services));
    println!("  Scaling rules:        {}", summary.scaling_rules);
    println!("  Recovery actions:     {}", summary.recovery_actions);
    println!("  Instances:            {}..={}", summary.instances.0, summary.instances.1);
    Ok(())
}

fn list(names: &[String]) -> String {
    if names.is_empty() { "none".dimmed().to_string() } else { names.join(", ") }
}
