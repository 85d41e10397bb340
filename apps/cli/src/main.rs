//! Aegis CLI - operator tool for the Aegis self-healing orchestrator
//!
//! Provides the `aegis` command for validating configuration files and
//! running simulated workloads through the protection layers.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::{simulate, validate};

/// Aegis CLI - resilience and self-healing orchestration
#[derive(Parser, Debug)]
#[command(name = "aegis", author, version, about = "Aegis - resilience and self-healing orchestration")]
struct Args {
    /// Log level or filter directive, used when RUST_LOG is unset
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file
    ///
    /// Parses the TOML file, checks ranges and cross-references, and prints
    /// a summary of what it configures.
    Validate {
        /// Path to the configuration file
        config: PathBuf,

        /// Output the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a simulated workload through the orchestrator
    ///
    /// Issues randomly failing requests under the configured protection
    /// layers, then prints the final snapshot and recovery report as JSON.
    Simulate {
        /// Path to the configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// How long to generate load
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,

        /// Probability that a simulated request fails (0.0 - 1.0)
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,

        /// Seed for the workload generator
        #[arg(long)]
        seed: Option<u64>,

        /// Pause between requests
        #[arg(long, default_value_t = 20)]
        request_interval_ms: u64,
    },
}

fn init_tracing(log_level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    let installed = if json { builder.json().try_init() } else { builder.without_time().try_init() };
    installed.map_err(|err| anyhow::anyhow!(err))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Validate { config, json } => validate::execute(&config, json)?,
        Command::Simulate { config, duration_secs, failure_rate, seed, request_interval_ms } => {
            simulate::execute(simulate::SimulateArgs {
                config,
                duration_secs,
                failure_rate,
                seed,
                request_interval_ms,
            })
            .await?;
        }
    }

    Ok(())
}
