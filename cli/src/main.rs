//! Replication Engine CLI
//!
//! Runs one of the demonstration workloads through the replication engine
//! and prints the run manifest as JSON.
//!
//! # Example
//!
//! ```bash
//! # 1000 Fibonacci trials on 8 workers
//! replicate --trials 1000 --mode parallel --workers 8 --workload fib
//!
//! # Reproducible sequential run of the random-string workload
//! replicate -n 50 --seed 7 --workload strings
//!
//! # Start from a JSON config and override the trial count
//! replicate --config run.json --trials 200 --workload pi
//! ```

mod workloads;

use clap::Parser;
use replicate_core_rs::{ExecutionMode, ReplicationError, RunConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use workloads::{run_workload, Workload};

/// Replication Engine
///
/// Runs N independent stochastic trials sequentially or across a worker
/// pool sharing one seeded random source.
#[derive(Parser, Debug)]
#[command(name = "replicate")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON run configuration; the flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of trials
    #[arg(short = 'n', long)]
    trials: Option<usize>,

    /// Execution mode: sequential or parallel
    #[arg(short = 'm', long)]
    mode: Option<ExecutionMode>,

    /// Worker-pool size for parallel mode (defaults to available cores)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Seed for the shared random source
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Workload to replicate
    #[arg(long, value_enum, default_value_t = Workload::Fib)]
    workload: Workload,

    /// Make the trial with this index fail
    #[arg(long)]
    fail_at: Option<usize>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("failed to write summary: {0}")]
    Output(#[from] serde_json::Error),
}

/// Merge the optional config file with command-line overrides
fn build_config(args: &Args) -> Result<RunConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
                path: path.clone(),
                source,
            })?;
            RunConfig::from_json(&json)?
        }
        None => RunConfig::sequential(100),
    };

    if let Some(trials) = args.trials {
        config.trials = trials;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(workers) = args.workers {
        config.pool_size = Some(workers);
    }

    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<(), CliError> {
    let config = build_config(args)?;
    info!(
        workload = ?args.workload,
        trials = config.trials,
        mode = %config.mode,
        seed = args.seed,
        "running workload"
    );

    let summary = run_workload(args.workload, &config, args.seed, args.fail_at)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,replicate_core_rs=info,replicate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "replication failed");
            ExitCode::FAILURE
        }
    }
}
