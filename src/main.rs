use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use converger::config::Config;
use converger::convergence::{ConvergenceSweep, Converger, ConvergerConfig};
use converger::{clog, clog_error, Error, MemoryStore, Result, SystemClock};

/// Converger - repairs task records left inconsistent by failed executors
#[derive(Parser, Debug)]
#[command(name = "converger")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONVERGER_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.converger/converger.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Seconds between sweeps
    #[arg(long)]
    pub tick_period: Option<u64>,

    /// Seconds a task may stay pending before it is failed
    #[arg(long)]
    pub time_to_claim: Option<u64>,

    /// Seconds of quiet before a task is kicked or demoted
    #[arg(long)]
    pub convergence_interval: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Converger commands. `sweep` and `run` operate on a JSON dump of the store.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a single sweep and print the resulting store
    Sweep {
        /// JSON object mapping keys to values
        snapshot: PathBuf,
    },

    /// Run the convergence loop until Ctrl-C, then print the store
    Run {
        /// JSON object mapping keys to values
        snapshot: PathBuf,
    },

    /// Write the effective settings (including overrides) to the config file
    InitConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    converger::log::init(cli.debug || config.debug, config.log_path());

    // Overrides land before validation so a flag can fix a bad file value.
    apply_overrides(&cli, &mut config);
    if cli.command == Command::InitConfig {
        return init_config(&cli, &config);
    }
    let runtime_config = config.converger_config()?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Sweep { snapshot } => rt.block_on(run_sweep(&snapshot, &runtime_config)),
        Command::Run { snapshot } => rt.block_on(run_loop(&snapshot, runtime_config)),
        Command::InitConfig => Ok(()),
    }
}

fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(secs) = cli.tick_period {
        config.tick_period_secs = secs;
    }
    if let Some(secs) = cli.time_to_claim {
        config.time_to_claim_secs = secs;
    }
    if let Some(secs) = cli.convergence_interval {
        config.convergence_interval_secs = secs;
    }
}

fn init_config(cli: &Cli, config: &Config) -> Result<()> {
    config.converger_config()?;
    match &cli.config {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    clog!("config written");
    Ok(())
}

async fn run_sweep(snapshot: &Path, config: &ConvergerConfig) -> Result<()> {
    let store = Arc::new(load_store(snapshot).await?);
    let sweep = ConvergenceSweep::new(store.clone(), Arc::new(SystemClock));

    let report = sweep
        .run(
            chrono::Utc::now(),
            config.time_to_claim,
            config.convergence_interval,
        )
        .await;
    clog!(
        "sweep complete: inspected={} kicked={} demoted={} failed={} deleted={} conflicts={} aborted={}",
        report.inspected,
        report.kicked,
        report.demoted,
        report.failed,
        report.malformed_deleted,
        report.writes_conflicted,
        report.aborted
    );

    print_store(&store).await
}

async fn run_loop(snapshot: &Path, config: ConvergerConfig) -> Result<()> {
    let store = Arc::new(load_store(snapshot).await?);
    let handle = Converger::new(store.clone(), Arc::new(SystemClock), config)?.spawn();

    if let Err(e) = tokio::signal::ctrl_c().await {
        clog_error!("failed to listen for Ctrl-C: {}", e);
    }
    clog!("shutting down");
    handle.stop().await?;

    print_store(&store).await
}

/// Read a `{key: value}` JSON dump. String values are stored verbatim,
/// anything else is stored as its JSON encoding.
async fn load_store(path: &Path) -> Result<MemoryStore> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(&fs::read_to_string(path)?)?;
    let entries = raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();

    let store = MemoryStore::new();
    store.load(entries).await;
    if store.is_empty().await {
        return Err(Error::Validation(format!(
            "snapshot {} has no entries",
            path.display()
        )));
    }
    Ok(store)
}

async fn print_store(store: &MemoryStore) -> Result<()> {
    let dump: BTreeMap<String, Value> = store
        .dump()
        .await
        .into_iter()
        .map(|(key, value)| {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            (key, value)
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
