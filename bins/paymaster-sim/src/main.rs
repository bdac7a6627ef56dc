//! Paymaster scenario simulator.
//!
//! Replays a JSON scenario against an in-memory settlement engine and prints
//! every ledger event as one JSON line on stdout, followed by a summary of
//! the final balances. Logs go to stderr.

mod scenario;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use paymaster_engine::EngineConfig;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "paymaster-sim",
    version,
    about = "Replay a Paymaster scenario and print the resulting ledger events"
)]
struct Args {
    /// Scenario file (JSON)
    scenario: PathBuf,

    /// Engine config file (TOML). Defaults to <config_dir>/paymaster/engine.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("paymaster").join("engine.toml")))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config_path = args.config_path();
    let config = EngineConfig::load(config_path.as_deref())
        .with_context(|| format!("failed to load engine config from {config_path:?}"))?;
    info!(?config_path, version = %config.version, "paymaster-sim v{}", env!("CARGO_PKG_VERSION"));

    let raw = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("failed to read {}", args.scenario.display()))?;
    let scenario = scenario::parse(&raw)?;
    info!(steps = scenario.steps.len(), start = %scenario.start, "replaying scenario");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let summary = scenario::run(&scenario, config, |events| {
        for event in events {
            serde_json::to_writer(&mut out, event)?;
            writeln!(out)?;
        }
        Ok(())
    })?;
    serde_json::to_writer_pretty(&mut out, &summary)?;
    writeln!(out)?;
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .init();
    }
}
