//! `bulwark` command-line driver
//!
//! Replays the demo endpoints against a simulated downstream and reports how
//! the resilience policies treated every request.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bulwark_resilience::PolicySet;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod simulate;

#[derive(Parser)]
#[command(name = "bulwark", version)]
#[command(about = "Drive resilience policies against a simulated downstream", long_about = None)]
struct Cli {
    /// Policy file (JSON); the built-in demo policies when omitted
    #[arg(short, long, global = true, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send requests to one endpoint and summarize the responses
    Simulate(simulate::SimulateArgs),
    /// Print the effective policy set as JSON
    Policies,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Logs go to stderr; stdout carries responses and events
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_policies(path: Option<&Path>) -> anyhow::Result<PolicySet> {
    match path {
        Some(path) => PolicySet::from_path(path)
            .with_context(|| format!("loading policies from {}", path.display())),
        None => Ok(PolicySet::demo()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let policies = load_policies(cli.config.as_deref())?;

    match cli.command {
        Command::Simulate(args) => simulate::run(policies, args).await,
        Command::Policies => {
            println!("{}", serde_json::to_string_pretty(&policies)?);
            Ok(())
        }
    }
}
