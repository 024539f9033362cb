//! wsauth CLI - inspect workspace authorization for an organization snapshot.
//!
//! Loads roles, bindings and workspaces from a file into an in-memory
//! organization and answers access queries from its authorization cache.

mod commands;
mod output;
mod snapshot;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use commands::{access, inspect};
use output::OutputFormat;
use snapshot::{Session, SnapshotFile};
use wsauth_core::config::Config;
use wsauth_core::telemetry::{init_telemetry, LogFormat};

/// wsauth - Workspace Authorization Cache CLI
#[derive(Parser)]
#[command(
    name = "wsauth",
    version,
    about = "wsauth - Workspace Authorization Cache",
    long_about = "Load an organization snapshot and query which workspaces its subjects can see.",
    propagate_version = true
)]
pub struct Cli {
    /// Snapshot file (.yaml, .yml or .json)
    #[arg(short = 'f', long, global = true, env = "WSAUTH_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Configuration file; `WSAUTH__*` environment variables override it
    #[arg(short, long, global = true, env = "WSAUTH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Log filter, e.g. `debug` or `wsauth_core=trace`
    #[arg(long, global = true, env = "WSAUTH_LOG", default_value = "warn")]
    log_level: String,

    /// Seconds to wait for the cache to become ready
    #[arg(long, global = true, default_value = "10")]
    ready_timeout: u64,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the workspaces a user can see
    List(access::ListArgs),

    /// Show the subjects that can see a workspace
    Who(access::WhoArgs),

    /// Check whether a user can see a workspace (exit code 2 if not)
    Check(access::CheckArgs),

    /// Show index and sync statistics
    Stats(inspect::StatsArgs),

    /// List the roles known to the evaluator
    Roles,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match run(cli).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(2),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

/// Execute the command. Returns `false` when a check is denied.
async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let mut telemetry_config = config.telemetry.clone();
    telemetry_config.logging = telemetry_config
        .logging
        .with_level(cli.log_level.clone())
        .with_format(LogFormat::Compact);
    let telemetry = init_telemetry(&telemetry_config)?;

    let path = cli
        .snapshot
        .ok_or_else(|| anyhow::anyhow!("No snapshot given: pass --snapshot or set WSAUTH_SNAPSHOT"))?;
    let snapshot = SnapshotFile::load(&path)?;
    let session = Session::start(
        snapshot,
        &config.cache,
        Duration::from_secs(cli.ready_timeout),
    )
    .await?;

    let result = match cli.command {
        Commands::List(args) => access::list(args, &session, cli.output).map(|()| true),
        Commands::Who(args) => access::who(args, &session, cli.output).map(|()| true),
        Commands::Check(args) => access::check(args, &session, cli.output),
        Commands::Stats(args) => {
            inspect::stats(args, &session, &telemetry.metrics, cli.output).map(|()| true)
        }
        Commands::Roles => inspect::roles(&session, cli.output).map(|()| true),
    };

    session.shutdown().await;
    result
}
