//! Megatorrent CLI - Command-line interface
//!
//! Manages feed subscriptions in the local state file and runs simulated
//! feed scenarios.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use megatorrent_core::MegatorrentError;
use megatorrent_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "megatorrent")]
#[command(about = "Follow signed content feeds over BitTorrent")]
struct Cli {
    /// Subscription state file (defaults to MEGATORRENT_STATE_FILE or ./megatorrent-subscriptions.json)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref()) {
        eprintln!("Warning: could not initialize logging: {e}");
    }

    let result = commands::handle_command(cli.command, cli.state_file).await;
    if let Err(e) = &result
        && let Some(error) = e.downcast_ref::<MegatorrentError>()
        && error.is_user_error()
    {
        eprintln!("Error: {}", error.user_message());
        std::process::exit(2);
    }
    result
}
