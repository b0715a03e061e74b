#![cfg(not(tarpaulin_include))]

use std::path::PathBuf;

use attendance::app;
use attendance::config::Config;
use attendance::logging::{init_logging, Verbosity};
use clap::Parser;

/// Event attendance server: QR check-in, live dashboard, exports.
#[derive(Debug, Parser)]
#[command(name = "attendance-web", version, about)]
struct Cli {
    /// Path to the TOML configuration file (default: attendance.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `server.bind`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Main entry point for the web application
///
/// Loads configuration from the file, the environment and the command line,
/// then serves until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(Verbosity::from_flags(cli.verbose, cli.quiet));

    let mut config = Config::load_from(cli.config)?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    app::run(config).await
}
