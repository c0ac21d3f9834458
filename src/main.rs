//! fleetrpc - unified CLI entrypoint.
//!
//! Usage:
//!   fleetrpc start --config config/fleetrpc.toml
//!   fleetrpc config validate --config config/fleetrpc.toml
//!   fleetrpc config show --format json

use anyhow::Result;
use clap::Parser;
use fleetrpc::cli::commands::{run_config, run_start};
use fleetrpc::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, &overrides).await,
        Commands::Config(args) => run_config(args, &config_path),
    }
}
