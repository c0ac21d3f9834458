//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration path when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/fleetrpc.toml";

/// fleetrpc - control-plane RPC facade for fleet and hypervisor management.
#[derive(Parser, Debug)]
#[command(name = "fleetrpc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn overrides(&self) -> crate::core::config::ConfigOverrides {
        crate::core::config::ConfigOverrides {
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
        }
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server with the in-memory fleet backend.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
