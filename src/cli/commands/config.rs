//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the configuration with defaults filled in.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Print a configuration template.
    Generate,
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(config_path),
        ConfigCommand::Show { format } => show_config(config_path, &format),
        ConfigCommand::Generate => {
            println!("{}", template());
            Ok(())
        }
    }
}

fn validate_config(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    let enabled: Vec<_> = config
        .listeners
        .iter()
        .filter(|(_, l)| l.enabled)
        .map(|(name, l)| format!("{}={}", name, l.bind))
        .collect();
    println!("✓ {} is valid", path.display());
    println!("  listeners: {}", enabled.join(", "));
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = Config::from_file(path)?;
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config).context("failed to render config as JSON")?;
            println!("{}", json);
        }
        "toml" => println!("{}", config.to_toml()?),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
    Ok(())
}

fn template() -> &'static str {
    r#"# fleetrpc configuration

[tls]
cert_chain_path = "/etc/fleetrpc/server.pem"
key_path = "/etc/fleetrpc/server.key"
client_ca_path = "/etc/fleetrpc/clients-ca.pem"
handshake_timeout_ms = 10000
min_version = "1.2"

[listeners.binrpc]
bind = "0.0.0.0:6971"

[listeners.grpc]
bind = "0.0.0.0:6972"

[listeners.gateway]
bind = "0.0.0.0:6973"
enabled = false

[updates]
channel_capacity = 16
flush_delay_ms = 10
heartbeat_secs = 900
max_batch = 64

[rpc]
hypervisor_port = 6976
list_chunk_size = 256

[telemetry]
log_level = "info"
json = false
"#
}
