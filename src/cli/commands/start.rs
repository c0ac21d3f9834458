//! Start command implementation.

use crate::backend::{FleetBackend, InMemoryFleet};
use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use crate::core::telemetry::init_tracing;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

/// Start the fleetrpc server.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Transition delay for simulated VM state changes, overriding the config.
    #[arg(long)]
    pub transition_delay_ms: Option<u64>,
}

/// Load config, seed the in-memory backend and serve until Ctrl-C.
pub async fn run_start(args: StartArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(overrides);
    if let Some(delay) = args.transition_delay_ms {
        config.rpc.transition_delay_ms = delay;
    }

    init_tracing(&config.telemetry);

    let backend = InMemoryFleet::from_seed(config.seed.clone(), config.memory_settings());
    tracing::info!(
        machines = config.seed.machines.len(),
        subnets = config.seed.subnets.len(),
        vms = config.seed.vms.len(),
        "in-memory fleet seeded"
    );
    let backend: Arc<dyn FleetBackend> = Arc::new(backend);

    let mut runtime = Runtime::new(config, backend)?;
    runtime.run().await
}
