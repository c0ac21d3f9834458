//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::core::config::TelemetryConfig;

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
#[cfg(feature = "telemetry")]
pub fn init_tracing(config: &TelemetryConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_config: &TelemetryConfig) {}
