//! Configuration parsing and validation.
//!
//! fleetrpc is configured from a single TOML file. Every section except
//! `[tls]` is optional and falls back to the defaults below.
//!
//! ```toml
//! [tls]
//! cert_chain_path = "/etc/fleetrpc/server.pem"
//! key_path = "/etc/fleetrpc/server.key"
//! client_ca_path = "/etc/fleetrpc/clients-ca.pem"
//!
//! [listeners.binrpc]
//! bind = "0.0.0.0:6971"
//!
//! [listeners.grpc]
//! bind = "0.0.0.0:6972"
//! ```

use crate::adapters::{AdapterConfig, FleetMethod, MethodLimiter};
use crate::backend::memory::{FleetSeed, MemoryFleetSettings};
use crate::hub::stream::StreamOptions;
use crate::net::session::ListenerSettings;
use crate::net::tls::{TlsConfig, TlsVersion};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level fleetrpc configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identity and client trust.
    pub tls: TlsSection,

    /// One listener per transport.
    #[serde(default)]
    pub listeners: ListenersConfig,

    /// Watch stream tuning.
    #[serde(default)]
    pub updates: UpdatesConfig,

    /// Request limits and address rendering.
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Standalone mode: initial inventory of the in-memory backend.
    #[serde(default)]
    pub seed: FleetSeed,
}

/// TLS material shared by every listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    /// Server certificate chain (PEM).
    pub cert_chain_path: String,

    /// Server private key (PEM).
    pub key_path: String,

    /// CA bundle client certificates must chain to (PEM).
    pub client_ca_path: String,

    /// Handshake deadline in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// "1.2" or "1.3".
    #[serde(default = "default_min_tls_version")]
    pub min_version: String,
}

/// Listener configuration for the transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenersConfig {
    #[serde(default = "default_binrpc_listener")]
    pub binrpc: ListenerConfig,

    #[serde(default = "default_grpc_listener")]
    pub grpc: ListenerConfig,

    #[serde(default = "default_gateway_listener")]
    pub gateway: ListenerConfig,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            binrpc: default_binrpc_listener(),
            grpc: default_grpc_listener(),
            gateway: default_gateway_listener(),
        }
    }
}

/// One listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:6971").
    pub bind: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pending handshaken connections before accept backpressure.
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

impl ListenerConfig {
    fn new(bind: &str, enabled: bool) -> Self {
        Self {
            bind: bind.to_string(),
            enabled,
            backlog: default_backlog(),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address: {}", self.bind))
    }
}

/// Watch stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// Per-subscriber buffered events before the subscriber is dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Delay between the first unflushed event and the flush.
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Health heartbeat period in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Events written before a forced flush.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            flush_delay_ms: default_flush_delay_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            max_batch: default_max_batch(),
        }
    }
}

/// Request handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Port appended to hypervisor hostnames.
    #[serde(default = "default_hypervisor_port")]
    pub hypervisor_port: u16,

    /// Addresses per ListVmsInLocation chunk on binrpc.
    #[serde(default = "default_list_chunk_size")]
    pub list_chunk_size: usize,

    /// Largest binrpc frame or gateway body accepted.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest streamed image or user-data payload.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// In-memory backend: milliseconds a VM spends in a transitional state.
    #[serde(default)]
    pub transition_delay_ms: u64,

    /// Concurrent calls per user on methods reached through the public
    /// list, keyed by bare method name.
    #[serde(default = "default_per_user_limits")]
    pub per_user_limits: BTreeMap<String, usize>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            hypervisor_port: default_hypervisor_port(),
            list_chunk_size: default_list_chunk_size(),
            max_frame_bytes: default_max_frame_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
            transition_delay_ms: 0,
            per_user_limits: default_per_user_limits(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_min_tls_version() -> String {
    "1.2".to_string()
}

fn default_binrpc_listener() -> ListenerConfig {
    ListenerConfig::new("0.0.0.0:6971", true)
}

fn default_grpc_listener() -> ListenerConfig {
    ListenerConfig::new("0.0.0.0:6972", true)
}

fn default_gateway_listener() -> ListenerConfig {
    ListenerConfig::new("0.0.0.0:6973", false)
}

fn default_backlog() -> usize {
    128
}

fn default_channel_capacity() -> usize {
    crate::hub::DEFAULT_CHANNEL_CAPACITY
}

fn default_flush_delay_ms() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    15 * 60
}

fn default_max_batch() -> usize {
    64
}

fn default_hypervisor_port() -> u16 {
    6976
}

fn default_per_user_limits() -> BTreeMap<String, usize> {
    [("GetMachineInfo".to_string(), 1), ("GetUpdates".to_string(), 1)]
        .into_iter()
        .collect()
}

fn default_list_chunk_size() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_payload_bytes() -> u64 {
    64 * 1024 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if overrides.json_logs {
            self.telemetry.json = true;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_tls()?;
        self.validate_listeners()?;
        self.validate_updates()?;
        self.validate_rpc()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_tls(&self) -> Result<()> {
        let paths = [
            ("tls.cert_chain_path", &self.tls.cert_chain_path),
            ("tls.key_path", &self.tls.key_path),
            ("tls.client_ca_path", &self.tls.client_ca_path),
        ];
        for (name, path) in paths {
            if path.trim().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        if self.tls.handshake_timeout_ms == 0 {
            anyhow::bail!("tls.handshake_timeout_ms must be > 0");
        }
        self.min_tls_version()?;
        Ok(())
    }

    fn validate_listeners(&self) -> Result<()> {
        let mut enabled = 0;
        let mut seen: Vec<SocketAddr> = Vec::new();
        for (name, listener) in self.listeners.iter() {
            let addr = listener
                .bind_addr()
                .with_context(|| format!("listeners.{}.bind", name))?;
            if listener.backlog == 0 {
                anyhow::bail!("listeners.{}.backlog must be > 0", name);
            }
            if !listener.enabled {
                continue;
            }
            enabled += 1;
            if addr.port() != 0 && seen.contains(&addr) {
                anyhow::bail!("listeners.{}.bind {} is used by another listener", name, addr);
            }
            seen.push(addr);
        }
        if enabled == 0 {
            anyhow::bail!("at least one listener must be enabled");
        }
        Ok(())
    }

    fn validate_updates(&self) -> Result<()> {
        if self.updates.channel_capacity == 0 {
            anyhow::bail!("updates.channel_capacity must be > 0");
        }
        if self.updates.max_batch == 0 {
            anyhow::bail!("updates.max_batch must be > 0");
        }
        if self.updates.heartbeat_secs == 0 {
            anyhow::bail!("updates.heartbeat_secs must be > 0");
        }
        Ok(())
    }

    fn validate_rpc(&self) -> Result<()> {
        if self.rpc.list_chunk_size == 0 {
            anyhow::bail!("rpc.list_chunk_size must be > 0");
        }
        if self.rpc.max_frame_bytes < 1024 {
            anyhow::bail!(
                "rpc.max_frame_bytes must be at least 1024, got: {}",
                self.rpc.max_frame_bytes
            );
        }
        if self.rpc.max_payload_bytes == 0 {
            anyhow::bail!("rpc.max_payload_bytes must be > 0");
        }
        for (name, limit) in &self.rpc.per_user_limits {
            let Some(method) = FleetMethod::from_name(name) else {
                anyhow::bail!("rpc.per_user_limits: unknown method: {}", name);
            };
            if !method.is_public() {
                anyhow::bail!("rpc.per_user_limits: {} is not a public method", name);
            }
            if *limit == 0 {
                anyhow::bail!("rpc.per_user_limits.{} must be > 0", name);
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn min_tls_version(&self) -> Result<TlsVersion> {
        match self.tls.min_version.as_str() {
            "1.2" => Ok(TlsVersion::Tls12),
            "1.3" => Ok(TlsVersion::Tls13),
            other => anyhow::bail!("tls.min_version must be '1.2' or '1.3', got: {}", other),
        }
    }

    /// TLS file paths for the listener builder.
    pub fn tls_config(&self) -> Result<TlsConfig> {
        Ok(TlsConfig::new(
            &self.tls.cert_chain_path,
            &self.tls.key_path,
            &self.tls.client_ca_path,
        )
        .with_min_version(self.min_tls_version()?))
    }

    /// Settings for one listener.
    pub fn listener_settings(&self, protocol: &'static str, listener: &ListenerConfig) -> Result<ListenerSettings> {
        let mut settings = ListenerSettings::new(protocol, listener.bind_addr()?);
        settings.handshake_timeout = Duration::from_millis(self.tls.handshake_timeout_ms);
        settings.backlog = listener.backlog;
        Ok(settings)
    }

    /// Settings shared by the transport adapters.
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            hypervisor_port: self.rpc.hypervisor_port,
            list_chunk_size: self.rpc.list_chunk_size,
            max_frame_bytes: self.rpc.max_frame_bytes,
            max_payload_bytes: self.rpc.max_payload_bytes,
            stream: StreamOptions {
                flush_delay: Duration::from_millis(self.updates.flush_delay_ms),
                heartbeat_interval: Duration::from_secs(self.updates.heartbeat_secs),
                max_batch: self.updates.max_batch,
                max_updates: 0,
            },
            limiter: Arc::new(MethodLimiter::new(self.rpc.per_user_limits.iter().filter_map(
                |(name, limit)| FleetMethod::from_name(name).map(|method| (method, *limit)),
            ))),
        }
    }

    /// Settings for the standalone in-memory backend.
    pub fn memory_settings(&self) -> MemoryFleetSettings {
        MemoryFleetSettings {
            hypervisor_port: self.rpc.hypervisor_port,
            transition_delay: Duration::from_millis(self.rpc.transition_delay_ms),
            hub_capacity: self.updates.channel_capacity,
            ..MemoryFleetSettings::default()
        }
    }
}

impl ListenersConfig {
    /// Listeners with their section names.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ListenerConfig)> {
        [
            ("binrpc", &self.binrpc),
            ("grpc", &self.grpc),
            ("gateway", &self.gateway),
        ]
        .into_iter()
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Force JSON log output.
    pub json_logs: bool,
}
