//! Runtime orchestration.
//!
//! One TLS server configuration is built up front and shared by every
//! listener; only the ALPN list differs per transport.
//!
//! ```text
//!   start:    TLS config → bind listeners → spawn accept loops → spawn servers
//!   shutdown: flip watch flag → accept loops close → servers drain
//! ```

use crate::adapters::binrpc::BinrpcServer;
use crate::adapters::gateway::Gateway;
use crate::adapters::grpc::{FleetGrpcServer, FleetGrpcService};
use crate::adapters::AdapterConfig;
use crate::backend::FleetBackend;
use crate::core::config::{Config, ListenerConfig};
use crate::net::session::TlsListener;
use crate::net::tls::{ServerTls, TlsServerBuilder};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `stop` waits for each server task to drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    Failed,
    Stopping,
    Stopped,
}

/// A bound listener and the task serving it.
struct ServerTask {
    protocol: &'static str,
    local_addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

/// fleetrpc runtime holding the backend and every serving task.
pub struct Runtime {
    config: Arc<Config>,
    backend: Arc<dyn FleetBackend>,
    adapter_config: Arc<AdapterConfig>,
    health: ComponentHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    servers: Vec<ServerTask>,
}

impl Runtime {
    /// Create a runtime over an already constructed backend.
    pub fn new(config: Config, backend: Arc<dyn FleetBackend>) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let adapter_config = Arc::new(config.adapter_config());

        Ok(Self {
            config: Arc::new(config),
            backend,
            adapter_config,
            health: ComponentHealth::Starting,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            servers: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn FleetBackend> {
        &self.backend
    }

    pub fn health(&self) -> ComponentHealth {
        self.health
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Address a started transport is bound to, by listener name.
    pub fn local_addr(&self, protocol: &str) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|s| s.protocol == protocol)
            .map(|s| s.local_addr)
    }

    /// Bind every enabled listener and start serving. A listener that cannot
    /// bind fails the whole start.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(backend_health = %self.backend.health_status(), "starting fleetrpc runtime");

        let tls = TlsServerBuilder::from_config(&self.config.tls_config()?)
            .context("failed to load TLS material")?
            .build()
            .context("failed to build TLS server config")?;

        let listeners: Vec<_> = self
            .config
            .listeners
            .iter()
            .filter(|(_, listener)| listener.enabled)
            .map(|(protocol, listener)| (protocol, listener.clone()))
            .collect();

        for (protocol, listener) in listeners {
            if let Err(e) = self.start_listener(protocol, &listener, &tls).await {
                self.health = ComponentHealth::Failed;
                let _ = self.shutdown_tx.send(true);
                return Err(e);
            }
        }

        self.health = ComponentHealth::Healthy;
        self.running.store(true, Ordering::Release);
        tracing::info!(listeners = self.servers.len(), "fleetrpc runtime started");
        Ok(())
    }

    async fn start_listener(
        &mut self,
        protocol: &'static str,
        listener: &ListenerConfig,
        tls: &ServerTls,
    ) -> Result<()> {
        let settings = self.config.listener_settings(protocol, listener)?;
        let bind_addr = settings.bind_addr;
        let server_config = match protocol {
            "grpc" => tls.with_alpn(&[b"h2".as_slice()]),
            "gateway" => tls.with_alpn(&[b"http/1.1".as_slice()]),
            _ => tls.config(),
        };

        let bound = TlsListener::bind(settings, server_config)
            .await
            .with_context(|| format!("failed to bind {} listener on {}", protocol, bind_addr))?;
        let local_addr = bound.local_addr();
        let incoming = bound.spawn(self.shutdown_rx.clone());

        let backend = self.backend.clone();
        let adapter_config = self.adapter_config.clone();
        let shutdown = self.shutdown_rx.clone();
        let handle = match protocol {
            "grpc" => {
                let service = FleetGrpcService::new(backend, adapter_config);
                tokio::spawn(FleetGrpcServer::new(service, shutdown).serve(incoming))
            }
            "gateway" => {
                let gateway = Gateway::new(FleetGrpcService::new(backend, adapter_config));
                tokio::spawn(async move {
                    gateway
                        .serve(incoming, shutdown)
                        .await
                        .context("HTTP gateway failed")
                })
            }
            _ => {
                let server = Arc::new(BinrpcServer::new(backend, adapter_config));
                tokio::spawn(async move {
                    server.serve(incoming, shutdown).await;
                    Ok(())
                })
            }
        };

        tracing::info!(protocol, %local_addr, "listener started");
        self.servers.push(ServerTask {
            protocol,
            local_addr,
            handle,
        });
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Start, then serve until Ctrl-C or an explicit shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = self.wait_for_shutdown() => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Signal shutdown and wait for every server task to finish.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping fleetrpc runtime");
        self.health = ComponentHealth::Stopping;
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        for server in self.servers.drain(..) {
            match tokio::time::timeout(STOP_TIMEOUT, server.handle).await {
                Ok(Ok(Ok(()))) => {
                    tracing::info!(protocol = server.protocol, "server stopped");
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(protocol = server.protocol, error = %e, "server stopped with error");
                }
                Ok(Err(e)) => {
                    tracing::warn!(protocol = server.protocol, error = %e, "server task panicked");
                }
                Err(_) => {
                    tracing::warn!(protocol = server.protocol, "server stop timed out");
                }
            }
        }

        self.health = ComponentHealth::Stopped;
        tracing::info!("fleetrpc runtime stopped");
        Ok(())
    }
}
