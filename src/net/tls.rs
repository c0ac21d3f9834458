//! TLS and mTLS configuration.
//!
//! Every listener requires a verified client certificate. The rustls server
//! configuration is built once at startup and shared by all transports;
//! each listener only varies the ALPN protocol list.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TLS Configuration                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │   TlsConfig        - File paths and requirements            │
//! │   TlsServerBuilder - Loads PEM material, builds ServerTls    │
//! │   ServerTls        - Shared rustls ServerConfig + ALPN      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("client CA rejected: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// TLS version floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

/// TLS file paths for the process.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_chain_path: PathBuf,
    pub key_path: PathBuf,
    /// CA bundle client certificates must chain to.
    pub client_ca_path: PathBuf,
    pub min_tls_version: TlsVersion,
}

impl TlsConfig {
    pub fn new(
        cert_chain_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        client_ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_chain_path: cert_chain_path.into(),
            key_path: key_path.into(),
            client_ca_path: client_ca_path.into(),
            min_tls_version: TlsVersion::Tls12,
        }
    }

    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_tls_version = version;
        self
    }
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build a root store from a CA bundle.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Builds the shared server configuration.
#[derive(Debug)]
pub struct TlsServerBuilder {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: RootCertStore,
    min_version: TlsVersion,
}

impl TlsServerBuilder {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: RootCertStore,
    ) -> Self {
        Self {
            certs,
            key,
            client_roots,
            min_version: TlsVersion::Tls12,
        }
    }

    /// Load all material named by a [`TlsConfig`].
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certs(&config.cert_chain_path)?;
        let key = load_private_key(&config.key_path)?;
        let roots = load_root_store(&config.client_ca_path)?;
        Ok(Self::new(certs, key, roots).min_version(config.min_tls_version))
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn build(self) -> Result<ServerTls, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(self.client_roots),
            provider.clone(),
        )
        .build()?;

        let versions: &[&'static rustls::SupportedProtocolVersion] = match self.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };

        let config = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs, self.key)?;

        Ok(ServerTls {
            base: Arc::new(config),
            provider,
        })
    }
}

/// Process-scoped server TLS state.
#[derive(Debug, Clone)]
pub struct ServerTls {
    base: Arc<ServerConfig>,
    provider: Arc<CryptoProvider>,
}

impl ServerTls {
    /// Shared configuration without ALPN.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.base.clone()
    }

    /// Configuration advertising the given ALPN protocols.
    pub fn with_alpn(&self, protocols: &[&[u8]]) -> Arc<ServerConfig> {
        let mut config = (*self.base).clone();
        config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }
}
