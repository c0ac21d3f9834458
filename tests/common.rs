//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.
#![allow(dead_code)]

use fleetrpc::backend::{FleetBackend, InMemoryFleet, MemoryFleetSettings};
use fleetrpc::core::config::Config;
use fleetrpc::model::{Machine, NetworkEntry, Subnet};
use fleetrpc::net::identity::{GROUP_LIST_OID, PERMITTED_METHODS_OID};
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// A throwaway CA with a server certificate written to disk.
pub struct TestPki {
    pub dir: TempDir,
    ca: rcgen::Certificate,
    ca_key: KeyPair,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

/// Client certificate material, DER encoded.
pub struct ClientIdentity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

fn oid_arcs(oid: &str) -> Vec<u64> {
    oid.split('.').map(|arc| arc.parse().unwrap()).collect()
}

fn dn(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "fleetrpc tests");
    dn.push(DnType::CommonName, cn);
    dn
}

fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write PEM file");
    path
}

impl TestPki {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = dn("fleetrpc test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.distinguished_name = dn("fleetrpc test server");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let cert_path = write_file(dir.path(), "server.pem", &server.pem());
        let key_path = write_file(dir.path(), "server.key", &server_key.serialize_pem());
        let ca_path = write_file(dir.path(), "ca.pem", &ca.pem());

        Self {
            dir,
            ca,
            ca_key,
            cert_path,
            key_path,
            ca_path,
        }
    }

    /// Issue a client certificate. `methods` of `None` omits the
    /// permitted-methods extension, which permits everything.
    pub fn client(&self, username: &str, groups: &[&str], methods: Option<&[&str]>) -> ClientIdentity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(username);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        if !groups.is_empty() {
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &oid_arcs(GROUP_LIST_OID),
                groups.join("\n").into_bytes(),
            ));
        }
        if let Some(methods) = methods {
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &oid_arcs(PERMITTED_METHODS_OID),
                methods.join("\n").into_bytes(),
            ));
        }
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        ClientIdentity {
            cert: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        }
    }

    /// Config text with every listener on an ephemeral loopback port.
    pub fn config_toml(&self, extra: &str) -> String {
        format!(
            r#"
[tls]
cert_chain_path = "{}"
key_path = "{}"
client_ca_path = "{}"

[listeners.binrpc]
bind = "127.0.0.1:0"

[listeners.grpc]
bind = "127.0.0.1:0"

[listeners.gateway]
bind = "127.0.0.1:0"
enabled = true

{}
"#,
            self.cert_path.display(),
            self.key_path.display(),
            self.ca_path.display(),
            extra
        )
    }

    pub fn config(&self, extra: &str) -> Config {
        Config::from_toml(&self.config_toml(extra)).expect("test config must be valid")
    }

    /// Rustls client configuration trusting the test CA.
    pub fn client_config(&self, identity: Option<&ClientIdentity>, alpn: &[&[u8]]) -> Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        let ca_der = CertificateDer::from(self.ca.der().to_vec());
        roots.add(ca_der).unwrap();
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
        let mut config = match identity {
            Some(id) => builder
                .with_client_auth_cert(vec![id.cert.clone()], id.key.clone_key())
                .unwrap(),
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }

    /// Open a TLS connection to `addr` as `identity`.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        identity: Option<&ClientIdentity>,
    ) -> std::io::Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.client_config(identity, &[]));
        let tcp = TcpStream::connect(addr).await?;
        let server_name = ServerName::try_from("localhost").unwrap();
        connector.connect(server_name, tcp).await
    }
}

/// Write a config to a temp file.
pub fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

/// Three healthy hypervisors on subnet `net-a`, owned by group `ops`.
pub fn sample_fleet() -> InMemoryFleet {
    sample_fleet_with(MemoryFleetSettings::default())
}

pub fn sample_fleet_with(settings: MemoryFleetSettings) -> InMemoryFleet {
    let fleet = InMemoryFleet::new(settings);
    fleet.add_subnet(Subnet {
        id: "net-a".into(),
        ip_gateway: Some("10.0.0.1".parse().unwrap()),
        ip_mask: Some("255.255.255.0".parse().unwrap()),
        domain_name: "fleet.test".into(),
        vlan_id: 12,
    });
    for (i, host) in ["hv1", "hv2", "hv3"].iter().enumerate() {
        fleet.add_machine(Machine {
            hostname: host.to_string(),
            location: "dc1/row1".into(),
            network_entry: NetworkEntry {
                hostname: host.to_string(),
                host_ip_address: Some(format!("10.1.0.{}", i + 1).parse().unwrap()),
                subnet_id: "net-a".into(),
                ..Default::default()
            },
            owner_groups: vec!["ops".into()],
            tags: [("rack".to_string(), format!("r{}", i + 1))].into_iter().collect(),
            ..Default::default()
        });
    }
    fleet
}

pub fn backend(fleet: &InMemoryFleet) -> Arc<dyn FleetBackend> {
    Arc::new(fleet.clone())
}
