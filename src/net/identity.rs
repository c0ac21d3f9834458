//! Caller identity derived from client certificates.
//!
//! Every transport terminates mutual TLS itself and hands the resulting
//! [`TlsSession`] to [`IdentityExtractor::extract`]. The derivation is pure:
//!
//! ```text
//!   TlsSession ─► leaf certificate ─► subject CN          ─► username
//!                                  ├► ext 9586.100.7.2    ─► group list
//!                                  └► ext 9586.100.7.1    ─► permitted methods
//! ```
//!
//! A missing session, a missing certificate or a certificate that cannot be
//! parsed for username and groups is an identity failure. An absent
//! permitted-methods extension is not: it means every method is permitted.

use crate::core::error::{FleetError, FleetResult};
use crate::net::session::TlsSession;
use rustls::pki_types::CertificateDer;
use std::collections::BTreeSet;
use std::fmt;
use x509_parser::certificate::X509Certificate;

/// Private extension carrying newline-separated `Service.Method` patterns.
pub const PERMITTED_METHODS_OID: &str = "1.3.6.1.4.1.9586.100.7.1";

/// Private extension carrying the newline-separated group list.
pub const GROUP_LIST_OID: &str = "1.3.6.1.4.1.9586.100.7.2";

/// Methods a caller may invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermittedMethods {
    /// No restriction recorded in the certificate.
    All,
    /// Only methods matching one of these `Service.Method` patterns.
    Only(BTreeSet<String>),
}

impl PermittedMethods {
    /// Check a method against the pattern set. `*` matches any service or
    /// any method name.
    pub fn permits(&self, service: &str, method: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(patterns) => patterns.iter().any(|pattern| {
                let Some((svc, m)) = pattern.split_once('.') else {
                    return false;
                };
                (svc == "*" || svc == service) && (m == "*" || m == method)
            }),
        }
    }
}

/// Normalized identity for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInformation {
    pub username: String,
    pub groups: BTreeSet<String>,
    pub permitted_methods: PermittedMethods,
}

impl AuthInformation {
    /// Identity with no groups and every method permitted.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: BTreeSet::new(),
            permitted_methods: PermittedMethods::All,
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permitted_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permitted_methods =
            PermittedMethods::Only(methods.into_iter().map(Into::into).collect());
        self
    }

    pub fn permits(&self, service: &str, method: &str) -> bool {
        self.permitted_methods.permits(service, method)
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Ownership check shared by backend implementations: the caller owns
    /// a resource when named directly or through any owner group.
    pub fn owns(&self, owner_users: &[String], owner_groups: &[String]) -> bool {
        owner_users.iter().any(|u| *u == self.username)
            || owner_groups.iter().any(|g| self.groups.contains(g))
    }
}

impl fmt::Display for AuthInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Derives [`AuthInformation`] from a TLS session.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl IdentityExtractor {
    /// Extract the caller identity.
    pub fn extract(session: Option<&TlsSession>) -> FleetResult<AuthInformation> {
        let session =
            session.ok_or_else(|| FleetError::unauthenticated("no TLS session for connection"))?;
        let certs = session
            .peer_certificates()
            .filter(|certs| !certs.is_empty())
            .ok_or_else(|| FleetError::unauthenticated("no client certificate presented"))?;
        let auth = Self::from_certificates(certs)?;
        tracing::debug!(
            username = %auth.username,
            groups = auth.groups.len(),
            remote = %session.remote_addr(),
            "extracted caller identity"
        );
        Ok(auth)
    }

    /// Derive identity from a verified chain; the leaf comes first.
    pub fn from_certificates(certs: &[CertificateDer<'_>]) -> FleetResult<AuthInformation> {
        let leaf = certs
            .first()
            .ok_or_else(|| FleetError::unauthenticated("no client certificate presented"))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).map_err(|e| {
            FleetError::unauthenticated(format!("unable to parse client certificate: {}", e))
        })?;

        let username = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .ok_or_else(|| FleetError::unauthenticated("client certificate has no common name"))?
            .to_string();

        let groups = match extension_lines(&parsed, GROUP_LIST_OID) {
            Some(Ok(lines)) => lines,
            Some(Err(_)) => {
                return Err(FleetError::unauthenticated(
                    "client certificate group list is not valid UTF-8",
                ))
            }
            None => BTreeSet::new(),
        };

        let permitted_methods = match extension_lines(&parsed, PERMITTED_METHODS_OID) {
            Some(Ok(lines)) => PermittedMethods::Only(lines),
            Some(Err(_)) => {
                tracing::warn!(
                    username = %username,
                    "unreadable permitted-methods extension; permitting nothing"
                );
                PermittedMethods::Only(BTreeSet::new())
            }
            None => PermittedMethods::All,
        };

        Ok(AuthInformation {
            username,
            groups,
            permitted_methods,
        })
    }
}

/// Read a newline-separated extension. `None` when absent.
fn extension_lines(
    cert: &X509Certificate<'_>,
    oid: &str,
) -> Option<Result<BTreeSet<String>, std::str::Utf8Error>> {
    let ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == oid)?;
    Some(std::str::from_utf8(ext.value).map(|text| {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }))
}
