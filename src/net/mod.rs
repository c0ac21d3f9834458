//! Networking layer.
//!
//! This module handles network transport and security:
//! - [`tls`] - Shared mTLS server configuration
//! - [`session`] - TLS listener and per-connection session state
//! - [`identity`] - Caller identity derived from client certificates

pub mod identity;
pub mod session;
pub mod tls;
