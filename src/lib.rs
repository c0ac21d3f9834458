//! fleetrpc - control-plane RPC facade for fleet and hypervisor management.
//!
//! fleetrpc exposes one fleet API (machines, hypervisors, VMs, subnets and a
//! live update feed) over two concurrent transports: a length-prefixed
//! binary protocol and protobuf over HTTP/2, with an optional HTTP/JSON
//! gateway. Every transport authenticates callers from their mutual-TLS
//! client certificate and forwards to a single [`backend::FleetBackend`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Client Protocols                         │
//! │      binrpc (TLS)      │    gRPC (h2 + TLS)   │  HTTP/JSON (TLS) │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Transport Adapters                         │
//! │     identity │ authorization │ conversion │ status mapping      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         FleetBackend                            │
//! │        inventory │ VM lifecycle │ UpdateHub change events       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Listener orchestration and shutdown
//! - [`core::error`] - Typed fleet errors
//! - [`core::status`] - Status codes shared by every transport
//!
//! ## Domain
//! - [`model`] - Canonical request and record types
//! - [`backend`] - Backend contract and the in-memory reference backend
//! - [`hub`] - Update fan-out and the streaming pump
//!
//! ## Adapters
//! - [`adapters::binrpc`] - Binary RPC transport
//! - [`adapters::grpc`] - Protobuf transport
//! - [`adapters::gateway`] - HTTP/JSON gateway
//!
//! ## Networking
//! - [`net::tls`] - mTLS server configuration
//! - [`net::session`] - TLS listener and session state
//! - [`net::identity`] - Caller identity from client certificates
//!
//! # Key Invariants
//!
//! - Every method resolves the caller identity before touching the backend.
//! - The same backend failure maps to the same status code on every transport.
//! - An update stream never delivers an event that fails its filter.

// Core infrastructure
pub mod core;

// Domain model and backend contract
pub mod backend;
pub mod hub;
pub mod model;

// Transport adapters
pub mod adapters;

// Networking
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, status};
pub use net::{identity, tls};
