//! Core runtime infrastructure.
//!
//! This module contains the essential components for running fleetrpc:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Listener orchestration and shutdown
//! - [`error`] - Typed fleet errors
//! - [`status`] - Status classification for typed and legacy errors
//! - [`telemetry`] - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod runtime;
pub mod status;
pub mod telemetry;
