//! Schema (protobuf over HTTP/2) adapter.
//!
//! Serves `fleetrpc.v1.Fleet` on the shared authenticated listener. Errors
//! are reported as gRPC status codes; list methods are paged with offset
//! tokens; `GetUpdates` is a server stream of [`proto::Update`] messages.
//!
//! ```text
//! /fleetrpc.v1.Fleet/<Method>
//!        │
//!        ▼
//! FleetGrpcServer ── identity, authorize ──► FleetGrpcService ──► FleetBackend
//! ```

pub mod convert;
pub mod proto;
mod server;
pub mod service;

pub use server::{decode_grpc_message, encode_grpc_message, FleetGrpcServer};
pub use service::FleetGrpcService;

/// Request path for a method.
pub fn method_path(method: crate::adapters::FleetMethod) -> String {
    format!("/{}/{}", proto::SERVICE, method.name())
}
