//! Transport adapters.
//!
//! Each adapter turns one wire protocol into calls on a
//! [`FleetBackend`](crate::backend::FleetBackend). Every method handler runs
//! the same steps regardless of transport:
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌─────────┐   ┌─────────┐   ┌──────────┐
//! │ authenticate │──►│ authorize │──►│ convert │──►│ backend │──►│ classify │
//! │ (per conn)   │   │ Fleet.X   │   │ to model│   │ (once)  │   │ errors   │
//! └──────────────┘   └───────────┘   └─────────┘   └─────────┘   └──────────┘
//! ```
//!
//! Currently implemented:
//! - [`binrpc`] - length-prefixed binary protocol with inline faults
//! - [`grpc`] - protobuf over HTTP/2 with status errors
//! - [`gateway`] - HTTP/JSON front for the protobuf handlers

use crate::core::error::{FleetError, FleetResult};
use crate::core::status::{Classification, StatusCode};
use crate::hub::stream::{StreamError, StreamOptions};
use crate::model::CreateVmRequest;
use crate::net::identity::AuthInformation;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

pub mod binrpc;
pub mod gateway;
pub mod grpc;
pub mod limiter;
pub mod pagination;

pub use limiter::{CallPermit, MethodLimiter};

/// Service name used in method authorization patterns.
pub const SERVICE_NAME: &str = "Fleet";

/// Target for audit records.
pub const AUDIT_TARGET: &str = "fleetrpc::audit";

/// Every RPC method the fleet service exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FleetMethod {
    ChangeMachineTags,
    PowerOnMachine,
    GetMachineInfo,
    MoveIpAddresses,
    GetCapacity,
    GetHypervisorForVm,
    GetIpInfo,
    ListHypervisorLocations,
    ListHypervisorsInLocation,
    ListVmsInLocation,
    ListSubnets,
    GetHypervisorsInLocation,
    ListVms,
    GetVmInfos,
    CreateVm,
    CreateVmAsync,
    DestroyVm,
    DestroyVmAsync,
    StartVm,
    StartVmAsync,
    StopVm,
    GetVmInfo,
    ChangeVmTags,
    RebootVm,
    ChangeVmOwnerUsers,
    ChangeVmSize,
    GetUpdates,
}

impl FleetMethod {
    pub const ALL: [FleetMethod; 27] = [
        Self::ChangeMachineTags,
        Self::PowerOnMachine,
        Self::GetMachineInfo,
        Self::MoveIpAddresses,
        Self::GetCapacity,
        Self::GetHypervisorForVm,
        Self::GetIpInfo,
        Self::ListHypervisorLocations,
        Self::ListHypervisorsInLocation,
        Self::ListVmsInLocation,
        Self::ListSubnets,
        Self::GetHypervisorsInLocation,
        Self::ListVms,
        Self::GetVmInfos,
        Self::CreateVm,
        Self::CreateVmAsync,
        Self::DestroyVm,
        Self::DestroyVmAsync,
        Self::StartVm,
        Self::StartVmAsync,
        Self::StopVm,
        Self::GetVmInfo,
        Self::ChangeVmTags,
        Self::RebootVm,
        Self::ChangeVmOwnerUsers,
        Self::ChangeVmSize,
        Self::GetUpdates,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ChangeMachineTags => "ChangeMachineTags",
            Self::PowerOnMachine => "PowerOnMachine",
            Self::GetMachineInfo => "GetMachineInfo",
            Self::MoveIpAddresses => "MoveIpAddresses",
            Self::GetCapacity => "GetCapacity",
            Self::GetHypervisorForVm => "GetHypervisorForVm",
            Self::GetIpInfo => "GetIpInfo",
            Self::ListHypervisorLocations => "ListHypervisorLocations",
            Self::ListHypervisorsInLocation => "ListHypervisorsInLocation",
            Self::ListVmsInLocation => "ListVmsInLocation",
            Self::ListSubnets => "ListSubnets",
            Self::GetHypervisorsInLocation => "GetHypervisorsInLocation",
            Self::ListVms => "ListVms",
            Self::GetVmInfos => "GetVmInfos",
            Self::CreateVm => "CreateVm",
            Self::CreateVmAsync => "CreateVmAsync",
            Self::DestroyVm => "DestroyVm",
            Self::DestroyVmAsync => "DestroyVmAsync",
            Self::StartVm => "StartVm",
            Self::StartVmAsync => "StartVmAsync",
            Self::StopVm => "StopVm",
            Self::GetVmInfo => "GetVmInfo",
            Self::ChangeVmTags => "ChangeVmTags",
            Self::RebootVm => "RebootVm",
            Self::ChangeVmOwnerUsers => "ChangeVmOwnerUsers",
            Self::ChangeVmSize => "ChangeVmSize",
            Self::GetUpdates => "GetUpdates",
        }
    }

    /// Look up a bare method name (`CreateVm`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Look up a qualified binrpc name (`Fleet.CreateVm`).
    pub fn from_qualified(name: &str) -> Option<Self> {
        name.strip_prefix(SERVICE_NAME)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(Self::from_name)
    }

    pub fn is_destroy(self) -> bool {
        matches!(self, Self::DestroyVm | Self::DestroyVmAsync)
    }

    /// Methods every authenticated caller may use, whatever their
    /// permitted-method list says.
    pub fn is_public(self) -> bool {
        matches!(
            self,
            Self::ChangeMachineTags
                | Self::GetHypervisorForVm
                | Self::GetHypervisorsInLocation
                | Self::GetIpInfo
                | Self::GetMachineInfo
                | Self::GetUpdates
                | Self::ListHypervisorLocations
                | Self::ListHypervisorsInLocation
                | Self::ListVmsInLocation
                | Self::PowerOnMachine
        )
    }
}

impl fmt::Display for FleetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", SERVICE_NAME, self.name())
    }
}

/// Settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Port appended to hypervisor hostnames.
    pub hypervisor_port: u16,
    /// Addresses per ListVmsInLocation chunk on binrpc.
    pub list_chunk_size: usize,
    /// Largest binrpc frame accepted.
    pub max_frame_bytes: usize,
    /// Largest streamed image or user-data payload accepted.
    pub max_payload_bytes: u64,
    /// Watch stream tuning.
    pub stream: StreamOptions,
    /// Per-user concurrency limits on public methods.
    pub limiter: Arc<MethodLimiter>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            hypervisor_port: 6976,
            list_chunk_size: 256,
            max_frame_bytes: 16 * 1024 * 1024,
            max_payload_bytes: 64 * 1024 * 1024 * 1024,
            stream: StreamOptions::default(),
            limiter: Arc::new(MethodLimiter::default()),
        }
    }
}

impl AdapterConfig {
    /// Render a hypervisor hostname as a dialable address.
    pub fn hypervisor_address(&self, hostname: &str) -> String {
        format!("{}:{}", hostname, self.hypervisor_port)
    }
}

/// How a caller was let through to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The caller's permitted methods grant it.
    Permitted,
    /// Granted only because the method is public.
    Public,
}

/// Check that `auth` may call `method`.
pub fn authorize(auth: &AuthInformation, method: FleetMethod) -> FleetResult<Access> {
    if auth.permits(SERVICE_NAME, method.name()) {
        Ok(Access::Permitted)
    } else if method.is_public() {
        Ok(Access::Public)
    } else {
        tracing::debug!(username = %auth.username, %method, "method not permitted");
        Err(FleetError::permission_denied(
            SERVICE_NAME,
            method.name(),
            format!("{} may not call {}", auth.username, method),
        ))
    }
}

/// Async create forms cannot take payloads streamed after the request.
pub fn reject_streamed_payload(request: &CreateVmRequest) -> Result<(), Classification> {
    if request.image_data_size > 0 {
        return Err(Classification::new(
            StatusCode::Unimplemented,
            "ImageDataSize not supported for async create",
        ));
    }
    if request.user_data_size > 0 {
        return Err(Classification::new(
            StatusCode::Unimplemented,
            "UserDataSize not supported for async create",
        ));
    }
    if request.secondary_volumes_data {
        return Err(Classification::new(
            StatusCode::Unimplemented,
            "SecondaryVolumesData not supported for async create",
        ));
    }
    Ok(())
}

/// Status reported when an update stream fails.
pub fn stream_error_status(error: &StreamError) -> Classification {
    let code = match error {
        StreamError::Backpressure => StatusCode::ResourceExhausted,
        StreamError::Decode(_) => StatusCode::InvalidArgument,
        StreamError::Encode(_) | StreamError::Flush(_) => StatusCode::Internal,
    };
    Classification::new(code, error.to_string())
}

/// Audit record for the start of a destroy.
pub fn audit_destroy_start(transport: &str, method: FleetMethod, auth: &AuthInformation, ip: IpAddr) {
    tracing::info!(
        target: AUDIT_TARGET,
        transport,
        %method,
        username = %auth.username,
        %ip,
        "destroy requested"
    );
}

/// Audit record for the outcome of a destroy.
pub fn audit_destroy_outcome(
    transport: &str,
    method: FleetMethod,
    auth: &AuthInformation,
    ip: IpAddr,
    error: Option<&Classification>,
) {
    match error {
        None => tracing::info!(
            target: AUDIT_TARGET,
            transport,
            %method,
            username = %auth.username,
            %ip,
            "destroy accepted"
        ),
        Some(c) => tracing::info!(
            target: AUDIT_TARGET,
            transport,
            %method,
            username = %auth.username,
            %ip,
            code = %c.code,
            error = %c.message,
            "destroy failed"
        ),
    }
}
