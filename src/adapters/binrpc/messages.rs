//! Wire messages.
//!
//! A call is a [`CallHeader`] frame, answered by a [`CallAck`]. When the
//! ack carries no fault the method's request frame follows and the server
//! answers with one or more [`Reply`] frames. Failures travel inline in the
//! `error` field; they never close the connection.

use crate::core::status::{Classification, StatusCode};
use crate::model::{MatchTags, Tags, UpdateFilter, VmInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Names the method the next request frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    /// Qualified name, `Fleet.<Method>`.
    pub method: String,
}

/// Answer to a [`CallHeader`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAck {
    pub error: Option<Fault>,
}

/// An inline failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: StatusCode,
    pub message: String,
}

impl From<Classification> for Fault {
    fn from(c: Classification) -> Self {
        Self {
            code: c.code,
            message: c.message,
        }
    }
}

impl From<Fault> for Classification {
    fn from(fault: Fault) -> Self {
        Classification::new(fault.code, fault.message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

/// Response frame. `body` is the default value whenever `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply<T> {
    pub error: Option<Fault>,
    pub body: T,
}

impl<T: Default> Reply<T> {
    pub fn ok(body: T) -> Self {
        Self { error: None, body }
    }

    pub fn fault(fault: impl Into<Fault>) -> Self {
        Self {
            error: Some(fault.into()),
            body: T::default(),
        }
    }

    pub fn from_result(result: Result<T, Classification>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(c) => Self::fault(c),
        }
    }
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, Fault> {
        match self.error {
            Some(fault) => Err(fault),
            None => Ok(self.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerOnMachineRequest {
    pub hostname: String,
}

/// Request naming one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmAddressRequest {
    pub ip_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartVmRequest {
    pub ip_address: IpAddr,
    /// Zero selects the backend default.
    pub dhcp_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootVmRequest {
    pub ip_address: IpAddr,
    /// Zero selects the backend default.
    pub dhcp_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVmOwnerUsersRequest {
    pub ip_address: IpAddr,
    pub owner_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVmTagsRequest {
    pub ip_address: IpAddr,
    pub tags: Tags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorAddress {
    /// `host:port`.
    pub address: String,
}

/// One ListVmsInLocation chunk; an empty chunk ends the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmChunk {
    pub ip_addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmReply {
    pub ip_address: Option<IpAddr>,
    pub dhcp_timed_out: bool,
    pub vm: VmInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesRequest {
    /// Location prefix; empty watches everything.
    pub location: String,
    pub tags: MatchTags,
    /// Only VMs this user owns.
    pub owner: Option<String>,
    /// Updates to send before closing; zero streams until disconnect.
    pub max_updates: u64,
}

impl GetUpdatesRequest {
    pub fn filter(&self) -> UpdateFilter {
        UpdateFilter {
            location: self.location.clone(),
            tags: self.tags.clone(),
            owner: self.owner.clone(),
        }
    }
}

/// Sent by the client on an open update stream to ask for a health reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest;
