//! Canonical domain records.
//!
//! Both transports convert their native messages into these shapes before
//! calling the backend, and back again afterwards. Nothing here knows about
//! wire formats; serde derives exist so the binary transport and the seed
//! section of the configuration file can carry them directly.

pub mod events;
pub mod requests;

pub use events::{ChangeEvent, UpdateFilter};
pub use requests::*;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Free-form key/value labels.
pub type Tags = BTreeMap<String, String>;

/// Tag predicate: every key must be present with one of the listed values.
/// An empty value list only requires the key to be present.
pub type MatchTags = BTreeMap<String, Vec<String>>;

/// Evaluate a [`MatchTags`] predicate against a tag set.
pub fn tags_match(tags: &Tags, matcher: &MatchTags) -> bool {
    matcher.iter().all(|(key, values)| match tags.get(key) {
        Some(value) => values.is_empty() || values.iter().any(|v| v == value),
        None => false,
    })
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse from raw bytes; exactly six are required.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address too short: {}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad MAC address octet {:?} in {}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address too long: {}", s));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One network attachment of a physical machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEntry {
    pub hostname: String,
    pub host_ip_address: Option<IpAddr>,
    pub host_mac_address: Option<MacAddress>,
    pub subnet_id: String,
    pub vlan_trunk: bool,
}

/// A physical machine (hypervisor) in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Machine {
    pub hostname: String,
    /// Slash-separated topology path, e.g. `dc1/row4/rack12`.
    pub location: String,
    pub network_entry: NetworkEntry,
    pub ipmi: NetworkEntry,
    pub secondary_network_entries: Vec<NetworkEntry>,
    pub gateway_subnet_id: String,
    pub memory_in_mib: u64,
    pub num_cpus: u32,
    pub total_volume_bytes: u64,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub tags: Tags,
}

/// VM lifecycle state. Numeric values are part of both wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VmState {
    #[default]
    Starting,
    Running,
    FailedToStart,
    Stopping,
    Stopped,
    Destroying,
}

impl VmState {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Starting => 0,
            Self::Running => 1,
            Self::FailedToStart => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Destroying => 5,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Starting),
            1 => Some(Self::Running),
            2 => Some(Self::FailedToStart),
            3 => Some(Self::Stopping),
            4 => Some(Self::Stopped),
            5 => Some(Self::Destroying),
            _ => None,
        }
    }

    /// States a mutation is still working towards.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping | Self::Destroying)
    }

    /// Whether `mask` (one bit per state number) excludes this state.
    pub fn masked_by(self, mask: u64) -> bool {
        mask & (1 << self.as_u32()) != 0
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::FailedToStart => "failed to start",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
        };
        f.write_str(name)
    }
}

/// A VM network address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub ip_address: Option<IpAddr>,
    pub mac_address: String,
}

/// A VM disk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub size: u64,
    pub format: String,
}

/// A virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmInfo {
    pub address: Address,
    pub hostname: String,
    pub image_name: String,
    pub image_url: String,
    pub memory_in_mib: u64,
    pub milli_cpus: u32,
    pub virtual_cpus: u32,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub state: VmState,
    pub subnet_id: String,
    pub secondary_addresses: Vec<Address>,
    pub secondary_subnet_ids: Vec<String>,
    pub tags: Tags,
    pub volumes: Vec<Volume>,
    pub destroy_protection: bool,
}

impl VmInfo {
    /// Primary address, when one has been assigned.
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.ip_address
    }
}

/// A subnet VMs may be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    pub id: String,
    pub ip_gateway: Option<IpAddr>,
    pub ip_mask: Option<IpAddr>,
    pub domain_name: String,
    pub vlan_id: u32,
}

/// Result of an IP address lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpInfo {
    /// Hypervisor the address is registered on.
    pub hypervisor_address: Option<IpAddr>,
    /// VM holding the address, if any.
    pub vm: Option<VmInfo>,
}
