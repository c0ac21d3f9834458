//! Protobuf messages for the `fleetrpc.v1.Fleet` service.
//!
//! Declared with `prost` derives instead of build-time codegen. The same
//! types back the JSON gateway, so they also carry serde derives; address
//! fields are bytes on the protobuf wire and text in JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fully qualified service name.
pub const SERVICE: &str = "fleetrpc.v1.Fleet";

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEntry {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "ip_text")]
    pub host_ip_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "mac_text")]
    pub host_mac_address: Vec<u8>,
    #[prost(string, tag = "4")]
    pub subnet_id: String,
    #[prost(bool, tag = "5")]
    pub vlan_trunk: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Machine {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, tag = "2")]
    pub location: String,
    #[prost(message, optional, tag = "3")]
    pub network_entry: Option<NetworkEntry>,
    #[prost(message, optional, tag = "4")]
    pub ipmi: Option<NetworkEntry>,
    #[prost(message, repeated, tag = "5")]
    pub secondary_network_entries: Vec<NetworkEntry>,
    #[prost(string, tag = "6")]
    pub gateway_subnet_id: String,
    #[prost(uint64, tag = "7")]
    pub memory_in_mib: u64,
    #[prost(uint32, tag = "8")]
    pub num_cpus: u32,
    #[prost(uint64, tag = "9")]
    pub total_volume_bytes: u64,
    #[prost(string, repeated, tag = "10")]
    pub owner_groups: Vec<String>,
    #[prost(string, repeated, tag = "11")]
    pub owner_users: Vec<String>,
    #[prost(btree_map = "string, string", tag = "12")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(string, tag = "2")]
    pub mac_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    #[prost(uint64, tag = "1")]
    pub size: u64,
    #[prost(string, tag = "2")]
    pub format: String,
}

/// VM lifecycle state; numbering matches the binary transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VmState {
    Starting = 0,
    Running = 1,
    FailedToStart = 2,
    Stopping = 3,
    Stopped = 4,
    Destroying = 5,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct VmInfo {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub image_name: String,
    #[prost(string, tag = "4")]
    pub image_url: String,
    #[prost(uint64, tag = "5")]
    pub memory_in_mib: u64,
    #[prost(uint32, tag = "6")]
    pub milli_cpus: u32,
    #[prost(string, repeated, tag = "7")]
    pub owner_groups: Vec<String>,
    #[prost(string, repeated, tag = "8")]
    pub owner_users: Vec<String>,
    #[prost(enumeration = "VmState", tag = "9")]
    pub state: i32,
    #[prost(string, tag = "10")]
    pub subnet_id: String,
    #[prost(message, repeated, tag = "11")]
    pub secondary_addresses: Vec<Address>,
    #[prost(string, repeated, tag = "12")]
    pub secondary_subnet_ids: Vec<String>,
    #[prost(btree_map = "string, string", tag = "13")]
    pub tags: BTreeMap<String, String>,
    #[prost(message, repeated, tag = "14")]
    pub volumes: Vec<Volume>,
    #[prost(bool, tag = "15")]
    pub destroy_protection: bool,
    #[prost(uint32, tag = "16")]
    pub virtual_cpus: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "ip_text")]
    pub ip_gateway: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "ip_text")]
    pub ip_mask: Vec<u8>,
    #[prost(string, tag = "4")]
    pub domain_name: String,
    #[prost(uint32, tag = "5")]
    pub vlan_id: u32,
}

/// Acceptable values for one tag key.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TagValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorTags {
    #[prost(btree_map = "string, string", tag = "1")]
    pub tags: BTreeMap<String, String>,
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Response for methods that return nothing.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Empty {}

/// Request naming one VM by address.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
}

/// Response carrying one VM.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct VmResponse {
    #[prost(message, optional, tag = "1")]
    pub vm: Option<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeMachineTagsRequest {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerOnMachineRequest {
    #[prost(string, tag = "1")]
    pub hostname: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetMachineInfoRequest {
    #[prost(string, tag = "1")]
    pub hostname: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetMachineInfoResponse {
    #[prost(string, tag = "1")]
    pub location: String,
    #[prost(message, optional, tag = "2")]
    pub machine: Option<Machine>,
    #[prost(message, repeated, tag = "3")]
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetHypervisorForVmResponse {
    #[prost(string, tag = "1")]
    pub hypervisor_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetIpInfoResponse {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub hypervisor_address: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub vm: Option<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListHypervisorLocationsRequest {
    #[prost(string, tag = "1")]
    pub top_location: String,
    #[prost(int32, tag = "2")]
    pub page_size: i32,
    #[prost(string, tag = "3")]
    pub page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListHypervisorLocationsResponse {
    #[prost(string, repeated, tag = "1")]
    pub locations: Vec<String>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListHypervisorsInLocationRequest {
    #[prost(string, tag = "1")]
    pub location: String,
    #[prost(string, tag = "2")]
    pub subnet_id: String,
    #[prost(btree_map = "string, message", tag = "3")]
    pub hypervisor_tags_to_match: BTreeMap<String, TagValues>,
    #[prost(bool, tag = "4")]
    pub include_unhealthy: bool,
    #[prost(string, repeated, tag = "5")]
    pub tags_to_include: Vec<String>,
    #[prost(int32, tag = "6")]
    pub page_size: i32,
    #[prost(string, tag = "7")]
    pub page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListHypervisorsInLocationResponse {
    #[prost(string, repeated, tag = "1")]
    pub hypervisor_addresses: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub tags_for_hypervisors: Vec<HypervisorTags>,
    #[prost(string, tag = "3")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListVmsInLocationRequest {
    #[prost(string, tag = "1")]
    pub location: String,
    #[prost(btree_map = "string, message", tag = "2")]
    pub hypervisor_tags_to_match: BTreeMap<String, TagValues>,
    #[prost(string, repeated, tag = "3")]
    pub owner_groups: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub owner_users: Vec<String>,
    #[prost(btree_map = "string, message", tag = "5")]
    pub vm_tags_to_match: BTreeMap<String, TagValues>,
    #[prost(int32, tag = "6")]
    pub page_size: i32,
    #[prost(string, tag = "7")]
    pub page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListVmsInLocationResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    #[serde(with = "ip_text_list")]
    pub ip_addresses: Vec<Vec<u8>>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSubnetsRequest {
    #[prost(bool, tag = "1")]
    pub sort: bool,
    #[prost(int32, tag = "2")]
    pub page_size: i32,
    #[prost(string, tag = "3")]
    pub page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListSubnetsResponse {
    #[prost(message, repeated, tag = "1")]
    pub subnets: Vec<Subnet>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateVmRequest {
    #[prost(message, optional, tag = "1")]
    pub vm_info: Option<VmInfo>,
    #[prost(uint64, tag = "2")]
    pub dhcp_timeout_ms: u64,
    #[prost(bool, tag = "3")]
    pub do_not_start: bool,
    /// Not supported on this transport.
    #[prost(uint64, tag = "4")]
    pub image_data_size: u64,
    /// Not supported on this transport; use `user_data`.
    #[prost(uint64, tag = "5")]
    pub user_data_size: u64,
    #[prost(bool, tag = "6")]
    pub secondary_volumes_data: bool,
    #[prost(message, repeated, tag = "7")]
    pub secondary_volumes: Vec<Volume>,
    #[prost(uint64, tag = "8")]
    pub minimum_free_bytes: u64,
    #[prost(bytes = "vec", tag = "9")]
    pub identity_certificate: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "11")]
    pub user_data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateVmResponse {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub dhcp_timed_out: bool,
    #[prost(message, optional, tag = "3")]
    pub vm: Option<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StartVmRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub dhcp_timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StartVmResponse {
    #[prost(bool, tag = "1")]
    pub dhcp_timed_out: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeVmTagsRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(btree_map = "string, string", tag = "2")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveIpAddressesRequest {
    #[prost(string, tag = "1")]
    pub hypervisor_hostname: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    #[serde(with = "ip_text_list")]
    pub ip_addresses: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetHypervisorsInLocationRequest {
    #[prost(string, tag = "1")]
    pub location: String,
    #[prost(string, tag = "2")]
    pub subnet_id: String,
    #[prost(btree_map = "string, message", tag = "3")]
    pub hypervisor_tags_to_match: BTreeMap<String, TagValues>,
    #[prost(bool, tag = "4")]
    pub include_unhealthy: bool,
    #[prost(bool, tag = "5")]
    pub include_vms: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Hypervisor {
    #[prost(message, optional, tag = "1")]
    pub machine: Option<Machine>,
    #[prost(uint64, tag = "2")]
    pub allocated_memory_in_mib: u64,
    #[prost(uint64, tag = "3")]
    pub allocated_milli_cpus: u64,
    #[prost(uint64, tag = "4")]
    pub allocated_volume_bytes: u64,
    #[prost(message, repeated, tag = "5")]
    pub vms: Vec<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetHypervisorsInLocationResponse {
    #[prost(message, repeated, tag = "1")]
    pub hypervisors: Vec<Hypervisor>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetCapacityRequest {
    #[prost(string, tag = "1")]
    pub hostname: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetCapacityResponse {
    #[prost(uint64, tag = "1")]
    pub memory_in_mib: u64,
    #[prost(uint32, tag = "2")]
    pub num_cpus: u32,
    #[prost(uint64, tag = "3")]
    pub total_volume_bytes: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootVmRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub dhcp_timeout_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootVmResponse {
    #[prost(bool, tag = "1")]
    pub dhcp_timed_out: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeVmOwnerUsersRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub owner_users: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeVmSizeRequest {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "ip_text")]
    pub ip_address: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub memory_in_mib: u64,
    #[prost(uint32, tag = "3")]
    pub milli_cpus: u32,
    #[prost(uint32, tag = "4")]
    pub virtual_cpus: u32,
}

/// VM selection for ListVms and GetVmInfos.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct VmQuery {
    #[prost(string, tag = "1")]
    pub hypervisor: String,
    #[prost(uint64, tag = "2")]
    pub ignore_state_mask: u64,
    #[prost(string, repeated, tag = "3")]
    pub owner_groups: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub owner_users: Vec<String>,
    #[prost(btree_map = "string, message", tag = "5")]
    pub vm_tags_to_match: BTreeMap<String, TagValues>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListVmsResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    #[serde(with = "ip_text_list")]
    pub ip_addresses: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetVmInfosResponse {
    #[prost(message, repeated, tag = "1")]
    pub vm_infos: Vec<VmInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetUpdatesRequest {
    #[prost(string, tag = "1")]
    pub location: String,
    #[prost(btree_map = "string, message", tag = "2")]
    pub tags_to_match: BTreeMap<String, TagValues>,
    /// Only VMs owned by this user; empty for all.
    #[prost(string, tag = "3")]
    pub owner: String,
}

/// One streamed update.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Update {
    #[prost(btree_map = "string, message", tag = "1")]
    pub changed_machines: BTreeMap<String, Machine>,
    #[prost(string, repeated, tag = "2")]
    pub deleted_machines: Vec<String>,
    #[prost(btree_map = "string, message", tag = "3")]
    pub changed_vms: BTreeMap<String, VmInfo>,
    #[prost(string, repeated, tag = "4")]
    pub deleted_vms: Vec<String>,
    #[prost(btree_map = "string, string", tag = "5")]
    pub vm_to_hypervisor: BTreeMap<String, String>,
    #[prost(string, optional, tag = "6")]
    pub health_status: Option<String>,
}

// ============================================================================
// JSON renderings of address bytes
// ============================================================================

fn ip_bytes_to_text(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
            std::net::Ipv4Addr::from(octets).to_string()
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => String::new(),
    }
}

fn ip_text_to_bytes(text: &str) -> Result<Vec<u8>, String> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    match text.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => Ok(v4.octets().to_vec()),
        Ok(std::net::IpAddr::V6(v6)) => Ok(v6.octets().to_vec()),
        Err(_) => Err(format!("invalid IP address: {}", text)),
    }
}

mod ip_text {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::ip_bytes_to_text(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::ip_text_to_bytes(&text).map_err(D::Error::custom)
    }
}

mod ip_text_list {
    use serde::ser::SerializeSeq;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(list.len()))?;
        for bytes in list {
            seq.serialize_element(&super::ip_bytes_to_text(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|text| super::ip_text_to_bytes(text).map_err(D::Error::custom))
            .collect()
    }
}

mod mac_text {
    use crate::model::MacAddress;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match MacAddress::from_bytes(bytes) {
            Some(mac) => serializer.serialize_str(&mac.to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        text.parse::<MacAddress>()
            .map(|mac| mac.octets().to_vec())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_json_renders_addresses_as_text() {
        let response = ListVmsInLocationResponse {
            ip_addresses: vec![vec![10, 0, 0, 5], vec![0; 16]],
            next_page_token: "2".into(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ip_addresses"][0], "10.0.0.5");
        assert_eq!(json["ip_addresses"][1], "::");

        let back: ListVmsInLocationResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_json_rejects_bad_address() {
        let err = serde_json::from_str::<VmRequest>(r#"{"ip_address":"10.0.0"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid IP address"));
        let empty: VmRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.ip_address.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_skipped_on_the_wire() {
        let entry = NetworkEntry {
            hostname: "hv1".into(),
            host_ip_address: vec![10, 1, 0, 1],
            host_mac_address: vec![0x52, 0x54, 0, 1, 2, 3],
            subnet_id: "net-a".into(),
            vlan_trunk: true,
        };
        let mut bytes = entry.encode_to_vec();
        // Field 9, varint 1: unknown to this schema.
        bytes.extend_from_slice(&[0x48, 0x01]);
        assert_eq!(NetworkEntry::decode(bytes.as_slice()).unwrap(), entry);
    }

    #[test]
    fn test_machine_info_request_skips_local_tags_flag() {
        let request = GetMachineInfoRequest { hostname: "hv1".into() };
        let mut bytes = request.encode_to_vec();
        // Field 2, varint 1: the local-tags flag older clients still send.
        bytes.extend_from_slice(&[0x10, 0x01]);
        assert_eq!(GetMachineInfoRequest::decode(bytes.as_slice()).unwrap(), request);
        let json: GetMachineInfoRequest =
            serde_json::from_str(r#"{"hostname":"hv1","ignore_missing_local_tags":true}"#).unwrap();
        assert_eq!(json, request);
    }
}
