//! Conversions between protobuf messages and domain records.
//!
//! Inbound conversions validate: an address field must be empty, 4 or 16
//! bytes, a MAC 0 or 6 bytes, and a state one of the known values.
//! Outbound conversions are total.

use super::proto;
use crate::core::error::{FleetError, FleetResult};
use crate::model::{self, MacAddress, MatchTags};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

// ============================================================================
// Scalars
// ============================================================================

/// Decode an address field. Empty means unset.
pub fn ip_from_bytes(field: &str, bytes: &[u8]) -> FleetResult<Option<IpAddr>> {
    match bytes.len() {
        0 => Ok(None),
        4 => {
            let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
            Ok(Some(IpAddr::V4(Ipv4Addr::from(octets))))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(Some(IpAddr::V6(Ipv6Addr::from(octets))))
        }
        n => Err(FleetError::invalid_argument(
            field,
            format!("IP address must be 4 or 16 bytes, got {}", n),
        )),
    }
}

/// Decode an address field that must be set.
pub fn require_ip(field: &str, bytes: &[u8]) -> FleetResult<IpAddr> {
    ip_from_bytes(field, bytes)?.ok_or_else(|| FleetError::invalid_argument(field, "IP address is required"))
}

pub fn ip_to_bytes(ip: Option<IpAddr>) -> Vec<u8> {
    match ip {
        Some(IpAddr::V4(v4)) => v4.octets().to_vec(),
        Some(IpAddr::V6(v6)) => v6.octets().to_vec(),
        None => Vec::new(),
    }
}

pub fn mac_from_bytes(field: &str, bytes: &[u8]) -> FleetResult<Option<MacAddress>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    MacAddress::from_bytes(bytes).map(Some).ok_or_else(|| {
        FleetError::invalid_argument(field, format!("MAC address must be 6 bytes, got {}", bytes.len()))
    })
}

pub fn vm_state_to_proto(state: model::VmState) -> i32 {
    state.as_u32() as i32
}

pub fn vm_state_from_proto(value: i32) -> FleetResult<model::VmState> {
    u32::try_from(value)
        .ok()
        .and_then(model::VmState::from_u32)
        .ok_or_else(|| FleetError::invalid_argument("state", format!("unknown VM state {}", value)))
}

pub fn match_tags_from_proto(tags: BTreeMap<String, proto::TagValues>) -> MatchTags {
    tags.into_iter().map(|(key, values)| (key, values.values)).collect()
}

pub fn match_tags_to_proto(tags: MatchTags) -> BTreeMap<String, proto::TagValues> {
    tags.into_iter()
        .map(|(key, values)| (key, proto::TagValues { values }))
        .collect()
}

// ============================================================================
// Records
// ============================================================================

impl From<model::NetworkEntry> for proto::NetworkEntry {
    fn from(entry: model::NetworkEntry) -> Self {
        Self {
            hostname: entry.hostname,
            host_ip_address: ip_to_bytes(entry.host_ip_address),
            host_mac_address: entry
                .host_mac_address
                .map(|mac| mac.octets().to_vec())
                .unwrap_or_default(),
            subnet_id: entry.subnet_id,
            vlan_trunk: entry.vlan_trunk,
        }
    }
}

impl TryFrom<proto::NetworkEntry> for model::NetworkEntry {
    type Error = FleetError;

    fn try_from(entry: proto::NetworkEntry) -> FleetResult<Self> {
        Ok(Self {
            host_ip_address: ip_from_bytes("host_ip_address", &entry.host_ip_address)?,
            host_mac_address: mac_from_bytes("host_mac_address", &entry.host_mac_address)?,
            hostname: entry.hostname,
            subnet_id: entry.subnet_id,
            vlan_trunk: entry.vlan_trunk,
        })
    }
}

impl From<model::Machine> for proto::Machine {
    fn from(machine: model::Machine) -> Self {
        Self {
            hostname: machine.hostname,
            location: machine.location,
            network_entry: Some(machine.network_entry.into()),
            ipmi: Some(machine.ipmi.into()),
            secondary_network_entries: machine
                .secondary_network_entries
                .into_iter()
                .map(Into::into)
                .collect(),
            gateway_subnet_id: machine.gateway_subnet_id,
            memory_in_mib: machine.memory_in_mib,
            num_cpus: machine.num_cpus,
            total_volume_bytes: machine.total_volume_bytes,
            owner_groups: machine.owner_groups,
            owner_users: machine.owner_users,
            tags: machine.tags,
        }
    }
}

impl TryFrom<proto::Machine> for model::Machine {
    type Error = FleetError;

    fn try_from(machine: proto::Machine) -> FleetResult<Self> {
        Ok(Self {
            hostname: machine.hostname,
            location: machine.location,
            network_entry: machine.network_entry.map(TryInto::try_into).transpose()?.unwrap_or_default(),
            ipmi: machine.ipmi.map(TryInto::try_into).transpose()?.unwrap_or_default(),
            secondary_network_entries: machine
                .secondary_network_entries
                .into_iter()
                .map(TryInto::try_into)
                .collect::<FleetResult<_>>()?,
            gateway_subnet_id: machine.gateway_subnet_id,
            memory_in_mib: machine.memory_in_mib,
            num_cpus: machine.num_cpus,
            total_volume_bytes: machine.total_volume_bytes,
            owner_groups: machine.owner_groups,
            owner_users: machine.owner_users,
            tags: machine.tags,
        })
    }
}

impl From<model::Address> for proto::Address {
    fn from(address: model::Address) -> Self {
        Self {
            ip_address: ip_to_bytes(address.ip_address),
            mac_address: address.mac_address,
        }
    }
}

impl TryFrom<proto::Address> for model::Address {
    type Error = FleetError;

    fn try_from(address: proto::Address) -> FleetResult<Self> {
        Ok(Self {
            ip_address: ip_from_bytes("ip_address", &address.ip_address)?,
            mac_address: address.mac_address,
        })
    }
}

impl From<model::Volume> for proto::Volume {
    fn from(volume: model::Volume) -> Self {
        Self {
            size: volume.size,
            format: volume.format,
        }
    }
}

impl From<proto::Volume> for model::Volume {
    fn from(volume: proto::Volume) -> Self {
        Self {
            size: volume.size,
            format: volume.format,
        }
    }
}

impl From<model::VmInfo> for proto::VmInfo {
    fn from(vm: model::VmInfo) -> Self {
        Self {
            address: Some(vm.address.into()),
            hostname: vm.hostname,
            image_name: vm.image_name,
            image_url: vm.image_url,
            memory_in_mib: vm.memory_in_mib,
            milli_cpus: vm.milli_cpus,
            virtual_cpus: vm.virtual_cpus,
            owner_groups: vm.owner_groups,
            owner_users: vm.owner_users,
            state: vm_state_to_proto(vm.state),
            subnet_id: vm.subnet_id,
            secondary_addresses: vm.secondary_addresses.into_iter().map(Into::into).collect(),
            secondary_subnet_ids: vm.secondary_subnet_ids,
            tags: vm.tags,
            volumes: vm.volumes.into_iter().map(Into::into).collect(),
            destroy_protection: vm.destroy_protection,
        }
    }
}

impl TryFrom<proto::VmInfo> for model::VmInfo {
    type Error = FleetError;

    fn try_from(vm: proto::VmInfo) -> FleetResult<Self> {
        Ok(Self {
            address: vm.address.map(TryInto::try_into).transpose()?.unwrap_or_default(),
            hostname: vm.hostname,
            image_name: vm.image_name,
            image_url: vm.image_url,
            memory_in_mib: vm.memory_in_mib,
            milli_cpus: vm.milli_cpus,
            virtual_cpus: vm.virtual_cpus,
            owner_groups: vm.owner_groups,
            owner_users: vm.owner_users,
            state: vm_state_from_proto(vm.state)?,
            subnet_id: vm.subnet_id,
            secondary_addresses: vm
                .secondary_addresses
                .into_iter()
                .map(TryInto::try_into)
                .collect::<FleetResult<_>>()?,
            secondary_subnet_ids: vm.secondary_subnet_ids,
            tags: vm.tags,
            volumes: vm.volumes.into_iter().map(Into::into).collect(),
            destroy_protection: vm.destroy_protection,
        })
    }
}

impl From<model::Subnet> for proto::Subnet {
    fn from(subnet: model::Subnet) -> Self {
        Self {
            id: subnet.id,
            ip_gateway: ip_to_bytes(subnet.ip_gateway),
            ip_mask: ip_to_bytes(subnet.ip_mask),
            domain_name: subnet.domain_name,
            vlan_id: subnet.vlan_id,
        }
    }
}

impl TryFrom<proto::Subnet> for model::Subnet {
    type Error = FleetError;

    fn try_from(subnet: proto::Subnet) -> FleetResult<Self> {
        Ok(Self {
            ip_gateway: ip_from_bytes("ip_gateway", &subnet.ip_gateway)?,
            ip_mask: ip_from_bytes("ip_mask", &subnet.ip_mask)?,
            id: subnet.id,
            domain_name: subnet.domain_name,
            vlan_id: subnet.vlan_id,
        })
    }
}

impl From<model::ChangeEvent> for proto::Update {
    fn from(event: model::ChangeEvent) -> Self {
        Self {
            changed_machines: event
                .changed_machines
                .into_iter()
                .map(|(host, machine)| (host, machine.into()))
                .collect(),
            deleted_machines: event.deleted_machines,
            changed_vms: event
                .changed_vms
                .into_iter()
                .map(|(ip, vm)| (ip, vm.into()))
                .collect(),
            deleted_vms: event.deleted_vms,
            vm_to_hypervisor: event.vm_to_hypervisor,
            health_status: event.health_status,
        }
    }
}

impl From<model::Hypervisor> for proto::Hypervisor {
    fn from(hypervisor: model::Hypervisor) -> Self {
        Self {
            machine: Some(hypervisor.machine.into()),
            allocated_memory_in_mib: hypervisor.allocated_memory_in_mib,
            allocated_milli_cpus: hypervisor.allocated_milli_cpus,
            allocated_volume_bytes: hypervisor.allocated_volume_bytes,
            vms: hypervisor.vms.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

pub fn vm_query(query: proto::VmQuery) -> model::VmQuery {
    model::VmQuery {
        hypervisor: query.hypervisor,
        ignore_state_mask: query.ignore_state_mask,
        owner_groups: query.owner_groups,
        owner_users: query.owner_users,
        vm_tags_to_match: match_tags_from_proto(query.vm_tags_to_match),
    }
}

pub fn ip_list(field: &str, addresses: &[Vec<u8>]) -> FleetResult<Vec<IpAddr>> {
    addresses.iter().map(|bytes| require_ip(field, bytes)).collect()
}

pub fn create_vm_request(request: proto::CreateVmRequest) -> FleetResult<model::CreateVmRequest> {
    let vm_info = match request.vm_info {
        Some(vm) => vm.try_into()?,
        None => return Err(FleetError::invalid_argument("vm_info", "VM description is required")),
    };
    Ok(model::CreateVmRequest {
        vm_info,
        dhcp_timeout: Duration::from_millis(request.dhcp_timeout_ms),
        do_not_start: request.do_not_start,
        image_data_size: request.image_data_size,
        user_data_size: request.user_data_size,
        secondary_volumes_data: request.secondary_volumes_data,
        secondary_volumes: request.secondary_volumes.into_iter().map(Into::into).collect(),
        minimum_free_bytes: request.minimum_free_bytes,
        identity_certificate: request.identity_certificate,
        identity_key: request.identity_key,
        image_data: Vec::new(),
        user_data: request.user_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::StatusCode;

    #[test]
    fn test_ip_length_validation() {
        assert_eq!(ip_from_bytes("ip", &[]).unwrap(), None);
        assert_eq!(
            ip_from_bytes("ip", &[10, 0, 0, 1]).unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(ip_from_bytes("ip", &[0; 16]).unwrap(), Some("::".parse().unwrap()));
        let err = ip_from_bytes("ip", &[10, 0, 0]).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(require_ip("ip", &[]).unwrap_err().code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_network_entry_keeps_every_field() {
        let entry = model::NetworkEntry {
            hostname: "hv1-ipmi".into(),
            host_ip_address: Some("10.9.0.7".parse().unwrap()),
            host_mac_address: Some(MacAddress([0x52, 0x54, 0, 0xaa, 0xbb, 0xcc])),
            subnet_id: "mgmt".into(),
            vlan_trunk: true,
        };
        let wire: proto::NetworkEntry = entry.clone().into();
        assert_eq!(wire.host_mac_address.len(), 6);
        assert_eq!(model::NetworkEntry::try_from(wire).unwrap(), entry);

        let bad = proto::NetworkEntry {
            host_mac_address: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(model::NetworkEntry::try_from(bad).is_err());
    }

    #[test]
    fn test_vm_state_validation() {
        let vm = proto::VmInfo {
            state: 42,
            ..Default::default()
        };
        let err = model::VmInfo::try_from(vm).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert_eq!(vm_state_from_proto(proto::VmState::Stopped as i32).unwrap(), model::VmState::Stopped);
    }

    #[test]
    fn test_create_requires_vm_info() {
        let err = create_vm_request(proto::CreateVmRequest::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        let request = proto::CreateVmRequest {
            vm_info: Some(proto::VmInfo {
                subnet_id: "net-a".into(),
                ..Default::default()
            }),
            dhcp_timeout_ms: 1500,
            user_data: b"#cloud-config".to_vec(),
            ..Default::default()
        };
        let request = create_vm_request(request).unwrap();
        assert_eq!(request.dhcp_timeout, Duration::from_millis(1500));
        assert_eq!(request.user_data, b"#cloud-config");
        assert_eq!(request.vm_info.subnet_id, "net-a");
    }

    #[test]
    fn test_empty_event_converts_to_empty_update() {
        let update: proto::Update = model::ChangeEvent::default().into();
        assert_eq!(update, proto::Update::default());
    }
}
