//! Canonical request and response shapes shared by every transport.

use super::{tags_match, Machine, MatchTags, Subnet, Tags, VmInfo, Volume};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Replace a machine's tags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeMachineTagsRequest {
    pub hostname: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetMachineInfoRequest {
    pub hostname: String,
}

/// A machine together with its placement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineInfo {
    pub location: String,
    pub machine: Machine,
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListHypervisorLocationsRequest {
    /// Only locations under this prefix; empty lists all.
    pub top_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListHypervisorsInLocationRequest {
    pub location: String,
    pub subnet_id: String,
    pub hypervisor_tags_to_match: MatchTags,
    pub include_unhealthy: bool,
    /// Tag keys to report back for each hypervisor.
    pub tags_to_include: Vec<String>,
}

/// Hypervisor addresses with the requested subset of their tags, index
/// aligned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HypervisorsInLocation {
    pub hypervisor_addresses: Vec<String>,
    pub tags_for_hypervisors: Vec<Tags>,
}

/// Full hypervisor records in a location.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetHypervisorsInLocationRequest {
    pub location: String,
    pub subnet_id: String,
    pub hypervisor_tags_to_match: MatchTags,
    pub include_unhealthy: bool,
    pub include_vms: bool,
}

/// A hypervisor with the resources its VMs hold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hypervisor {
    pub machine: Machine,
    pub allocated_memory_in_mib: u64,
    pub allocated_milli_cpus: u64,
    pub allocated_volume_bytes: u64,
    /// Empty unless requested.
    pub vms: Vec<VmInfo>,
}

/// Register addresses on a hypervisor ahead of VM creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MoveIpAddressesRequest {
    pub hypervisor_hostname: String,
    pub ip_addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListVmsInLocationRequest {
    pub location: String,
    pub hypervisor_tags_to_match: MatchTags,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub vm_tags_to_match: MatchTags,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListSubnetsRequest {
    /// Sort by subnet id.
    pub sort: bool,
}

/// Create a VM.
///
/// `image_data_size` and `user_data_size` announce payloads streamed after
/// the request on the binary transport; the transport fills `image_data`
/// and `user_data` before the backend sees the request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub vm_info: VmInfo,
    /// Zero selects the backend default.
    pub dhcp_timeout: Duration,
    pub do_not_start: bool,
    pub image_data_size: u64,
    pub user_data_size: u64,
    pub secondary_volumes_data: bool,
    pub secondary_volumes: Vec<Volume>,
    pub minimum_free_bytes: u64,
    pub identity_certificate: Vec<u8>,
    pub identity_key: Vec<u8>,
    #[serde(skip)]
    pub image_data: Vec<u8>,
    #[serde(skip)]
    pub user_data: Vec<u8>,
}

impl CreateVmRequest {
    /// Whether the request depends on payloads streamed after it.
    pub fn streams_payload(&self) -> bool {
        self.image_data_size > 0 || self.user_data_size > 0 || self.secondary_volumes_data
    }
}

/// Result of a synchronous create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmOutcome {
    pub ip_address: IpAddr,
    pub dhcp_timed_out: bool,
    pub vm: VmInfo,
}

/// Result of a synchronous start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartVmOutcome {
    pub dhcp_timed_out: bool,
}

/// Resize a stopped VM. Zero fields keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVmSizeRequest {
    pub ip_address: IpAddr,
    pub memory_in_mib: u64,
    pub milli_cpus: u32,
    pub virtual_cpus: u32,
}

/// Hardware a hypervisor offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub memory_in_mib: u64,
    pub num_cpus: u32,
    pub total_volume_bytes: u64,
}

/// VM selection shared by ListVms and GetVmInfos.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmQuery {
    /// Only VMs on this hypervisor; empty selects every hypervisor.
    pub hypervisor: String,
    /// Bit `1 << state` set skips VMs in that state.
    pub ignore_state_mask: u64,
    pub owner_groups: Vec<String>,
    pub owner_users: Vec<String>,
    pub vm_tags_to_match: MatchTags,
}

impl VmQuery {
    pub fn selects(&self, vm: &VmInfo) -> bool {
        let owner_filtered = !self.owner_users.is_empty() || !self.owner_groups.is_empty();
        !vm.state.masked_by(self.ignore_state_mask)
            && tags_match(&vm.tags, &self.vm_tags_to_match)
            && (!owner_filtered
                || vm.owner_users.iter().any(|u| self.owner_users.contains(u))
                || vm.owner_groups.iter().any(|g| self.owner_groups.contains(g)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VmState;

    fn vm(state: VmState, owner: &str, group: &str, role: &str) -> VmInfo {
        VmInfo {
            state,
            owner_users: vec![owner.into()],
            owner_groups: vec![group.into()],
            tags: [("role".to_string(), role.to_string())].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_vm_query_selects() {
        let web = vm(VmState::Running, "alice", "ops", "web");
        let stopped = vm(VmState::Stopped, "bob", "dev", "db");
        assert!(VmQuery::default().selects(&web));
        assert!(VmQuery::default().selects(&stopped));

        let skip_stopped = VmQuery {
            ignore_state_mask: 1 << VmState::Stopped.as_u32(),
            ..Default::default()
        };
        assert!(skip_stopped.selects(&web));
        assert!(!skip_stopped.selects(&stopped));

        // Owner users and groups widen each other.
        let owners = VmQuery {
            owner_users: vec!["bob".into()],
            owner_groups: vec!["ops".into()],
            ..Default::default()
        };
        assert!(owners.selects(&web));
        assert!(owners.selects(&stopped));
        let only_carol = VmQuery {
            owner_users: vec!["carol".into()],
            ..Default::default()
        };
        assert!(!only_carol.selects(&web));

        let databases = VmQuery {
            vm_tags_to_match: [("role".to_string(), vec!["db".to_string()])].into_iter().collect(),
            ..owners
        };
        assert!(!databases.selects(&web));
        assert!(databases.selects(&stopped));
    }
}
