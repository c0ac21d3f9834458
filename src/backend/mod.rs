//! Business-logic collaborator contract.
//!
//! Transport adapters reach VM lifecycle, topology and inventory logic only
//! through [`FleetBackend`]. Each adapter method makes exactly one call into
//! it. Errors are `anyhow::Error` so that legacy string failures and typed
//! [`FleetError`](crate::core::error::FleetError)s travel the same path to
//! the status classifier.

pub mod memory;

use crate::hub::Subscription;
use crate::model::*;
use crate::net::identity::AuthInformation;
use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

pub use memory::{InMemoryFleet, MemoryFleetSettings};

/// Fleet and hypervisor operations.
#[async_trait]
pub trait FleetBackend: Send + Sync + 'static {
    // Machines

    async fn change_machine_tags(&self, auth: &AuthInformation, request: ChangeMachineTagsRequest) -> Result<()>;

    async fn power_on_machine(&self, auth: &AuthInformation, hostname: &str) -> Result<()>;

    async fn get_machine_info(&self, request: GetMachineInfoRequest) -> Result<MachineInfo>;

    /// Register addresses on a hypervisor so that VMs created with them
    /// land there. Addresses held by a VM elsewhere are refused.
    async fn move_ip_addresses(&self, request: MoveIpAddressesRequest) -> Result<()>;

    async fn get_capacity(&self, hostname: &str) -> Result<Capacity>;

    // Lookups

    /// Hostname of the hypervisor hosting `ip`.
    async fn get_hypervisor_for_vm(&self, ip: IpAddr) -> Result<String>;

    async fn get_ip_info(&self, ip: IpAddr) -> Result<IpInfo>;

    // Listing

    async fn list_hypervisor_locations(&self, request: ListHypervisorLocationsRequest) -> Result<Vec<String>>;

    async fn list_hypervisors_in_location(
        &self,
        request: ListHypervisorsInLocationRequest,
    ) -> Result<HypervisorsInLocation>;

    /// Addresses in a stable order.
    async fn list_vms_in_location(&self, request: ListVmsInLocationRequest) -> Result<Vec<IpAddr>>;

    async fn list_subnets(&self, request: ListSubnetsRequest) -> Result<Vec<Subnet>>;

    /// Full records of the hypervisors a location holds, with allocations.
    async fn get_hypervisors_in_location(&self, request: GetHypervisorsInLocationRequest) -> Result<Vec<Hypervisor>>;

    /// Addresses of the VMs a query selects, in address order.
    async fn list_vms(&self, query: VmQuery) -> Result<Vec<IpAddr>>;

    async fn get_vm_infos(&self, query: VmQuery) -> Result<Vec<VmInfo>>;

    // VM lifecycle

    /// Create and, unless told otherwise, start a VM; returns once it has an
    /// address and has reached its resting state.
    async fn create_vm(&self, auth: &AuthInformation, request: CreateVmRequest) -> Result<CreateVmOutcome>;

    /// Accept a create and return with the VM in `Starting` (or `Stopped`
    /// when not to be started).
    async fn create_vm_async(&self, auth: &AuthInformation, request: CreateVmRequest) -> Result<VmInfo>;

    async fn destroy_vm(&self, auth: &AuthInformation, ip: IpAddr) -> Result<()>;

    /// Accept a destroy and return with the VM in `Destroying`.
    async fn destroy_vm_async(&self, auth: &AuthInformation, ip: IpAddr) -> Result<VmInfo>;

    async fn start_vm(&self, auth: &AuthInformation, ip: IpAddr, dhcp_timeout: Duration) -> Result<StartVmOutcome>;

    /// Accept a start and return with the VM in `Starting`.
    async fn start_vm_async(&self, auth: &AuthInformation, ip: IpAddr) -> Result<VmInfo>;

    async fn stop_vm(&self, auth: &AuthInformation, ip: IpAddr) -> Result<()>;

    async fn get_vm_info(&self, ip: IpAddr) -> Result<VmInfo>;

    async fn change_vm_tags(&self, auth: &AuthInformation, ip: IpAddr, tags: Tags) -> Result<()>;

    /// Restart a running VM; returns once it is back up or the DHCP wait
    /// ran out.
    async fn reboot_vm(&self, auth: &AuthInformation, ip: IpAddr, dhcp_timeout: Duration) -> Result<StartVmOutcome>;

    async fn change_vm_owner_users(&self, auth: &AuthInformation, ip: IpAddr, owner_users: Vec<String>) -> Result<()>;

    async fn change_vm_size(&self, auth: &AuthInformation, request: ChangeVmSizeRequest) -> Result<()>;

    // Updates

    /// Register a watcher. The subscription starts with a snapshot of the
    /// entities the filter selects.
    fn make_update_channel(&self, filter: UpdateFilter) -> Subscription;

    /// Release a watcher registered by [`FleetBackend::make_update_channel`].
    fn close_update_channel(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Aggregate health, carried on heartbeat events.
    fn health_status(&self) -> String;
}
