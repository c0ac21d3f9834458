//! In-memory reference backend.
//!
//! Holds machines, subnets and VMs in a single `RwLock`ed state and
//! publishes a [`ChangeEvent`] into its [`UpdateHub`] after every mutation.
//! It backs standalone mode and the test suites; it is not an inventory.
//!
//! VM transitions:
//!
//! ```text
//!   create ─► Starting ──► Running        (do_not_start: ─► Stopped)
//!   start  ─► Starting ──► Running
//!   reboot ─► Starting ──► Running        (from Running)
//!   stop   ─► Stopping ──► Stopped
//!   destroy ─► Destroying ──► removed
//! ```
//!
//! Synchronous forms wait for the second step; asynchronous forms return
//! after the first and let a spawned task finish the transition.
//!
//! Some failures are reported as typed [`FleetError`]s and others as plain
//! messages, the way older inventory code still does.

use super::FleetBackend;
use crate::core::error::FleetError;
use crate::hub::{Subscription, UpdateHub, DEFAULT_CHANNEL_CAPACITY};
use crate::model::*;
use crate::net::identity::AuthInformation;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Initial inventory, usually read from the `[seed]` configuration section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSeed {
    pub machines: Vec<Machine>,
    pub subnets: Vec<Subnet>,
    pub vms: Vec<SeedVm>,
}

/// A VM present at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedVm {
    pub hypervisor: String,
    #[serde(flatten)]
    pub vm: VmInfo,
}

/// Behavioural knobs.
#[derive(Debug, Clone)]
pub struct MemoryFleetSettings {
    /// Port appended to hypervisor hostnames in listings.
    pub hypervisor_port: u16,
    /// Time a VM spends in a transitional state.
    pub transition_delay: Duration,
    /// Used when a caller passes a zero DHCP timeout.
    pub default_dhcp_timeout: Duration,
    pub hub_capacity: usize,
}

impl Default for MemoryFleetSettings {
    fn default() -> Self {
        Self {
            hypervisor_port: 6976,
            transition_delay: Duration::from_millis(0),
            default_dhcp_timeout: Duration::from_secs(30),
            hub_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
struct MachineRecord {
    machine: Machine,
    healthy: bool,
}

#[derive(Debug, Clone)]
struct VmRecord {
    vm: VmInfo,
    hypervisor: String,
}

#[derive(Debug, Default)]
struct FleetState {
    machines: BTreeMap<String, MachineRecord>,
    subnets: Vec<Subnet>,
    vms: BTreeMap<IpAddr, VmRecord>,
    /// Free addresses registered on a hypervisor by MoveIpAddresses.
    reserved_ips: BTreeMap<IpAddr, String>,
}

/// Resources held by the VMs on one hypervisor.
#[derive(Debug, Clone, Copy, Default)]
struct Allocation {
    memory_in_mib: u64,
    milli_cpus: u64,
    volume_bytes: u64,
}

impl FleetState {
    fn machine(&self, hostname: &str) -> Result<&MachineRecord> {
        self.machines
            .get(hostname)
            .ok_or_else(|| anyhow!("unknown machine: {}", hostname))
    }

    fn vm(&self, ip: IpAddr) -> Result<&VmRecord> {
        self.vms
            .get(&ip)
            .ok_or_else(|| FleetError::not_found("vm", ip.to_string()).into())
    }

    fn subnet(&self, id: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.id == id)
    }

    fn machine_subnets(machine: &Machine) -> BTreeSet<&str> {
        std::iter::once(machine.network_entry.subnet_id.as_str())
            .chain(
                machine
                    .secondary_network_entries
                    .iter()
                    .map(|e| e.subnet_id.as_str()),
            )
            .chain(std::iter::once(machine.gateway_subnet_id.as_str()))
            .filter(|id| !id.is_empty())
            .collect()
    }

    fn vm_event(&self, ip: IpAddr) -> ChangeEvent {
        match self.vms.get(&ip) {
            Some(record) => {
                ChangeEvent::default().with_vm(record.vm.clone(), Some(&record.hypervisor))
            }
            None => ChangeEvent::default().with_deleted_vm(ip.to_string()),
        }
    }

    fn snapshot(&self) -> ChangeEvent {
        let mut event = ChangeEvent::default();
        for record in self.machines.values() {
            event = event.with_machine(record.machine.clone());
        }
        for record in self.vms.values() {
            event = event.with_vm(record.vm.clone(), Some(&record.hypervisor));
        }
        event
    }

    /// First free address after the subnet gateway. Addresses registered
    /// on a hypervisor are not handed out.
    fn allocate_ip(&self, subnet: &Subnet) -> Result<IpAddr> {
        let Some(IpAddr::V4(gateway)) = subnet.ip_gateway else {
            return Err(anyhow!("invalid subnet {}: no IPv4 gateway", subnet.id));
        };
        let base = u32::from(gateway);
        (1..=253u32)
            .map(|offset| IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset))))
            .find(|ip| !self.vms.contains_key(ip) && !self.reserved_ips.contains_key(ip))
            .ok_or_else(|| anyhow!("subnet {} unavailable: address pool exhausted", subnet.id))
    }

    fn allocation(&self, hostname: &str, skip: Option<IpAddr>) -> Allocation {
        self.vms
            .iter()
            .filter(|(ip, record)| record.hypervisor == hostname && Some(**ip) != skip)
            .fold(Allocation::default(), |total, (_, record)| Allocation {
                memory_in_mib: total.memory_in_mib + record.vm.memory_in_mib,
                milli_cpus: total.milli_cpus + u64::from(record.vm.milli_cpus),
                volume_bytes: total.volume_bytes + record.vm.volumes.iter().map(|v| v.size).sum::<u64>(),
            })
    }

    /// Hypervisors under `location` that pass the health, tag and subnet
    /// filters, in hostname order.
    fn hypervisors_in(
        &self,
        location: &str,
        subnet_id: &str,
        tags: &MatchTags,
        include_unhealthy: bool,
    ) -> Result<Vec<&MachineRecord>> {
        if !subnet_id.is_empty() && self.subnet(subnet_id).is_none() {
            return Err(anyhow!("invalid subnet: {}", subnet_id));
        }
        Ok(self
            .machines
            .values()
            .filter(|r| location_under(&r.machine.location, location))
            .filter(|r| r.healthy || include_unhealthy)
            .filter(|r| tags_match(&r.machine.tags, tags))
            .filter(|r| subnet_id.is_empty() || Self::machine_subnets(&r.machine).contains(subnet_id))
            .collect())
    }

    fn query<'a>(&'a self, query: &'a VmQuery) -> Result<impl Iterator<Item = (&'a IpAddr, &'a VmRecord)> + 'a> {
        if !query.hypervisor.is_empty() {
            self.machine(&query.hypervisor)?;
        }
        Ok(self
            .vms
            .iter()
            .filter(move |(_, r)| query.hypervisor.is_empty() || r.hypervisor == query.hypervisor)
            .filter(move |(_, r)| query.selects(&r.vm)))
    }

    /// Healthy hypervisor on the subnet with the fewest VMs.
    fn place(&self, subnet_id: &str) -> Result<String> {
        let mut load: BTreeMap<&str, usize> = BTreeMap::new();
        for record in self.vms.values() {
            *load.entry(record.hypervisor.as_str()).or_default() += 1;
        }
        self.machines
            .values()
            .filter(|r| r.healthy)
            .filter(|r| Self::machine_subnets(&r.machine).contains(subnet_id))
            .min_by_key(|r| load.get(r.machine.hostname.as_str()).copied().unwrap_or(0))
            .map(|r| r.machine.hostname.clone())
            .ok_or_else(|| {
                FleetError::unavailable("hypervisor", format!("no healthy hypervisor on subnet {}", subnet_id))
                    .into()
            })
    }
}

fn require_owner(auth: &AuthInformation, vm: &VmInfo, action: &str) -> Result<()> {
    if auth.owns(&vm.owner_users, &vm.owner_groups) {
        Ok(())
    } else {
        Err(FleetError::permission_denied(
            "vm",
            action,
            format!("{} is not an owner", auth.username),
        )
        .into())
    }
}

fn location_under(location: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || location == prefix
        || location
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct FleetInner {
    state: RwLock<FleetState>,
    hub: UpdateHub,
    settings: MemoryFleetSettings,
}

impl FleetInner {
    /// Apply a mutation and publish the event it returns.
    fn mutate<T>(&self, f: impl FnOnce(&mut FleetState) -> Result<(T, ChangeEvent)>) -> Result<T> {
        let mut state = self.state.write();
        let (value, event) = f(&mut state)?;
        if !event.is_empty() {
            self.hub.publish(event);
        }
        Ok(value)
    }

    /// Move a VM from a transitional state to `next`. A VM that left the
    /// transitional state meanwhile is left alone.
    fn complete(&self, ip: IpAddr, from: VmState, next: Option<VmState>) {
        let result = self.mutate(|state| {
            let Some(record) = state.vms.get_mut(&ip) else {
                return Ok(((), ChangeEvent::default()));
            };
            if record.vm.state != from {
                return Ok(((), ChangeEvent::default()));
            }
            match next {
                Some(next) => record.vm.state = next,
                None => {
                    state.vms.remove(&ip);
                }
            }
            Ok(((), state.vm_event(ip)))
        });
        if let Err(e) = result {
            tracing::warn!(%ip, error = %e, "VM transition failed");
        }
    }
}

/// In-memory [`FleetBackend`]. Cloning shares the state.
#[derive(Clone)]
pub struct InMemoryFleet {
    inner: Arc<FleetInner>,
}

impl Default for InMemoryFleet {
    fn default() -> Self {
        Self::new(MemoryFleetSettings::default())
    }
}

impl InMemoryFleet {
    pub fn new(settings: MemoryFleetSettings) -> Self {
        Self {
            inner: Arc::new(FleetInner {
                state: RwLock::new(FleetState::default()),
                hub: UpdateHub::new(settings.hub_capacity),
                settings,
            }),
        }
    }

    /// Build a backend pre-populated from a seed.
    pub fn from_seed(seed: FleetSeed, settings: MemoryFleetSettings) -> Self {
        let fleet = Self::new(settings);
        {
            let mut state = fleet.inner.state.write();
            for machine in seed.machines {
                state.machines.insert(
                    machine.hostname.clone(),
                    MachineRecord {
                        machine,
                        healthy: true,
                    },
                );
            }
            state.subnets = seed.subnets;
            for SeedVm { hypervisor, vm } in seed.vms {
                if let Some(ip) = vm.ip() {
                    state.vms.insert(ip, VmRecord { vm, hypervisor });
                }
            }
        }
        fleet
    }

    pub fn hub(&self) -> &UpdateHub {
        &self.inner.hub
    }

    pub fn add_machine(&self, machine: Machine) {
        let mut state = self.inner.state.write();
        let event = ChangeEvent::default().with_machine(machine.clone());
        state.machines.insert(
            machine.hostname.clone(),
            MachineRecord {
                machine,
                healthy: true,
            },
        );
        self.inner.hub.publish(event);
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        let mut state = self.inner.state.write();
        state.subnets.retain(|s| s.id != subnet.id);
        state.subnets.push(subnet);
    }

    /// Mark a hypervisor healthy or not. Unknown hostnames are ignored.
    pub fn set_machine_health(&self, hostname: &str, healthy: bool) {
        if let Some(record) = self.inner.state.write().machines.get_mut(hostname) {
            record.healthy = healthy;
        }
    }

    fn spawn_completion(&self, ip: IpAddr, from: VmState, next: Option<VmState>) {
        let inner = self.inner.clone();
        let delay = inner.settings.transition_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.complete(ip, from, next);
        });
    }

    /// Wait out a transition bounded by `timeout`. Returns whether the
    /// bound was hit first.
    async fn wait_transition(&self, timeout: Duration) -> bool {
        let delay = self.inner.settings.transition_delay;
        let timeout = if timeout.is_zero() {
            self.inner.settings.default_dhcp_timeout
        } else {
            timeout
        };
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            true
        } else {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            false
        }
    }

    /// Validate and insert a new VM in its initial state.
    fn insert_vm(&self, auth: &AuthInformation, request: &CreateVmRequest) -> Result<VmInfo> {
        self.inner.mutate(|state| {
            let mut vm = request.vm_info.clone();
            let subnet_id = if vm.subnet_id.is_empty() {
                state
                    .subnets
                    .first()
                    .map(|s| s.id.clone())
                    .ok_or_else(|| FleetError::not_found("subnet", ""))?
            } else {
                vm.subnet_id.clone()
            };
            let subnet = state
                .subnet(&subnet_id)
                .ok_or_else(|| FleetError::not_found("subnet", subnet_id.clone()))?
                .clone();
            if let Some(ip) = vm.ip() {
                if state.vms.contains_key(&ip) {
                    return Err(FleetError::already_exists("vm", ip.to_string()).into());
                }
            }
            let reserved = vm.ip().and_then(|ip| state.reserved_ips.get(&ip)).cloned();
            let hypervisor = match reserved {
                Some(hypervisor) => hypervisor,
                None => state.place(&subnet.id)?,
            };
            let ip = match vm.ip() {
                Some(ip) => ip,
                None => state.allocate_ip(&subnet)?,
            };
            state.reserved_ips.remove(&ip);
            vm.address.ip_address = Some(ip);
            vm.subnet_id = subnet.id.clone();
            if vm.owner_users.is_empty() {
                vm.owner_users.push(auth.username.clone());
            }
            vm.state = if request.do_not_start {
                VmState::Stopped
            } else {
                VmState::Starting
            };
            state.vms.insert(
                ip,
                VmRecord {
                    vm: vm.clone(),
                    hypervisor,
                },
            );
            let event = state.vm_event(ip);
            Ok((vm, event))
        })
    }

    /// Put an owned VM into a transitional state.
    fn begin(
        &self,
        auth: &AuthInformation,
        ip: IpAddr,
        action: &str,
        check: impl FnOnce(&VmInfo) -> Result<()>,
        transitional: VmState,
    ) -> Result<VmInfo> {
        self.inner.mutate(|state| {
            let record = state.vm(ip)?;
            require_owner(auth, &record.vm, action)?;
            check(&record.vm)?;
            let record = state
                .vms
                .get_mut(&ip)
                .ok_or_else(|| FleetError::not_found("vm", ip.to_string()))?;
            record.vm.state = transitional;
            let vm = record.vm.clone();
            Ok((vm, state.vm_event(ip)))
        })
    }

    fn check_destroyable(vm: &VmInfo) -> Result<()> {
        if vm.destroy_protection {
            return Err(anyhow!(
                "cannot destroy {}: access denied while destroy protection is enabled",
                vm.ip().map(|ip| ip.to_string()).unwrap_or_default()
            ));
        }
        if vm.state == VmState::Destroying {
            return Err(anyhow!("VM is already being destroyed; conflict"));
        }
        Ok(())
    }

    fn check_stopped(vm: &VmInfo) -> Result<()> {
        if vm.state != VmState::Stopped {
            return Err(FleetError::invalid_argument("state", format!("VM is {}, not stopped", vm.state)).into());
        }
        Ok(())
    }

    fn check_running(vm: &VmInfo) -> Result<()> {
        if vm.state != VmState::Running {
            return Err(anyhow!("VM is {}, not running: invalid state", vm.state));
        }
        Ok(())
    }

    /// Second half of a synchronous start or reboot.
    async fn finish_start(&self, ip: IpAddr, dhcp_timeout: Duration) -> StartVmOutcome {
        let dhcp_timed_out = self.wait_transition(dhcp_timeout).await;
        if dhcp_timed_out {
            self.spawn_completion(ip, VmState::Starting, Some(VmState::Running));
        } else {
            self.inner.complete(ip, VmState::Starting, Some(VmState::Running));
        }
        StartVmOutcome { dhcp_timed_out }
    }
}

#[async_trait]
impl FleetBackend for InMemoryFleet {
    async fn change_machine_tags(&self, auth: &AuthInformation, request: ChangeMachineTagsRequest) -> Result<()> {
        self.inner.mutate(|state| {
            let record = state.machine(&request.hostname)?;
            if !auth.owns(&record.machine.owner_users, &record.machine.owner_groups) {
                return Err(FleetError::permission_denied(
                    "machine",
                    "change tags",
                    format!("{} is not an owner", auth.username),
                )
                .into());
            }
            let record = state
                .machines
                .get_mut(&request.hostname)
                .ok_or_else(|| FleetError::not_found("machine", request.hostname.clone()))?;
            record.machine.tags = request.tags;
            Ok(((), ChangeEvent::default().with_machine(record.machine.clone())))
        })
    }

    async fn power_on_machine(&self, auth: &AuthInformation, hostname: &str) -> Result<()> {
        self.inner.mutate(|state| {
            let record = state.machine(hostname)?;
            if !auth.owns(&record.machine.owner_users, &record.machine.owner_groups) {
                return Err(FleetError::permission_denied(
                    "machine",
                    "power on",
                    format!("{} is not an owner", auth.username),
                )
                .into());
            }
            if record.machine.ipmi.host_ip_address.is_none() && record.machine.ipmi.hostname.is_empty() {
                return Err(anyhow!("no IPMI address for {}: service unavailable", hostname));
            }
            let record = state
                .machines
                .get_mut(hostname)
                .ok_or_else(|| FleetError::not_found("machine", hostname))?;
            record.healthy = true;
            tracing::info!(hostname, username = %auth.username, "machine powered on");
            Ok(((), ChangeEvent::default().with_machine(record.machine.clone())))
        })
    }

    async fn get_machine_info(&self, request: GetMachineInfoRequest) -> Result<MachineInfo> {
        let state = self.inner.state.read();
        let record = state.machine(&request.hostname)?;
        let subnet_ids = FleetState::machine_subnets(&record.machine);
        let subnets = state
            .subnets
            .iter()
            .filter(|s| subnet_ids.contains(s.id.as_str()))
            .cloned()
            .collect();
        Ok(MachineInfo {
            location: record.machine.location.clone(),
            machine: record.machine.clone(),
            subnets,
        })
    }

    async fn move_ip_addresses(&self, request: MoveIpAddressesRequest) -> Result<()> {
        let mut state = self.inner.state.write();
        let hostname = request.hypervisor_hostname;
        state.machine(&hostname)?;
        for ip in &request.ip_addresses {
            if let Some(record) = state.vms.get(ip) {
                if record.hypervisor != hostname {
                    return Err(anyhow!(
                        "{} is in use by a VM on {}: conflict",
                        ip,
                        record.hypervisor
                    ));
                }
            }
        }
        for ip in request.ip_addresses {
            if !state.vms.contains_key(&ip) {
                state.reserved_ips.insert(ip, hostname.clone());
            }
        }
        tracing::info!(hypervisor = %hostname, "IP addresses moved");
        Ok(())
    }

    async fn get_capacity(&self, hostname: &str) -> Result<Capacity> {
        let state = self.inner.state.read();
        let machine = &state.machine(hostname)?.machine;
        Ok(Capacity {
            memory_in_mib: machine.memory_in_mib,
            num_cpus: machine.num_cpus,
            total_volume_bytes: machine.total_volume_bytes,
        })
    }

    async fn get_hypervisor_for_vm(&self, ip: IpAddr) -> Result<String> {
        let state = self.inner.state.read();
        state
            .vms
            .get(&ip)
            .map(|r| r.hypervisor.clone())
            .ok_or_else(|| anyhow!("IP address {} not found", ip))
    }

    async fn get_ip_info(&self, ip: IpAddr) -> Result<IpInfo> {
        let state = self.inner.state.read();
        if let Some(record) = state.vms.get(&ip) {
            let hypervisor_address = state
                .machines
                .get(&record.hypervisor)
                .and_then(|m| m.machine.network_entry.host_ip_address);
            return Ok(IpInfo {
                hypervisor_address,
                vm: Some(record.vm.clone()),
            });
        }
        if let Some(hostname) = state.reserved_ips.get(&ip) {
            return Ok(IpInfo {
                hypervisor_address: state.machine(hostname)?.machine.network_entry.host_ip_address,
                vm: None,
            });
        }
        let is_hypervisor = state
            .machines
            .values()
            .any(|m| m.machine.network_entry.host_ip_address == Some(ip));
        if is_hypervisor {
            return Ok(IpInfo {
                hypervisor_address: Some(ip),
                vm: None,
            });
        }
        Err(anyhow!("no such IP address: {}", ip))
    }

    async fn list_hypervisor_locations(&self, request: ListHypervisorLocationsRequest) -> Result<Vec<String>> {
        let state = self.inner.state.read();
        let locations: BTreeSet<String> = state
            .machines
            .values()
            .map(|r| r.machine.location.clone())
            .filter(|loc| location_under(loc, &request.top_location))
            .collect();
        Ok(locations.into_iter().collect())
    }

    async fn list_hypervisors_in_location(
        &self,
        request: ListHypervisorsInLocationRequest,
    ) -> Result<HypervisorsInLocation> {
        let state = self.inner.state.read();
        let found = state.hypervisors_in(
            &request.location,
            &request.subnet_id,
            &request.hypervisor_tags_to_match,
            request.include_unhealthy,
        )?;
        let mut response = HypervisorsInLocation::default();
        for record in found {
            let machine = &record.machine;
            response.hypervisor_addresses.push(format!(
                "{}:{}",
                machine.hostname, self.inner.settings.hypervisor_port
            ));
            if !request.tags_to_include.is_empty() {
                response.tags_for_hypervisors.push(
                    machine
                        .tags
                        .iter()
                        .filter(|(k, _)| request.tags_to_include.contains(k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
            }
        }
        Ok(response)
    }

    async fn list_vms_in_location(&self, request: ListVmsInLocationRequest) -> Result<Vec<IpAddr>> {
        let state = self.inner.state.read();
        let owner_filtered = !request.owner_users.is_empty() || !request.owner_groups.is_empty();
        let ips = state
            .vms
            .iter()
            .filter(|(_, record)| {
                let Some(host) = state.machines.get(&record.hypervisor) else {
                    return false;
                };
                location_under(&host.machine.location, &request.location)
                    && tags_match(&host.machine.tags, &request.hypervisor_tags_to_match)
                    && tags_match(&record.vm.tags, &request.vm_tags_to_match)
                    && (!owner_filtered
                        || record.vm.owner_users.iter().any(|u| request.owner_users.contains(u))
                        || record.vm.owner_groups.iter().any(|g| request.owner_groups.contains(g)))
            })
            .map(|(ip, _)| *ip)
            .collect();
        Ok(ips)
    }

    async fn list_subnets(&self, request: ListSubnetsRequest) -> Result<Vec<Subnet>> {
        let mut subnets = self.inner.state.read().subnets.clone();
        if request.sort {
            subnets.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Ok(subnets)
    }

    async fn get_hypervisors_in_location(&self, request: GetHypervisorsInLocationRequest) -> Result<Vec<Hypervisor>> {
        let state = self.inner.state.read();
        let found = state.hypervisors_in(
            &request.location,
            &request.subnet_id,
            &request.hypervisor_tags_to_match,
            request.include_unhealthy,
        )?;
        Ok(found
            .into_iter()
            .map(|record| {
                let hostname = record.machine.hostname.as_str();
                let allocation = state.allocation(hostname, None);
                let vms = if request.include_vms {
                    state
                        .vms
                        .values()
                        .filter(|vm| vm.hypervisor == hostname)
                        .map(|vm| vm.vm.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                Hypervisor {
                    machine: record.machine.clone(),
                    allocated_memory_in_mib: allocation.memory_in_mib,
                    allocated_milli_cpus: allocation.milli_cpus,
                    allocated_volume_bytes: allocation.volume_bytes,
                    vms,
                }
            })
            .collect())
    }

    async fn list_vms(&self, query: VmQuery) -> Result<Vec<IpAddr>> {
        let state = self.inner.state.read();
        let ips = state.query(&query)?.map(|(ip, _)| *ip).collect();
        Ok(ips)
    }

    async fn get_vm_infos(&self, query: VmQuery) -> Result<Vec<VmInfo>> {
        let state = self.inner.state.read();
        let vms = state.query(&query)?.map(|(_, record)| record.vm.clone()).collect();
        Ok(vms)
    }

    async fn create_vm(&self, auth: &AuthInformation, request: CreateVmRequest) -> Result<CreateVmOutcome> {
        if request.image_data_size > 0 && request.image_data.len() as u64 != request.image_data_size {
            return Err(FleetError::invalid_argument("image_data", "short image payload").into());
        }
        if request.user_data_size > 0 && request.user_data.len() as u64 != request.user_data_size {
            return Err(FleetError::invalid_argument("user_data", "short user data payload").into());
        }
        let vm = self.insert_vm(auth, &request)?;
        let ip = vm
            .ip()
            .ok_or_else(|| anyhow!("VM created without an address"))?;
        if request.do_not_start {
            return Ok(CreateVmOutcome {
                ip_address: ip,
                dhcp_timed_out: false,
                vm,
            });
        }
        let dhcp_timed_out = self.wait_transition(request.dhcp_timeout).await;
        if dhcp_timed_out {
            self.spawn_completion(ip, VmState::Starting, Some(VmState::Running));
        } else {
            self.inner.complete(ip, VmState::Starting, Some(VmState::Running));
        }
        let vm = self.get_vm_info(ip).await?;
        Ok(CreateVmOutcome {
            ip_address: ip,
            dhcp_timed_out,
            vm,
        })
    }

    async fn create_vm_async(&self, auth: &AuthInformation, request: CreateVmRequest) -> Result<VmInfo> {
        let vm = self.insert_vm(auth, &request)?;
        if let (Some(ip), VmState::Starting) = (vm.ip(), vm.state) {
            self.spawn_completion(ip, VmState::Starting, Some(VmState::Running));
        }
        Ok(vm)
    }

    async fn destroy_vm(&self, auth: &AuthInformation, ip: IpAddr) -> Result<()> {
        self.begin(auth, ip, "destroy", Self::check_destroyable, VmState::Destroying)?;
        self.wait_transition(Duration::ZERO).await;
        self.inner.complete(ip, VmState::Destroying, None);
        Ok(())
    }

    async fn destroy_vm_async(&self, auth: &AuthInformation, ip: IpAddr) -> Result<VmInfo> {
        let vm = self.begin(auth, ip, "destroy", Self::check_destroyable, VmState::Destroying)?;
        self.spawn_completion(ip, VmState::Destroying, None);
        Ok(vm)
    }

    async fn start_vm(&self, auth: &AuthInformation, ip: IpAddr, dhcp_timeout: Duration) -> Result<StartVmOutcome> {
        self.begin(auth, ip, "start", Self::check_stopped, VmState::Starting)?;
        Ok(self.finish_start(ip, dhcp_timeout).await)
    }

    async fn start_vm_async(&self, auth: &AuthInformation, ip: IpAddr) -> Result<VmInfo> {
        let vm = self.begin(auth, ip, "start", Self::check_stopped, VmState::Starting)?;
        self.spawn_completion(ip, VmState::Starting, Some(VmState::Running));
        Ok(vm)
    }

    async fn stop_vm(&self, auth: &AuthInformation, ip: IpAddr) -> Result<()> {
        self.begin(auth, ip, "stop", Self::check_running, VmState::Stopping)?;
        self.wait_transition(Duration::ZERO).await;
        self.inner.complete(ip, VmState::Stopping, Some(VmState::Stopped));
        Ok(())
    }

    async fn get_vm_info(&self, ip: IpAddr) -> Result<VmInfo> {
        let state = self.inner.state.read();
        Ok(state.vm(ip)?.vm.clone())
    }

    async fn change_vm_tags(&self, auth: &AuthInformation, ip: IpAddr, tags: Tags) -> Result<()> {
        self.inner.mutate(|state| {
            require_owner(auth, &state.vm(ip)?.vm, "change tags")?;
            let record = state
                .vms
                .get_mut(&ip)
                .ok_or_else(|| FleetError::not_found("vm", ip.to_string()))?;
            record.vm.tags = tags;
            Ok(((), state.vm_event(ip)))
        })
    }

    async fn reboot_vm(&self, auth: &AuthInformation, ip: IpAddr, dhcp_timeout: Duration) -> Result<StartVmOutcome> {
        self.begin(auth, ip, "reboot", Self::check_running, VmState::Starting)?;
        tracing::info!(%ip, username = %auth.username, "VM rebooting");
        Ok(self.finish_start(ip, dhcp_timeout).await)
    }

    /// The first owner stays; `owner_users` replaces the rest.
    async fn change_vm_owner_users(&self, auth: &AuthInformation, ip: IpAddr, owner_users: Vec<String>) -> Result<()> {
        self.inner.mutate(|state| {
            require_owner(auth, &state.vm(ip)?.vm, "change owners")?;
            let record = state
                .vms
                .get_mut(&ip)
                .ok_or_else(|| FleetError::not_found("vm", ip.to_string()))?;
            let mut owners: Vec<String> = record.vm.owner_users.iter().take(1).cloned().collect();
            for user in owner_users {
                if !owners.contains(&user) {
                    owners.push(user);
                }
            }
            record.vm.owner_users = owners;
            Ok(((), state.vm_event(ip)))
        })
    }

    async fn change_vm_size(&self, auth: &AuthInformation, request: ChangeVmSizeRequest) -> Result<()> {
        let ip = request.ip_address;
        self.inner.mutate(|state| {
            let record = state.vm(ip)?;
            require_owner(auth, &record.vm, "resize")?;
            Self::check_stopped(&record.vm)?;
            let memory_in_mib = match request.memory_in_mib {
                0 => record.vm.memory_in_mib,
                n => n,
            };
            let milli_cpus = match request.milli_cpus {
                0 => record.vm.milli_cpus,
                n => n,
            };
            let virtual_cpus = match request.virtual_cpus {
                0 => record.vm.virtual_cpus,
                n => n,
            };
            let host = state.machine(&record.hypervisor)?;
            let others = state.allocation(&record.hypervisor, Some(ip));
            let machine = &host.machine;
            if machine.memory_in_mib > 0 && others.memory_in_mib + memory_in_mib > machine.memory_in_mib {
                return Err(FleetError::resource_exhausted(
                    "memory",
                    format!(
                        "{} has {} MiB free",
                        machine.hostname,
                        machine.memory_in_mib.saturating_sub(others.memory_in_mib)
                    ),
                )
                .into());
            }
            let cpu_limit = u64::from(machine.num_cpus) * 1000;
            if cpu_limit > 0 && others.milli_cpus + u64::from(milli_cpus) > cpu_limit {
                return Err(FleetError::resource_exhausted(
                    "CPU",
                    format!(
                        "{} has {} milli-CPUs free",
                        machine.hostname,
                        cpu_limit.saturating_sub(others.milli_cpus)
                    ),
                )
                .into());
            }
            if machine.num_cpus > 0 && virtual_cpus > machine.num_cpus {
                return Err(FleetError::invalid_argument(
                    "virtual_cpus",
                    format!("{} exceeds the {} CPUs of {}", virtual_cpus, machine.num_cpus, machine.hostname),
                )
                .into());
            }
            let record = state
                .vms
                .get_mut(&ip)
                .ok_or_else(|| FleetError::not_found("vm", ip.to_string()))?;
            record.vm.memory_in_mib = memory_in_mib;
            record.vm.milli_cpus = milli_cpus;
            record.vm.virtual_cpus = virtual_cpus;
            Ok(((), state.vm_event(ip)))
        })
    }

    fn make_update_channel(&self, filter: UpdateFilter) -> Subscription {
        // Snapshot and registration under one read lock, so no mutation can
        // slip between them.
        let state = self.inner.state.read();
        self.inner
            .hub
            .register_with_snapshot(filter, state.snapshot())
    }

    fn health_status(&self) -> String {
        let state = self.inner.state.read();
        let unhealthy = state.machines.values().filter(|r| !r.healthy).count();
        if unhealthy == 0 {
            "healthy".to_string()
        } else {
            format!(
                "{} of {} hypervisors unhealthy",
                unhealthy,
                state.machines.len()
            )
        }
    }
}
