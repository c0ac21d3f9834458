//! Change events and subscriber filters.

use super::{tags_match, Machine, MatchTags, VmInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A batch of entity changes.
///
/// Machines are keyed by hostname and VMs by their primary address in text
/// form. `vm_to_hypervisor` records which hypervisor now hosts a VM.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeEvent {
    pub changed_machines: BTreeMap<String, Machine>,
    pub deleted_machines: Vec<String>,
    pub changed_vms: BTreeMap<String, VmInfo>,
    pub deleted_vms: Vec<String>,
    pub vm_to_hypervisor: BTreeMap<String, String>,
    /// Aggregate health, set on heartbeat and control-reply events.
    pub health_status: Option<String>,
}

impl ChangeEvent {
    /// Event carrying only a health status.
    pub fn health(status: impl Into<String>) -> Self {
        Self {
            health_status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn with_machine(mut self, machine: Machine) -> Self {
        self.changed_machines.insert(machine.hostname.clone(), machine);
        self
    }

    /// Record a changed VM and, when given, the hypervisor hosting it.
    pub fn with_vm(mut self, vm: VmInfo, hypervisor: Option<&str>) -> Self {
        let key = vm.ip().map(|ip| ip.to_string()).unwrap_or_default();
        if let Some(hypervisor) = hypervisor {
            self.vm_to_hypervisor
                .insert(key.clone(), hypervisor.to_string());
        }
        self.changed_vms.insert(key, vm);
        self
    }

    pub fn with_deleted_vm(mut self, ip: impl Into<String>) -> Self {
        self.deleted_vms.push(ip.into());
        self
    }

    pub fn with_deleted_machine(mut self, hostname: impl Into<String>) -> Self {
        self.deleted_machines.push(hostname.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changed_machines.is_empty()
            && self.deleted_machines.is_empty()
            && self.changed_vms.is_empty()
            && self.deleted_vms.is_empty()
            && self.vm_to_hypervisor.is_empty()
            && self.health_status.is_none()
    }

    /// Number of entity deltas, ignoring health.
    pub fn len(&self) -> usize {
        self.changed_machines.len()
            + self.deleted_machines.len()
            + self.changed_vms.len()
            + self.deleted_vms.len()
    }
}

/// Placement knowledge used to evaluate location filters for VMs, which
/// only name their hypervisor.
#[derive(Debug, Default)]
pub struct LocationIndex {
    machine_locations: HashMap<String, String>,
    vm_hosts: HashMap<String, String>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn placements announced by an event.
    pub fn learn(&mut self, event: &ChangeEvent) {
        for (hostname, machine) in &event.changed_machines {
            self.machine_locations
                .insert(hostname.clone(), machine.location.clone());
        }
        for (ip, hypervisor) in &event.vm_to_hypervisor {
            self.vm_hosts.insert(ip.clone(), hypervisor.clone());
        }
    }

    /// Forget entities the event deleted.
    pub fn forget(&mut self, event: &ChangeEvent) {
        for hostname in &event.deleted_machines {
            self.machine_locations.remove(hostname);
        }
        for ip in &event.deleted_vms {
            self.vm_hosts.remove(ip);
        }
    }

    pub fn machine_location(&self, hostname: &str) -> Option<&str> {
        self.machine_locations.get(hostname).map(String::as_str)
    }

    pub fn vm_host(&self, ip: &str) -> Option<&str> {
        self.vm_hosts.get(ip).map(String::as_str)
    }
}

/// Subscriber-side predicate over change events.
///
/// Changed entities must satisfy every configured criterion. Deletions and
/// health status always pass: a subscriber may have seen the entity before
/// the criterion stopped matching it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateFilter {
    /// Location prefix; empty matches everything.
    pub location: String,
    pub tags: MatchTags,
    /// Only entities naming this user as an owner.
    pub owner: Option<String>,
}

impl UpdateFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_location(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.location.is_empty() && self.tags.is_empty() && self.owner.is_none()
    }

    fn location_matches(&self, location: Option<&str>) -> bool {
        if self.location.is_empty() {
            return true;
        }
        let Some(location) = location else {
            return false;
        };
        let prefix = self.location.trim_end_matches('/');
        location == prefix
            || location
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn owner_matches(&self, owner_users: &[String]) -> bool {
        self.owner
            .as_ref()
            .map_or(true, |owner| owner_users.iter().any(|u| u == owner))
    }

    pub fn matches_machine(&self, machine: &Machine) -> bool {
        self.location_matches(Some(&machine.location))
            && tags_match(&machine.tags, &self.tags)
            && self.owner_matches(&machine.owner_users)
    }

    /// Location of the hypervisor hosting `ip`, from the event first and the
    /// index second.
    fn vm_location<'a>(
        ip: &str,
        event: &'a ChangeEvent,
        index: &'a LocationIndex,
    ) -> Option<&'a str> {
        let host = event
            .vm_to_hypervisor
            .get(ip)
            .map(String::as_str)
            .or_else(|| index.vm_host(ip))?;
        event
            .changed_machines
            .get(host)
            .map(|m| m.location.as_str())
            .or_else(|| index.machine_location(host))
    }

    pub fn matches_vm(&self, ip: &str, vm: &VmInfo, event: &ChangeEvent, index: &LocationIndex) -> bool {
        self.location_matches(Self::vm_location(ip, event, index))
            && tags_match(&vm.tags, &self.tags)
            && self.owner_matches(&vm.owner_users)
    }

    /// Project an event onto this filter. The result may be empty.
    pub fn apply(&self, event: &ChangeEvent, index: &LocationIndex) -> ChangeEvent {
        if self.is_unfiltered() {
            return event.clone();
        }
        let changed_machines = event
            .changed_machines
            .iter()
            .filter(|(_, machine)| self.matches_machine(machine))
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();
        let changed_vms: BTreeMap<String, VmInfo> = event
            .changed_vms
            .iter()
            .filter(|(ip, vm)| self.matches_vm(ip, vm, event, index))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // A placement travels with its VM; a bare move only needs the location.
        let vm_to_hypervisor = event
            .vm_to_hypervisor
            .iter()
            .filter(|(ip, _)| {
                if event.changed_vms.contains_key(*ip) {
                    changed_vms.contains_key(*ip)
                } else {
                    self.location_matches(Self::vm_location(ip, event, index))
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ChangeEvent {
            changed_machines,
            deleted_machines: event.deleted_machines.clone(),
            changed_vms,
            deleted_vms: event.deleted_vms.clone(),
            vm_to_hypervisor,
            health_status: event.health_status.clone(),
        }
    }
}
