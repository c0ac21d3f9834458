//! In-memory backend integration tests: lifecycle convergence and the
//! hypervisor-level operations.

mod common;

use common::{sample_fleet, sample_fleet_with};
use fleetrpc::backend::{FleetBackend, InMemoryFleet, MemoryFleetSettings};
use fleetrpc::core::status::{classify_anyhow, StatusCode};
use fleetrpc::model::{
    Address, ChangeVmSizeRequest, CreateVmRequest, GetHypervisorsInLocationRequest, Machine,
    MoveIpAddressesRequest, NetworkEntry, VmInfo, VmQuery, VmState,
};
use fleetrpc::net::identity::AuthInformation;
use std::net::IpAddr;
use std::time::Duration;

const TRANSITION: Duration = Duration::from_secs(2);

fn slow_fleet() -> InMemoryFleet {
    sample_fleet_with(MemoryFleetSettings {
        transition_delay: TRANSITION,
        ..MemoryFleetSettings::default()
    })
}

fn operator() -> AuthInformation {
    AuthInformation::new("alice").with_groups(["ops"])
}

fn create_request(hostname: &str, do_not_start: bool) -> CreateVmRequest {
    CreateVmRequest {
        vm_info: VmInfo {
            hostname: hostname.into(),
            memory_in_mib: 512,
            milli_cpus: 1500,
            tags: [("role".to_string(), "web".to_string())].into_iter().collect(),
            ..Default::default()
        },
        do_not_start,
        ..Default::default()
    }
}

/// `left` and `right` with their addresses ignored.
fn same_apart_from_address(left: &VmInfo, right: &VmInfo) -> bool {
    let mut right = right.clone();
    right.address = left.address.clone();
    *left == right
}

async fn info(fleet: &InMemoryFleet, ip: IpAddr) -> VmInfo {
    fleet.get_vm_info(ip).await.unwrap()
}

// ============================================================================
// Sync and async forms
// ============================================================================

#[tokio::test(start_paused = true)]
async fn create_forms_converge() {
    let fleet = slow_fleet();
    let auth = operator();

    let created = fleet.create_vm(&auth, create_request("web", false)).await.unwrap();
    assert!(!created.dhcp_timed_out);
    let accepted = fleet.create_vm_async(&auth, create_request("web", false)).await.unwrap();
    assert_eq!(accepted.state, VmState::Starting);
    let accepted_ip = accepted.ip().unwrap();

    tokio::time::sleep(TRANSITION + Duration::from_millis(1)).await;
    let sync = info(&fleet, created.ip_address).await;
    let asynchronous = info(&fleet, accepted_ip).await;
    assert_eq!(sync.state, VmState::Running);
    assert_eq!(asynchronous.state, VmState::Running);
    assert_ne!(created.ip_address, accepted_ip);
    assert!(same_apart_from_address(&sync, &asynchronous));
}

#[tokio::test(start_paused = true)]
async fn start_forms_converge() {
    let fleet = slow_fleet();
    let auth = operator();
    let first = fleet.create_vm(&auth, create_request("db", true)).await.unwrap().ip_address;
    let second = fleet.create_vm(&auth, create_request("db", true)).await.unwrap().ip_address;
    assert_eq!(info(&fleet, first).await.state, VmState::Stopped);

    let outcome = fleet.start_vm(&auth, first, Duration::ZERO).await.unwrap();
    assert!(!outcome.dhcp_timed_out);
    let accepted = fleet.start_vm_async(&auth, second).await.unwrap();
    assert_eq!(accepted.state, VmState::Starting);

    tokio::time::sleep(TRANSITION + Duration::from_millis(1)).await;
    let sync = info(&fleet, first).await;
    let asynchronous = info(&fleet, second).await;
    assert_eq!(sync.state, VmState::Running);
    assert!(same_apart_from_address(&sync, &asynchronous));
}

#[tokio::test(start_paused = true)]
async fn destroy_forms_converge() {
    let fleet = slow_fleet();
    let auth = operator();
    let first = fleet.create_vm(&auth, create_request("tmp", true)).await.unwrap().ip_address;
    let second = fleet.create_vm(&auth, create_request("tmp", true)).await.unwrap().ip_address;

    fleet.destroy_vm(&auth, first).await.unwrap();
    let accepted = fleet.destroy_vm_async(&auth, second).await.unwrap();
    assert_eq!(accepted.state, VmState::Destroying);

    tokio::time::sleep(TRANSITION + Duration::from_millis(1)).await;
    assert!(fleet.get_vm_info(first).await.is_err());
    assert!(fleet.get_vm_info(second).await.is_err());
}

// ============================================================================
// Hypervisor operations
// ============================================================================

fn code<T: std::fmt::Debug>(result: anyhow::Result<T>) -> StatusCode {
    classify_anyhow(&result.unwrap_err()).code
}

fn ip(text: &str) -> IpAddr {
    text.parse().unwrap()
}

fn at(request: CreateVmRequest, address: &str) -> CreateVmRequest {
    let mut request = request;
    request.vm_info.address = Address {
        ip_address: Some(ip(address)),
        ..Default::default()
    };
    request
}

/// A hypervisor with 1 GiB and two CPUs in `dc2`.
fn add_small_host(fleet: &InMemoryFleet) {
    fleet.add_machine(Machine {
        hostname: "small".into(),
        location: "dc2".into(),
        network_entry: NetworkEntry {
            hostname: "small".into(),
            host_ip_address: Some(ip("10.1.0.9")),
            subnet_id: "net-a".into(),
            ..Default::default()
        },
        memory_in_mib: 1024,
        num_cpus: 2,
        total_volume_bytes: 1 << 40,
        ..Default::default()
    });
}

async fn move_to(fleet: &InMemoryFleet, hostname: &str, addresses: &[&str]) -> anyhow::Result<()> {
    fleet
        .move_ip_addresses(MoveIpAddressesRequest {
            hypervisor_hostname: hostname.into(),
            ip_addresses: addresses.iter().map(|a| ip(a)).collect(),
        })
        .await
}

#[tokio::test]
async fn moved_address_pins_vm_to_hypervisor() {
    let fleet = sample_fleet();
    let auth = operator();
    move_to(&fleet, "hv3", &["10.0.0.2", "10.0.0.200"]).await.unwrap();

    let reserved = fleet.get_ip_info(ip("10.0.0.200")).await.unwrap();
    assert_eq!(reserved.hypervisor_address, Some(ip("10.1.0.3")));
    assert!(reserved.vm.is_none());

    // Allocation skips reserved addresses.
    let allocated = fleet.create_vm(&auth, create_request("web", false)).await.unwrap();
    assert_eq!(allocated.ip_address, ip("10.0.0.3"));

    let pinned = fleet
        .create_vm(&auth, at(create_request("web", false), "10.0.0.200"))
        .await
        .unwrap();
    assert_eq!(pinned.ip_address, ip("10.0.0.200"));
    assert_eq!(fleet.get_hypervisor_for_vm(pinned.ip_address).await.unwrap(), "hv3");
    assert!(fleet.get_ip_info(pinned.ip_address).await.unwrap().vm.is_some());
}

#[tokio::test]
async fn moving_an_address_in_use_elsewhere_conflicts() {
    let fleet = sample_fleet();
    let created = fleet.create_vm(&operator(), create_request("web", false)).await.unwrap();
    let host = fleet.get_hypervisor_for_vm(created.ip_address).await.unwrap();
    let other = if host == "hv1" { "hv2" } else { "hv1" };
    let address = created.ip_address.to_string();

    assert_eq!(code(move_to(&fleet, other, &[&address]).await), StatusCode::AlreadyExists);
    assert_eq!(code(move_to(&fleet, "nope", &["10.0.0.99"]).await), StatusCode::NotFound);
    // Moving to the hypervisor already running it is a no-op.
    move_to(&fleet, &host, &[&address]).await.unwrap();
}

#[tokio::test]
async fn capacity_and_allocations() {
    let fleet = sample_fleet();
    add_small_host(&fleet);
    let auth = operator();
    let capacity = fleet.get_capacity("small").await.unwrap();
    assert_eq!(capacity.memory_in_mib, 1024);
    assert_eq!(capacity.num_cpus, 2);
    assert_eq!(code(fleet.get_capacity("nope").await), StatusCode::NotFound);

    move_to(&fleet, "small", &["10.0.0.50"]).await.unwrap();
    fleet
        .create_vm(&auth, at(create_request("db", true), "10.0.0.50"))
        .await
        .unwrap();

    let request = GetHypervisorsInLocationRequest {
        location: "dc2".into(),
        ..Default::default()
    };
    let found = fleet.get_hypervisors_in_location(request.clone()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].machine.hostname, "small");
    assert_eq!(found[0].allocated_memory_in_mib, 512);
    assert_eq!(found[0].allocated_milli_cpus, 1500);
    assert!(found[0].vms.is_empty());

    let with_vms = fleet
        .get_hypervisors_in_location(GetHypervisorsInLocationRequest {
            include_vms: true,
            ..request
        })
        .await
        .unwrap();
    assert_eq!(with_vms[0].vms.len(), 1);
    assert_eq!(with_vms[0].vms[0].hostname, "db");

    let everywhere = fleet
        .get_hypervisors_in_location(GetHypervisorsInLocationRequest::default())
        .await
        .unwrap();
    assert_eq!(everywhere.len(), 4);
    let bad_subnet = fleet
        .get_hypervisors_in_location(GetHypervisorsInLocationRequest {
            subnet_id: "net-z".into(),
            ..Default::default()
        })
        .await;
    assert_eq!(code(bad_subnet), StatusCode::InvalidArgument);
}

#[tokio::test(start_paused = true)]
async fn reboot_requires_running_vm() {
    let fleet = slow_fleet();
    let auth = operator();
    let running = fleet.create_vm(&auth, create_request("web", false)).await.unwrap().ip_address;
    let stopped = fleet.create_vm(&auth, create_request("web", true)).await.unwrap().ip_address;

    let outcome = fleet.reboot_vm(&auth, running, Duration::ZERO).await.unwrap();
    assert!(!outcome.dhcp_timed_out);
    assert_eq!(info(&fleet, running).await.state, VmState::Running);

    let outcome = fleet
        .reboot_vm(&auth, running, Duration::from_millis(500))
        .await
        .unwrap();
    assert!(outcome.dhcp_timed_out);
    assert_eq!(info(&fleet, running).await.state, VmState::Starting);
    tokio::time::sleep(TRANSITION + Duration::from_millis(1)).await;
    assert_eq!(info(&fleet, running).await.state, VmState::Running);

    assert!(fleet.reboot_vm(&auth, stopped, Duration::ZERO).await.is_err());
    let stranger = AuthInformation::new("mallory");
    assert_eq!(
        code(fleet.reboot_vm(&stranger, running, Duration::ZERO).await),
        StatusCode::PermissionDenied
    );
}

#[tokio::test]
async fn owner_change_keeps_first_owner() {
    let fleet = sample_fleet();
    let alice = AuthInformation::new("alice");
    let vm = fleet.create_vm(&alice, create_request("web", false)).await.unwrap().ip_address;

    let owners = ["bob", "carol", "bob", "alice"].map(String::from).to_vec();
    fleet.change_vm_owner_users(&alice, vm, owners).await.unwrap();
    assert_eq!(info(&fleet, vm).await.owner_users, ["alice", "bob", "carol"]);

    let bob = AuthInformation::new("bob");
    fleet.change_vm_owner_users(&bob, vm, vec!["dave".into()]).await.unwrap();
    assert_eq!(info(&fleet, vm).await.owner_users, ["alice", "dave"]);

    let result = fleet.change_vm_owner_users(&bob, vm, Vec::new()).await;
    assert_eq!(code(result), StatusCode::PermissionDenied);
}

#[tokio::test]
async fn resize_checks_state_and_host_limits() {
    let fleet = sample_fleet();
    add_small_host(&fleet);
    let auth = operator();
    move_to(&fleet, "small", &["10.0.0.50", "10.0.0.51"]).await.unwrap();
    let vm = fleet
        .create_vm(&auth, at(create_request("db", true), "10.0.0.50"))
        .await
        .unwrap()
        .ip_address;
    let mut neighbour = at(create_request("cache", true), "10.0.0.51");
    neighbour.vm_info.memory_in_mib = 256;
    neighbour.vm_info.milli_cpus = 250;
    fleet.create_vm(&auth, neighbour).await.unwrap();

    let resize = |memory_in_mib, milli_cpus, virtual_cpus| ChangeVmSizeRequest {
        ip_address: vm,
        memory_in_mib,
        milli_cpus,
        virtual_cpus,
    };
    let err = fleet.change_vm_size(&auth, resize(1024, 0, 0)).await.unwrap_err();
    assert_eq!(classify_anyhow(&err).code, StatusCode::ResourceExhausted);
    assert!(err.to_string().contains("768 MiB free"), "{}", err);
    assert_eq!(
        code(fleet.change_vm_size(&auth, resize(0, 1800, 0)).await),
        StatusCode::ResourceExhausted
    );
    assert_eq!(
        code(fleet.change_vm_size(&auth, resize(0, 0, 3)).await),
        StatusCode::InvalidArgument
    );

    fleet.change_vm_size(&auth, resize(768, 1750, 2)).await.unwrap();
    let resized = info(&fleet, vm).await;
    assert_eq!(resized.memory_in_mib, 768);
    assert_eq!(resized.milli_cpus, 1750);
    assert_eq!(resized.virtual_cpus, 2);
    assert_eq!(resized.tags["role"], "web");

    let stranger = AuthInformation::new("mallory");
    assert_eq!(
        code(fleet.change_vm_size(&stranger, resize(512, 0, 0)).await),
        StatusCode::PermissionDenied
    );
    fleet.start_vm(&auth, vm, Duration::ZERO).await.unwrap();
    assert_eq!(
        code(fleet.change_vm_size(&auth, resize(512, 0, 0)).await),
        StatusCode::InvalidArgument
    );
}

#[tokio::test]
async fn vm_queries_filter_by_state_owner_and_tags() {
    let fleet = sample_fleet();
    let alice = operator();
    let bob = AuthInformation::new("bob");
    let web = fleet.create_vm(&alice, create_request("web", false)).await.unwrap().ip_address;
    let idle = fleet.create_vm(&alice, create_request("idle", true)).await.unwrap().ip_address;
    let mut db = create_request("db", false);
    db.vm_info.tags = [("role".to_string(), "db".to_string())].into_iter().collect();
    let db = fleet.create_vm(&bob, db).await.unwrap().ip_address;

    let everything = fleet.list_vms(VmQuery::default()).await.unwrap();
    assert_eq!(everything, vec![web, idle, db]);

    let running = VmQuery {
        ignore_state_mask: 1 << VmState::Stopped.as_u32(),
        ..Default::default()
    };
    assert_eq!(fleet.list_vms(running).await.unwrap(), vec![web, db]);

    let web_tier = VmQuery {
        vm_tags_to_match: [("role".to_string(), vec!["web".to_string()])].into_iter().collect(),
        ..Default::default()
    };
    let infos = fleet.get_vm_infos(web_tier).await.unwrap();
    let hostnames: Vec<_> = infos.iter().map(|vm| vm.hostname.as_str()).collect();
    assert_eq!(hostnames, ["web", "idle"]);

    let bobs = VmQuery {
        owner_users: vec!["bob".into()],
        ..Default::default()
    };
    assert_eq!(fleet.list_vms(bobs).await.unwrap(), vec![db]);

    let host = fleet.get_hypervisor_for_vm(db).await.unwrap();
    let on_host = fleet
        .list_vms(VmQuery {
            hypervisor: host.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(on_host.contains(&db));
    let unknown = fleet
        .list_vms(VmQuery {
            hypervisor: "nope".into(),
            ..Default::default()
        })
        .await;
    assert_eq!(code(unknown), StatusCode::NotFound);
}
