//! Transport adapter integration tests.
//!
//! binrpc runs over real TLS loopback connections through the runtime;
//! the protobuf service and the HTTP gateway are driven in-process with
//! `tower::ServiceExt::oneshot` and a session attached by hand.

mod common;

use axum::extract::ConnectInfo;
use bytes::{Bytes, BytesMut};
use common::{backend, sample_fleet, sample_fleet_with, ClientIdentity, TestPki};
use fleetrpc::adapters::binrpc::client::{BinrpcClient, ClientError};
use fleetrpc::adapters::binrpc::messages::{
    ChangeVmOwnerUsersRequest, GetCapacityRequest, GetUpdatesRequest, HypervisorAddress, RebootVmRequest,
    VmAddressRequest,
};
use fleetrpc::adapters::gateway::{ErrorBody, Gateway};
use fleetrpc::adapters::grpc::{
    decode_grpc_message, encode_grpc_message, method_path, proto, FleetGrpcServer, FleetGrpcService,
};
use fleetrpc::adapters::{AdapterConfig, FleetMethod};
use fleetrpc::backend::{FleetBackend, MemoryFleetSettings};
use fleetrpc::core::runtime::Runtime;
use fleetrpc::core::status::StatusCode;
use fleetrpc::model::{
    Address, Capacity, CreateVmRequest, ListSubnetsRequest, Machine, MoveIpAddressesRequest, StartVmOutcome,
    Subnet, VmInfo, VmQuery, VmState,
};
use fleetrpc::net::session::TlsSession;
use http_body_util::{BodyExt, Full};
use prost::Message;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

const MAX_FRAME: usize = 16 * 1024 * 1024;

fn session_for(identity: &ClientIdentity) -> TlsSession {
    TlsSession::new("127.0.0.1:40000".parse().unwrap(), Some(vec![identity.cert.clone()]))
}

async fn start_runtime(pki: &TestPki, fleet: &fleetrpc::backend::InMemoryFleet) -> Runtime {
    let mut runtime = Runtime::new(pki.config(""), backend(fleet)).unwrap();
    runtime.start().await.unwrap();
    runtime
}

// ============================================================================
// binrpc over TLS
// ============================================================================

#[tokio::test]
async fn binrpc_create_and_inspect_vm() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();

    let alice = pki.client("alice", &["ops"], None);
    let stream = pki.connect(addr, Some(&alice)).await.unwrap();
    let mut client = BinrpcClient::new(stream, MAX_FRAME);

    let request = CreateVmRequest {
        vm_info: VmInfo {
            hostname: "web-1".into(),
            memory_in_mib: 1024,
            ..Default::default()
        },
        ..Default::default()
    };
    let created = client.create_vm(&request, b"image-bytes", b"").await.unwrap();
    let ip = created.ip_address.unwrap();
    assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
    assert!(!created.dhcp_timed_out);
    assert_eq!(created.vm.owner_users, vec!["alice".to_string()]);

    let vm: VmInfo = client
        .call(FleetMethod::GetVmInfo, &VmAddressRequest { ip_address: ip })
        .await
        .unwrap();
    assert_eq!(vm.hostname, "web-1");
    assert_eq!(vm.state, VmState::Running);

    let subnets: Vec<Subnet> = client
        .call(FleetMethod::ListSubnets, &ListSubnetsRequest { sort: true })
        .await
        .unwrap();
    assert_eq!(subnets.len(), 1);
    assert_eq!(subnets[0].id, "net-a");

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn binrpc_permitted_methods_are_enforced() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();

    let reader = pki.client("reader", &[], Some(&["Fleet.GetVmInfo"]));
    let stream = pki.connect(addr, Some(&reader)).await.unwrap();
    let mut client = BinrpcClient::new(stream, MAX_FRAME);

    let err = client
        .call::<_, ()>(
            FleetMethod::DestroyVm,
            &VmAddressRequest {
                ip_address: "10.0.0.2".parse().unwrap(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(StatusCode::PermissionDenied));

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn binrpc_update_stream_starts_with_snapshot() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();
    let alice = pki.client("alice", &["ops"], None);

    let watcher = BinrpcClient::new(pki.connect(addr, Some(&alice)).await.unwrap(), MAX_FRAME);
    let mut updates = watcher
        .get_updates(&GetUpdatesRequest {
            location: "dc1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.changed_machines.len(), 3);

    let mut client = BinrpcClient::new(pki.connect(addr, Some(&alice)).await.unwrap(), MAX_FRAME);
    let created = client
        .create_vm(&CreateVmRequest::default(), b"", b"")
        .await
        .unwrap();
    let ip = created.ip_address.unwrap().to_string();

    let mut seen = false;
    while !seen {
        let event = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        seen = event.changed_vms.contains_key(&ip);
    }

    updates.request_health().await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Some(status) = event.health_status {
            assert_eq!(status, fleet.health_status());
            break;
        }
    }

    updates.close().await.unwrap();
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn binrpc_hypervisor_methods() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();
    let alice = pki.client("alice", &["ops"], None);
    let mut client = BinrpcClient::new(pki.connect(addr, Some(&alice)).await.unwrap(), MAX_FRAME);
    let pinned: IpAddr = "10.0.0.9".parse().unwrap();

    client
        .call::<_, ()>(
            FleetMethod::MoveIpAddresses,
            &MoveIpAddressesRequest {
                hypervisor_hostname: "hv2".into(),
                ip_addresses: vec![pinned],
            },
        )
        .await
        .unwrap();
    let request = CreateVmRequest {
        vm_info: VmInfo {
            hostname: "pinned".into(),
            address: Address {
                ip_address: Some(pinned),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    client.create_vm(&request, b"", b"").await.unwrap();
    let hypervisor: HypervisorAddress = client
        .call(FleetMethod::GetHypervisorForVm, &VmAddressRequest { ip_address: pinned })
        .await
        .unwrap();
    assert_eq!(hypervisor.address, "hv2:6976");

    let outcome: StartVmOutcome = client
        .call(
            FleetMethod::RebootVm,
            &RebootVmRequest {
                ip_address: pinned,
                dhcp_timeout: Duration::ZERO,
            },
        )
        .await
        .unwrap();
    assert!(!outcome.dhcp_timed_out);

    client
        .call::<_, ()>(
            FleetMethod::ChangeVmOwnerUsers,
            &ChangeVmOwnerUsersRequest {
                ip_address: pinned,
                owner_users: vec!["bob".into()],
            },
        )
        .await
        .unwrap();
    let vms: Vec<VmInfo> = client.call(FleetMethod::GetVmInfos, &VmQuery::default()).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].owner_users, vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(vms[0].state, VmState::Running);

    let capacity: Capacity = client
        .call(FleetMethod::GetCapacity, &GetCapacityRequest { hostname: "hv2".into() })
        .await
        .unwrap();
    assert_eq!(capacity, Capacity::default());

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn binrpc_public_update_streams_are_limited_per_user() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();
    // Only GetVmInfo is granted; GetUpdates is reachable as a public method.
    let reader = pki.client("reader", &[], Some(&["Fleet.GetVmInfo"]));
    let request = GetUpdatesRequest::default();

    let first = BinrpcClient::new(pki.connect(addr, Some(&reader)).await.unwrap(), MAX_FRAME);
    let mut updates = first.get_updates(&request).await.unwrap();

    let second = BinrpcClient::new(pki.connect(addr, Some(&reader)).await.unwrap(), MAX_FRAME);
    let err = second.get_updates(&request).await.err().unwrap();
    assert_eq!(err.code(), Some(StatusCode::ResourceExhausted));

    // Not public and not granted.
    let mut client = BinrpcClient::new(pki.connect(addr, Some(&reader)).await.unwrap(), MAX_FRAME);
    let err = client
        .call::<_, Vec<IpAddr>>(FleetMethod::ListVms, &VmQuery::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(StatusCode::PermissionDenied));

    // Callers granted the method directly are not limited.
    let alice = pki.client("alice", &["ops"], None);
    for _ in 0..2 {
        let client = BinrpcClient::new(pki.connect(addr, Some(&alice)).await.unwrap(), MAX_FRAME);
        client.get_updates(&request).await.unwrap();
    }

    // Closing the stream frees the slot.
    updates.close().await.unwrap();
    let mut reopened = None;
    for _ in 0..100 {
        let client = BinrpcClient::new(pki.connect(addr, Some(&reader)).await.unwrap(), MAX_FRAME);
        match client.get_updates(&request).await {
            Ok(stream) => {
                reopened = Some(stream);
                break;
            }
            Err(e) => {
                assert_eq!(e.code(), Some(StatusCode::ResourceExhausted));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    assert!(reopened.is_some());

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn tls_handshake_requires_client_certificate() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();

    // TLS 1.3 reports the rejected certificate on the first read.
    let outcome = match pki.connect(addr, None).await {
        Err(_) => true,
        Ok(stream) => {
            let mut client = BinrpcClient::new(stream, MAX_FRAME);
            client
                .call::<_, Vec<Subnet>>(FleetMethod::ListSubnets, &ListSubnetsRequest::default())
                .await
                .is_err()
        }
    };
    assert!(outcome);

    runtime.stop().await.unwrap();
}

// ============================================================================
// Protobuf service
// ============================================================================

fn grpc_server(fleet: &fleetrpc::backend::InMemoryFleet) -> (FleetGrpcServer, watch::Sender<bool>) {
    grpc_server_with(fleet, AdapterConfig::default())
}

fn grpc_server_with(
    fleet: &fleetrpc::backend::InMemoryFleet,
    config: AdapterConfig,
) -> (FleetGrpcServer, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let service = FleetGrpcService::new(backend(fleet), Arc::new(config));
    (FleetGrpcServer::new(service, rx), tx)
}

/// Issue one unary call; returns the grpc-status and the response bytes.
async fn grpc_call<M: Message>(
    server: &FleetGrpcServer,
    method: FleetMethod,
    session: Option<TlsSession>,
    message: &M,
) -> (i32, Bytes) {
    let mut buf = BytesMut::new();
    encode_grpc_message(message, &mut buf);
    let mut request = http::Request::post(method_path(method))
        .header("content-type", "application/grpc")
        .body(Full::new(buf.freeze()))
        .unwrap();
    if let Some(session) = session {
        request.extensions_mut().insert(session);
    }

    let response = server.clone().oneshot(request).await.unwrap();
    let header_status = response
        .headers()
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok());
    let collected = response.into_body().collect().await.unwrap();
    let trailer_status = collected
        .trailers()
        .and_then(|t| t.get("grpc-status"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok());
    let status = header_status.or(trailer_status).unwrap();
    (status, collected.to_bytes())
}

#[tokio::test]
async fn grpc_list_and_create() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let alice = session_for(&pki.client("alice", &["ops"], None));

    let (status, body) = grpc_call(
        &server,
        FleetMethod::ListHypervisorsInLocation,
        Some(alice.clone()),
        &proto::ListHypervisorsInLocationRequest {
            location: "dc1".into(),
            tags_to_include: vec!["rack".into()],
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, 0);
    let listing: proto::ListHypervisorsInLocationResponse = decode_grpc_message(&body).unwrap();
    assert_eq!(listing.hypervisor_addresses, vec!["hv1:6976", "hv2:6976", "hv3:6976"]);
    assert_eq!(listing.tags_for_hypervisors[1].tags.get("rack").unwrap(), "r2");

    let (status, body) = grpc_call(
        &server,
        FleetMethod::CreateVm,
        Some(alice.clone()),
        &proto::CreateVmRequest {
            vm_info: Some(proto::VmInfo {
                hostname: "db-1".into(),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, 0);
    let created: proto::CreateVmResponse = decode_grpc_message(&body).unwrap();
    assert_eq!(created.ip_address, vec![10, 0, 0, 2]);
    assert_eq!(created.vm.unwrap().state, proto::VmState::Running as i32);
}

#[tokio::test]
async fn grpc_missing_identity_is_unauthenticated() {
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let (status, _) = grpc_call(&server, FleetMethod::ListSubnets, None, &proto::ListSubnetsRequest::default()).await;
    assert_eq!(status, tonic::Code::Unauthenticated as i32);
}

#[tokio::test]
async fn grpc_unknown_method_is_unimplemented() {
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let request = http::Request::post("/fleetrpc.v1.Fleet/Teleport")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = server.oneshot(request).await.unwrap();
    let status = response.headers().get("grpc-status").unwrap().to_str().unwrap().to_string();
    assert_eq!(status, (tonic::Code::Unimplemented as i32).to_string());
}

#[tokio::test]
async fn grpc_destroy_requires_ownership() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let alice = session_for(&pki.client("alice", &[], None));
    let mallory = session_for(&pki.client("mallory", &[], None));

    let (status, body) = grpc_call(
        &server,
        FleetMethod::CreateVm,
        Some(alice),
        &proto::CreateVmRequest {
            vm_info: Some(proto::VmInfo::default()),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, 0);
    let created: proto::CreateVmResponse = decode_grpc_message(&body).unwrap();

    let (status, _) = grpc_call(
        &server,
        FleetMethod::DestroyVm,
        Some(mallory),
        &proto::VmRequest {
            ip_address: created.ip_address,
        },
    )
    .await;
    assert_eq!(status, tonic::Code::PermissionDenied as i32);
}

#[tokio::test]
async fn grpc_oversized_request_is_rejected() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let config = AdapterConfig {
        max_frame_bytes: 1024,
        ..AdapterConfig::default()
    };
    let (server, _shutdown) = grpc_server_with(&fleet, config);
    let alice = session_for(&pki.client("alice", &["ops"], None));

    let (status, _) = grpc_call(
        &server,
        FleetMethod::ListSubnets,
        Some(alice.clone()),
        &proto::ListSubnetsRequest {
            page_token: "9".repeat(64 * 1024),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, tonic::Code::ResourceExhausted as i32);

    let (status, _) = grpc_call(&server, FleetMethod::ListSubnets, Some(alice), &proto::ListSubnetsRequest::default()).await;
    assert_eq!(status, 0);
}

#[tokio::test]
async fn grpc_update_stream_ends_with_backpressure_status() {
    let pki = TestPki::new();
    let fleet = sample_fleet_with(MemoryFleetSettings {
        hub_capacity: 2,
        ..MemoryFleetSettings::default()
    });
    let (server, _shutdown) = grpc_server(&fleet);
    let alice = session_for(&pki.client("alice", &["ops"], None));

    let response = server.clone().oneshot(updates_request(alice)).await.unwrap();
    assert!(response.headers().get("grpc-status").is_none());

    // The snapshot holds one slot; the pump has not run yet.
    for i in 0..4 {
        fleet.add_machine(Machine {
            hostname: format!("late-{}", i),
            location: "dc1/row2".into(),
            ..Default::default()
        });
    }

    let collected = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .unwrap()
        .unwrap();
    let trailers = collected.trailers().cloned().unwrap();
    assert_eq!(trailers["grpc-status"], "8");
    assert_eq!(trailers["grpc-message"], "receiver not keeping up with updates");
    assert_eq!(fleet.hub().stats().backpressure_drops, 1);
}

fn updates_request(session: TlsSession) -> http::Request<Full<Bytes>> {
    let mut buf = BytesMut::new();
    encode_grpc_message(&proto::GetUpdatesRequest::default(), &mut buf);
    let mut request = http::Request::post(method_path(FleetMethod::GetUpdates))
        .header("content-type", "application/grpc")
        .body(Full::new(buf.freeze()))
        .unwrap();
    request.extensions_mut().insert(session);
    request
}

#[tokio::test]
async fn grpc_public_methods_skip_permitted_list_but_are_limited() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let reader = session_for(&pki.client("reader", &[], Some(&["Fleet.GetVmInfo"])));
    let alice = session_for(&pki.client("alice", &["ops"], None));

    let (status, body) = grpc_call(
        &server,
        FleetMethod::ListHypervisorLocations,
        Some(reader.clone()),
        &proto::ListHypervisorLocationsRequest::default(),
    )
    .await;
    assert_eq!(status, 0);
    let locations: proto::ListHypervisorLocationsResponse = decode_grpc_message(&body).unwrap();
    assert_eq!(locations.locations, vec!["dc1/row1"]);
    let (status, _) = grpc_call(&server, FleetMethod::ListVms, Some(reader.clone()), &proto::VmQuery::default()).await;
    assert_eq!(status, tonic::Code::PermissionDenied as i32);

    let stream = server
        .clone()
        .oneshot(updates_request(reader.clone()))
        .await
        .unwrap();
    assert!(stream.headers().get("grpc-status").is_none());
    let (status, _) = grpc_call(
        &server,
        FleetMethod::GetUpdates,
        Some(reader.clone()),
        &proto::GetUpdatesRequest::default(),
    )
    .await;
    assert_eq!(status, tonic::Code::ResourceExhausted as i32);

    // A different limited method has its own slot.
    let (status, _) = grpc_call(
        &server,
        FleetMethod::GetMachineInfo,
        Some(reader.clone()),
        &proto::GetMachineInfoRequest { hostname: "hv1".into() },
    )
    .await;
    assert_eq!(status, 0);

    // Unrestricted callers are never limited.
    let first = server.clone().oneshot(updates_request(alice.clone())).await.unwrap();
    let second = server.clone().oneshot(updates_request(alice)).await.unwrap();
    assert!(first.headers().get("grpc-status").is_none());
    assert!(second.headers().get("grpc-status").is_none());

    // Dropping the body ends the pump and frees the slot.
    drop(stream);
    let mut reopened = None;
    for _ in 0..100 {
        let response = server
            .clone()
            .oneshot(updates_request(reader.clone()))
            .await
            .unwrap();
        if response.headers().get("grpc-status").is_none() {
            reopened = Some(response);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reopened.is_some());
}

#[tokio::test]
async fn grpc_vm_resize_and_listing() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let (server, _shutdown) = grpc_server(&fleet);
    let alice = session_for(&pki.client("alice", &["ops"], None));

    let (status, body) = grpc_call(
        &server,
        FleetMethod::CreateVm,
        Some(alice.clone()),
        &proto::CreateVmRequest {
            vm_info: Some(proto::VmInfo {
                hostname: "db-1".into(),
                memory_in_mib: 512,
                ..Default::default()
            }),
            do_not_start: true,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, 0);
    let created: proto::CreateVmResponse = decode_grpc_message(&body).unwrap();

    let (status, _) = grpc_call(
        &server,
        FleetMethod::ChangeVmSize,
        Some(alice.clone()),
        &proto::ChangeVmSizeRequest {
            ip_address: created.ip_address.clone(),
            memory_in_mib: 2048,
            virtual_cpus: 2,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(status, 0);

    let (status, body) = grpc_call(&server, FleetMethod::GetVmInfos, Some(alice.clone()), &proto::VmQuery::default()).await;
    assert_eq!(status, 0);
    let infos: proto::GetVmInfosResponse = decode_grpc_message(&body).unwrap();
    assert_eq!(infos.vm_infos.len(), 1);
    assert_eq!(infos.vm_infos[0].memory_in_mib, 2048);
    assert_eq!(infos.vm_infos[0].virtual_cpus, 2);

    let running_only = proto::VmQuery {
        ignore_state_mask: 1 << VmState::Stopped.as_u32(),
        ..Default::default()
    };
    let (status, body) = grpc_call(&server, FleetMethod::ListVms, Some(alice.clone()), &running_only).await;
    assert_eq!(status, 0);
    let listing: proto::ListVmsResponse = decode_grpc_message(&body).unwrap();
    assert!(listing.ip_addresses.is_empty());

    let (status, _) = grpc_call(
        &server,
        FleetMethod::RebootVm,
        Some(alice),
        &proto::RebootVmRequest {
            ip_address: created.ip_address,
            dhcp_timeout_ms: 0,
        },
    )
    .await;
    assert_eq!(status, tonic::Code::InvalidArgument as i32);
}

// ============================================================================
// Same failure, same status on every transport
// ============================================================================

#[tokio::test]
async fn status_codes_agree_across_transports() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let mut runtime = start_runtime(&pki, &fleet).await;
    let addr = runtime.local_addr("binrpc").unwrap();
    let identity = pki.client("alice", &["ops"], None);
    let missing: IpAddr = "10.0.0.200".parse().unwrap();

    let mut client = BinrpcClient::new(pki.connect(addr, Some(&identity)).await.unwrap(), MAX_FRAME);
    let (server, _shutdown) = grpc_server(&fleet);

    // Typed error from the backend.
    let err: ClientError = client
        .call::<_, VmInfo>(FleetMethod::GetVmInfo, &VmAddressRequest { ip_address: missing })
        .await
        .unwrap_err();
    let (status, _) = grpc_call(
        &server,
        FleetMethod::GetVmInfo,
        Some(session_for(&identity)),
        &proto::VmRequest {
            ip_address: vec![10, 0, 0, 200],
        },
    )
    .await;
    assert_eq!(err.code(), Some(StatusCode::NotFound));
    assert_eq!(status, StatusCode::NotFound.to_tonic() as i32);

    // Legacy message classified by phrase.
    let err: ClientError = client
        .call::<_, HypervisorAddress>(FleetMethod::GetHypervisorForVm, &VmAddressRequest { ip_address: missing })
        .await
        .unwrap_err();
    let (status, _) = grpc_call(
        &server,
        FleetMethod::GetHypervisorForVm,
        Some(session_for(&identity)),
        &proto::VmRequest {
            ip_address: vec![10, 0, 0, 200],
        },
    )
    .await;
    let code = err.code().unwrap();
    assert_eq!(status, code.to_tonic() as i32);

    runtime.stop().await.unwrap();
}

// ============================================================================
// HTTP gateway
// ============================================================================

fn gateway(fleet: &fleetrpc::backend::InMemoryFleet) -> axum::Router {
    Gateway::new(FleetGrpcService::new(backend(fleet), Arc::new(AdapterConfig::default()))).router()
}

fn gateway_request(path: &str, body: &str, session: Option<TlsSession>) -> http::Request<axum::body::Body> {
    let mut request = http::Request::post(path)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    if let Some(session) = session {
        request.extensions_mut().insert(ConnectInfo(session));
    }
    request
}

#[tokio::test]
async fn gateway_lists_subnets_as_json() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let session = session_for(&pki.client("alice", &["ops"], None));

    let response = gateway(&fleet)
        .oneshot(gateway_request("/v1/ListSubnets", "{}", Some(session)))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["subnets"][0]["id"], "net-a");
    assert_eq!(json["subnets"][0]["ip_gateway"], "10.0.0.1");
}

#[tokio::test]
async fn gateway_maps_errors_to_http() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let session = session_for(&pki.client("alice", &["ops"], None));
    let router = gateway(&fleet);

    let response = router
        .clone()
        .oneshot(gateway_request(
            "/v1/GetVmInfo",
            r#"{"ip_address": "10.0.0.99"}"#,
            Some(session.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let error: ErrorBody = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code, "NOT_FOUND");

    let response = router
        .clone()
        .oneshot(gateway_request("/v1/GetVmInfo", "{not json", Some(session.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(gateway_request("/v1/GetUpdates", "{}", Some(session)))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn gateway_serves_inventory_methods() {
    let pki = TestPki::new();
    let fleet = sample_fleet();
    let session = session_for(&pki.client("alice", &["ops"], None));
    let router = gateway(&fleet);

    let response = router
        .clone()
        .oneshot(gateway_request(
            "/v1/CreateVm",
            r#"{"vm_info": {"hostname": "web-1", "memory_in_mib": 256}}"#,
            Some(session.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let response = router
        .clone()
        .oneshot(gateway_request(
            "/v1/GetHypervisorsInLocation",
            r#"{"location": "dc1", "include_vms": true}"#,
            Some(session.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let hypervisors = json["hypervisors"].as_array().unwrap();
    assert_eq!(hypervisors.len(), 3);
    let total: u64 = hypervisors
        .iter()
        .map(|hv| hv["allocated_memory_in_mib"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 256);
    let vms: usize = hypervisors.iter().map(|hv| hv["vms"].as_array().unwrap().len()).sum();
    assert_eq!(vms, 1);

    let response = router
        .clone()
        .oneshot(gateway_request("/v1/ListVms", "{}", Some(session.clone())))
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ip_addresses"][0], "10.0.0.2");

    // Running VMs cannot be resized.
    let response = router
        .oneshot(gateway_request(
            "/v1/ChangeVmSize",
            r#"{"ip_address": "10.0.0.2", "memory_in_mib": 512}"#,
            Some(session),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
}
