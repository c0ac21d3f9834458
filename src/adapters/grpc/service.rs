//! Protobuf method handlers.
//!
//! One method per RPC: convert the request, call the backend once, convert
//! the reply. Authentication and authorization happen before these run, in
//! whichever front end (gRPC or the JSON gateway) received the call.

use super::convert::{self, require_ip};
use super::proto;
use crate::adapters::pagination::paginate;
use crate::adapters::{
    audit_destroy_outcome, audit_destroy_start, reject_streamed_payload, AdapterConfig, FleetMethod,
};
use crate::backend::FleetBackend;
use crate::core::error::FleetError;
use crate::core::status::{classify, classify_anyhow, Classification, StatusCode};
use crate::hub::Subscription;
use crate::model::{self, UpdateFilter};
use crate::net::identity::AuthInformation;
use std::sync::Arc;
use std::time::Duration;

type Handled<T> = Result<T, Classification>;

fn invalid(error: FleetError) -> Classification {
    classify(&error)
}

fn backend<T>(result: anyhow::Result<T>) -> Handled<T> {
    result.map_err(|e| classify_anyhow(&e))
}

/// Handlers for the `fleetrpc.v1.Fleet` schema.
#[derive(Clone)]
pub struct FleetGrpcService {
    backend: Arc<dyn FleetBackend>,
    config: Arc<AdapterConfig>,
    /// Transport name for audit records.
    transport: &'static str,
}

impl FleetGrpcService {
    pub fn new(backend: Arc<dyn FleetBackend>, config: Arc<AdapterConfig>) -> Self {
        Self {
            backend,
            config,
            transport: "grpc",
        }
    }

    pub fn with_transport(mut self, transport: &'static str) -> Self {
        self.transport = transport;
        self
    }

    pub fn backend(&self) -> &Arc<dyn FleetBackend> {
        &self.backend
    }

    pub fn config(&self) -> &Arc<AdapterConfig> {
        &self.config
    }

    // Machines

    pub async fn change_machine_tags(
        &self,
        auth: &AuthInformation,
        request: proto::ChangeMachineTagsRequest,
    ) -> Handled<proto::Empty> {
        let request = model::ChangeMachineTagsRequest {
            hostname: request.hostname,
            tags: request.tags,
        };
        backend(self.backend.change_machine_tags(auth, request).await)?;
        Ok(proto::Empty {})
    }

    pub async fn power_on_machine(
        &self,
        auth: &AuthInformation,
        request: proto::PowerOnMachineRequest,
    ) -> Handled<proto::Empty> {
        backend(self.backend.power_on_machine(auth, &request.hostname).await)?;
        Ok(proto::Empty {})
    }

    pub async fn get_machine_info(
        &self,
        _auth: &AuthInformation,
        request: proto::GetMachineInfoRequest,
    ) -> Handled<proto::GetMachineInfoResponse> {
        let request = model::GetMachineInfoRequest {
            hostname: request.hostname,
        };
        let info = backend(self.backend.get_machine_info(request).await)?;
        Ok(proto::GetMachineInfoResponse {
            location: info.location,
            machine: Some(info.machine.into()),
            subnets: info.subnets.into_iter().map(Into::into).collect(),
        })
    }

    pub async fn move_ip_addresses(
        &self,
        _auth: &AuthInformation,
        request: proto::MoveIpAddressesRequest,
    ) -> Handled<proto::Empty> {
        let request = model::MoveIpAddressesRequest {
            hypervisor_hostname: request.hypervisor_hostname,
            ip_addresses: convert::ip_list("ip_addresses", &request.ip_addresses).map_err(invalid)?,
        };
        backend(self.backend.move_ip_addresses(request).await)?;
        Ok(proto::Empty {})
    }

    pub async fn get_capacity(
        &self,
        _auth: &AuthInformation,
        request: proto::GetCapacityRequest,
    ) -> Handled<proto::GetCapacityResponse> {
        let capacity = backend(self.backend.get_capacity(&request.hostname).await)?;
        Ok(proto::GetCapacityResponse {
            memory_in_mib: capacity.memory_in_mib,
            num_cpus: capacity.num_cpus,
            total_volume_bytes: capacity.total_volume_bytes,
        })
    }

    // Lookups

    pub async fn get_hypervisor_for_vm(
        &self,
        _auth: &AuthInformation,
        request: proto::VmRequest,
    ) -> Handled<proto::GetHypervisorForVmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let host = backend(self.backend.get_hypervisor_for_vm(ip).await)?;
        Ok(proto::GetHypervisorForVmResponse {
            hypervisor_address: self.config.hypervisor_address(&host),
        })
    }

    pub async fn get_ip_info(
        &self,
        _auth: &AuthInformation,
        request: proto::VmRequest,
    ) -> Handled<proto::GetIpInfoResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let info = backend(self.backend.get_ip_info(ip).await)?;
        Ok(proto::GetIpInfoResponse {
            hypervisor_address: convert::ip_to_bytes(info.hypervisor_address),
            vm: info.vm.map(Into::into),
        })
    }

    // Listing

    pub async fn list_hypervisor_locations(
        &self,
        _auth: &AuthInformation,
        request: proto::ListHypervisorLocationsRequest,
    ) -> Handled<proto::ListHypervisorLocationsResponse> {
        let query = model::ListHypervisorLocationsRequest {
            top_location: request.top_location,
        };
        let locations = backend(self.backend.list_hypervisor_locations(query).await)?;
        let page = paginate(locations, &request.page_token, request.page_size).map_err(invalid)?;
        Ok(proto::ListHypervisorLocationsResponse {
            locations: page.items,
            next_page_token: page.next_page_token,
        })
    }

    pub async fn list_hypervisors_in_location(
        &self,
        _auth: &AuthInformation,
        request: proto::ListHypervisorsInLocationRequest,
    ) -> Handled<proto::ListHypervisorsInLocationResponse> {
        let query = model::ListHypervisorsInLocationRequest {
            location: request.location,
            subnet_id: request.subnet_id,
            hypervisor_tags_to_match: convert::match_tags_from_proto(request.hypervisor_tags_to_match),
            include_unhealthy: request.include_unhealthy,
            tags_to_include: request.tags_to_include,
        };
        let found = backend(self.backend.list_hypervisors_in_location(query).await)?;
        let rows: Vec<_> = found
            .hypervisor_addresses
            .into_iter()
            .zip(found.tags_for_hypervisors.into_iter().chain(std::iter::repeat_with(Default::default)))
            .collect();
        let page = paginate(rows, &request.page_token, request.page_size).map_err(invalid)?;
        let (hypervisor_addresses, tags): (Vec<_>, Vec<_>) = page.items.into_iter().unzip();
        Ok(proto::ListHypervisorsInLocationResponse {
            hypervisor_addresses,
            tags_for_hypervisors: tags.into_iter().map(|tags| proto::HypervisorTags { tags }).collect(),
            next_page_token: page.next_page_token,
        })
    }

    pub async fn list_vms_in_location(
        &self,
        _auth: &AuthInformation,
        request: proto::ListVmsInLocationRequest,
    ) -> Handled<proto::ListVmsInLocationResponse> {
        let query = model::ListVmsInLocationRequest {
            location: request.location,
            hypervisor_tags_to_match: convert::match_tags_from_proto(request.hypervisor_tags_to_match),
            owner_groups: request.owner_groups,
            owner_users: request.owner_users,
            vm_tags_to_match: convert::match_tags_from_proto(request.vm_tags_to_match),
        };
        let ips = backend(self.backend.list_vms_in_location(query).await)?;
        let page = paginate(ips, &request.page_token, request.page_size).map_err(invalid)?;
        Ok(proto::ListVmsInLocationResponse {
            ip_addresses: page.items.into_iter().map(|ip| convert::ip_to_bytes(Some(ip))).collect(),
            next_page_token: page.next_page_token,
        })
    }

    pub async fn list_subnets(
        &self,
        _auth: &AuthInformation,
        request: proto::ListSubnetsRequest,
    ) -> Handled<proto::ListSubnetsResponse> {
        let query = model::ListSubnetsRequest { sort: request.sort };
        let subnets = backend(self.backend.list_subnets(query).await)?;
        let page = paginate(subnets, &request.page_token, request.page_size).map_err(invalid)?;
        Ok(proto::ListSubnetsResponse {
            subnets: page.items.into_iter().map(Into::into).collect(),
            next_page_token: page.next_page_token,
        })
    }

    pub async fn get_hypervisors_in_location(
        &self,
        _auth: &AuthInformation,
        request: proto::GetHypervisorsInLocationRequest,
    ) -> Handled<proto::GetHypervisorsInLocationResponse> {
        let query = model::GetHypervisorsInLocationRequest {
            location: request.location,
            subnet_id: request.subnet_id,
            hypervisor_tags_to_match: convert::match_tags_from_proto(request.hypervisor_tags_to_match),
            include_unhealthy: request.include_unhealthy,
            include_vms: request.include_vms,
        };
        let hypervisors = backend(self.backend.get_hypervisors_in_location(query).await)?;
        Ok(proto::GetHypervisorsInLocationResponse {
            hypervisors: hypervisors.into_iter().map(Into::into).collect(),
        })
    }

    pub async fn list_vms(&self, _auth: &AuthInformation, request: proto::VmQuery) -> Handled<proto::ListVmsResponse> {
        let ips = backend(self.backend.list_vms(convert::vm_query(request)).await)?;
        Ok(proto::ListVmsResponse {
            ip_addresses: ips.into_iter().map(|ip| convert::ip_to_bytes(Some(ip))).collect(),
        })
    }

    pub async fn get_vm_infos(
        &self,
        _auth: &AuthInformation,
        request: proto::VmQuery,
    ) -> Handled<proto::GetVmInfosResponse> {
        let vms = backend(self.backend.get_vm_infos(convert::vm_query(request)).await)?;
        Ok(proto::GetVmInfosResponse {
            vm_infos: vms.into_iter().map(Into::into).collect(),
        })
    }

    // VM lifecycle

    pub async fn create_vm(
        &self,
        auth: &AuthInformation,
        request: proto::CreateVmRequest,
    ) -> Handled<proto::CreateVmResponse> {
        // Payloads travel inline here; nothing is streamed after the message.
        if request.image_data_size > 0 {
            return Err(Classification::new(
                StatusCode::Unimplemented,
                "ImageDataSize not supported on this transport",
            ));
        }
        if request.user_data_size > 0 {
            return Err(Classification::new(
                StatusCode::Unimplemented,
                "UserDataSize not supported on this transport; send user_data inline",
            ));
        }
        if request.secondary_volumes_data {
            return Err(Classification::new(
                StatusCode::Unimplemented,
                "SecondaryVolumesData not supported",
            ));
        }
        let request = convert::create_vm_request(request).map_err(invalid)?;
        let outcome = backend(self.backend.create_vm(auth, request).await)?;
        Ok(proto::CreateVmResponse {
            ip_address: convert::ip_to_bytes(Some(outcome.ip_address)),
            dhcp_timed_out: outcome.dhcp_timed_out,
            vm: Some(outcome.vm.into()),
        })
    }

    pub async fn create_vm_async(
        &self,
        auth: &AuthInformation,
        request: proto::CreateVmRequest,
    ) -> Handled<proto::VmResponse> {
        let request = convert::create_vm_request(request).map_err(invalid)?;
        reject_streamed_payload(&request)?;
        let vm = backend(self.backend.create_vm_async(auth, request).await)?;
        Ok(proto::VmResponse { vm: Some(vm.into()) })
    }

    pub async fn destroy_vm(&self, auth: &AuthInformation, request: proto::VmRequest) -> Handled<proto::Empty> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let method = FleetMethod::DestroyVm;
        audit_destroy_start(self.transport, method, auth, ip);
        let result = backend(self.backend.destroy_vm(auth, ip).await);
        audit_destroy_outcome(self.transport, method, auth, ip, result.as_ref().err());
        result.map(|()| proto::Empty {})
    }

    pub async fn destroy_vm_async(
        &self,
        auth: &AuthInformation,
        request: proto::VmRequest,
    ) -> Handled<proto::VmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let method = FleetMethod::DestroyVmAsync;
        audit_destroy_start(self.transport, method, auth, ip);
        let result = backend(self.backend.destroy_vm_async(auth, ip).await);
        audit_destroy_outcome(self.transport, method, auth, ip, result.as_ref().err());
        result.map(|vm| proto::VmResponse { vm: Some(vm.into()) })
    }

    pub async fn start_vm(
        &self,
        auth: &AuthInformation,
        request: proto::StartVmRequest,
    ) -> Handled<proto::StartVmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let timeout = Duration::from_millis(request.dhcp_timeout_ms);
        let outcome = backend(self.backend.start_vm(auth, ip, timeout).await)?;
        Ok(proto::StartVmResponse {
            dhcp_timed_out: outcome.dhcp_timed_out,
        })
    }

    pub async fn start_vm_async(&self, auth: &AuthInformation, request: proto::VmRequest) -> Handled<proto::VmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let vm = backend(self.backend.start_vm_async(auth, ip).await)?;
        Ok(proto::VmResponse { vm: Some(vm.into()) })
    }

    pub async fn stop_vm(&self, auth: &AuthInformation, request: proto::VmRequest) -> Handled<proto::Empty> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        backend(self.backend.stop_vm(auth, ip).await)?;
        Ok(proto::Empty {})
    }

    pub async fn get_vm_info(&self, _auth: &AuthInformation, request: proto::VmRequest) -> Handled<proto::VmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let vm = backend(self.backend.get_vm_info(ip).await)?;
        Ok(proto::VmResponse { vm: Some(vm.into()) })
    }

    pub async fn change_vm_tags(
        &self,
        auth: &AuthInformation,
        request: proto::ChangeVmTagsRequest,
    ) -> Handled<proto::Empty> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        backend(self.backend.change_vm_tags(auth, ip, request.tags).await)?;
        Ok(proto::Empty {})
    }

    pub async fn reboot_vm(
        &self,
        auth: &AuthInformation,
        request: proto::RebootVmRequest,
    ) -> Handled<proto::RebootVmResponse> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        let timeout = Duration::from_millis(request.dhcp_timeout_ms);
        let outcome = backend(self.backend.reboot_vm(auth, ip, timeout).await)?;
        Ok(proto::RebootVmResponse {
            dhcp_timed_out: outcome.dhcp_timed_out,
        })
    }

    pub async fn change_vm_owner_users(
        &self,
        auth: &AuthInformation,
        request: proto::ChangeVmOwnerUsersRequest,
    ) -> Handled<proto::Empty> {
        let ip = require_ip("ip_address", &request.ip_address).map_err(invalid)?;
        backend(self.backend.change_vm_owner_users(auth, ip, request.owner_users).await)?;
        Ok(proto::Empty {})
    }

    pub async fn change_vm_size(
        &self,
        auth: &AuthInformation,
        request: proto::ChangeVmSizeRequest,
    ) -> Handled<proto::Empty> {
        let request = model::ChangeVmSizeRequest {
            ip_address: require_ip("ip_address", &request.ip_address).map_err(invalid)?,
            memory_in_mib: request.memory_in_mib,
            milli_cpus: request.milli_cpus,
            virtual_cpus: request.virtual_cpus,
        };
        backend(self.backend.change_vm_size(auth, request).await)?;
        Ok(proto::Empty {})
    }

    // Updates

    /// Register a watcher for a `GetUpdates` call.
    pub fn subscribe(&self, auth: &AuthInformation, request: proto::GetUpdatesRequest) -> Subscription {
        let filter = UpdateFilter {
            location: request.location,
            tags: convert::match_tags_from_proto(request.tags_to_match),
            owner: (!request.owner.is_empty()).then_some(request.owner),
        };
        let subscription = self.backend.make_update_channel(filter);
        tracing::info!(
            transport = self.transport,
            username = %auth.username,
            subscription = %subscription.id(),
            "update stream opened"
        );
        subscription
    }
}
