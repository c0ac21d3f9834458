//! Per-method handlers.
//!
//! Each handler reads its request frame, makes one backend call and writes
//! the reply. Backend failures become inline faults; only framing errors
//! escape as `Err`.

use super::codec::FrameError;
use super::messages::{
    ChangeVmOwnerUsersRequest, ChangeVmTagsRequest, CreateVmReply, GetCapacityRequest, HypervisorAddress,
    PowerOnMachineRequest, RebootVmRequest, Reply, StartVmRequest, VmAddressRequest, VmChunk,
};
use super::{BinrpcServer, Connection, Flow, TRANSPORT};
use crate::adapters::{audit_destroy_outcome, audit_destroy_start, reject_streamed_payload, FleetMethod};
use crate::core::status::{classify_anyhow, Classification, StatusCode};
use crate::model::*;
use crate::net::identity::AuthInformation;

fn classified<T>(result: anyhow::Result<T>) -> Result<T, Classification> {
    result.map_err(|e| classify_anyhow(&e))
}

impl BinrpcServer {
    pub(super) async fn dispatch(
        &self,
        method: FleetMethod,
        auth: &AuthInformation,
        conn: &mut Connection,
    ) -> Result<Flow, FrameError> {
        let backend = &self.backend;
        let failed = match method {
            FleetMethod::ChangeMachineTags => {
                let request: ChangeMachineTagsRequest = conn.request().await?;
                let result = classified(backend.change_machine_tags(auth, request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::PowerOnMachine => {
                let request: PowerOnMachineRequest = conn.request().await?;
                let result = classified(backend.power_on_machine(auth, &request.hostname).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetMachineInfo => {
                let request: GetMachineInfoRequest = conn.request().await?;
                let result = classified(backend.get_machine_info(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::MoveIpAddresses => {
                let request: MoveIpAddressesRequest = conn.request().await?;
                let result = classified(backend.move_ip_addresses(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetCapacity => {
                let request: GetCapacityRequest = conn.request().await?;
                let result = classified(backend.get_capacity(&request.hostname).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetHypervisorForVm => {
                let request: VmAddressRequest = conn.request().await?;
                let result = classified(backend.get_hypervisor_for_vm(request.ip_address).await).map(|host| {
                    HypervisorAddress {
                        address: self.config.hypervisor_address(&host),
                    }
                });
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetIpInfo => {
                let request: VmAddressRequest = conn.request().await?;
                let result = classified(backend.get_ip_info(request.ip_address).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ListHypervisorLocations => {
                let request: ListHypervisorLocationsRequest = conn.request().await?;
                let result = classified(backend.list_hypervisor_locations(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ListHypervisorsInLocation => {
                let request: ListHypervisorsInLocationRequest = conn.request().await?;
                let result = classified(backend.list_hypervisors_in_location(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ListVmsInLocation => self.list_vms_in_location(conn).await?,
            FleetMethod::ListSubnets => {
                let request: ListSubnetsRequest = conn.request().await?;
                let result = classified(backend.list_subnets(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetHypervisorsInLocation => {
                let request: GetHypervisorsInLocationRequest = conn.request().await?;
                let result = classified(backend.get_hypervisors_in_location(request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ListVms => {
                let query: VmQuery = conn.request().await?;
                let result = classified(backend.list_vms(query).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetVmInfos => {
                let query: VmQuery = conn.request().await?;
                let result = classified(backend.get_vm_infos(query).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::CreateVm => return self.create_vm(auth, conn).await,
            FleetMethod::CreateVmAsync => {
                let request: CreateVmRequest = conn.request().await?;
                if let Err(c) = reject_streamed_payload(&request) {
                    // Payload bytes may follow; the stream cannot be resynchronised.
                    self.stats.record(true);
                    self.send(conn, Reply::<VmInfo>::fault(c)).await?;
                    return Ok(Flow::Close);
                }
                let result = classified(backend.create_vm_async(auth, request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::DestroyVm => {
                let request: VmAddressRequest = conn.request().await?;
                let ip = request.ip_address;
                audit_destroy_start(TRANSPORT, method, auth, ip);
                let result = classified(backend.destroy_vm(auth, ip).await);
                audit_destroy_outcome(TRANSPORT, method, auth, ip, result.as_ref().err());
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::DestroyVmAsync => {
                let request: VmAddressRequest = conn.request().await?;
                let ip = request.ip_address;
                audit_destroy_start(TRANSPORT, method, auth, ip);
                let result = classified(backend.destroy_vm_async(auth, ip).await);
                audit_destroy_outcome(TRANSPORT, method, auth, ip, result.as_ref().err());
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::StartVm => {
                let request: StartVmRequest = conn.request().await?;
                let result = classified(
                    backend
                        .start_vm(auth, request.ip_address, request.dhcp_timeout)
                        .await,
                );
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::StartVmAsync => {
                let request: VmAddressRequest = conn.request().await?;
                let result = classified(backend.start_vm_async(auth, request.ip_address).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::StopVm => {
                let request: VmAddressRequest = conn.request().await?;
                let result = classified(backend.stop_vm(auth, request.ip_address).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetVmInfo => {
                let request: VmAddressRequest = conn.request().await?;
                let result = classified(backend.get_vm_info(request.ip_address).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ChangeVmTags => {
                let request: ChangeVmTagsRequest = conn.request().await?;
                let result = classified(
                    backend
                        .change_vm_tags(auth, request.ip_address, request.tags)
                        .await,
                );
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::RebootVm => {
                let request: RebootVmRequest = conn.request().await?;
                let result = classified(
                    backend
                        .reboot_vm(auth, request.ip_address, request.dhcp_timeout)
                        .await,
                );
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ChangeVmOwnerUsers => {
                let request: ChangeVmOwnerUsersRequest = conn.request().await?;
                let result = classified(
                    backend
                        .change_vm_owner_users(auth, request.ip_address, request.owner_users)
                        .await,
                );
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::ChangeVmSize => {
                let request: ChangeVmSizeRequest = conn.request().await?;
                let result = classified(backend.change_vm_size(auth, request).await);
                self.send(conn, Reply::from_result(result)).await?
            }
            FleetMethod::GetUpdates => {
                // Routed before dispatch; reaching here is a server bug.
                let fault = Classification::new(StatusCode::Internal, "GetUpdates dispatched as unary call");
                self.send(conn, Reply::<()>::fault(fault)).await?;
                return Ok(Flow::Close);
            }
        };
        self.stats.record(failed);
        Ok(Flow::Continue)
    }

    /// Write and flush a reply. Returns whether it carried a fault.
    async fn send<T: serde::Serialize>(&self, conn: &mut Connection, reply: Reply<T>) -> Result<bool, FrameError> {
        let failed = reply.error.is_some();
        if let Some(fault) = &reply.error {
            tracing::debug!(id = %conn.id, code = %fault.code, error = %fault.message, "binrpc call failed");
        }
        conn.reply(&reply).await?;
        Ok(failed)
    }

    async fn list_vms_in_location(&self, conn: &mut Connection) -> Result<bool, FrameError> {
        let request: ListVmsInLocationRequest = conn.request().await?;
        let ips = match classified(self.backend.list_vms_in_location(request).await) {
            Ok(ips) => ips,
            Err(c) => return self.send(conn, Reply::<VmChunk>::fault(c)).await,
        };
        for chunk in ips.chunks(self.config.list_chunk_size.max(1)) {
            let reply = Reply::ok(VmChunk {
                ip_addresses: chunk.to_vec(),
            });
            conn.writer.write(&reply).await?;
        }
        conn.writer.write(&Reply::ok(VmChunk::default())).await?;
        conn.writer.flush().await?;
        Ok(false)
    }

    async fn create_vm(&self, auth: &AuthInformation, conn: &mut Connection) -> Result<Flow, FrameError> {
        let mut request: CreateVmRequest = conn.request().await?;
        let limit = self.config.max_payload_bytes;
        if request.secondary_volumes_data {
            let fault = Classification::new(
                StatusCode::Unimplemented,
                "SecondaryVolumesData not supported",
            );
            self.stats.record(true);
            self.send(conn, Reply::<CreateVmReply>::fault(fault)).await?;
            return Ok(Flow::Close);
        }
        if request.image_data_size > limit || request.user_data_size > limit {
            let fault = Classification::new(
                StatusCode::InvalidArgument,
                format!("payload exceeds limit of {} bytes", limit),
            );
            self.stats.record(true);
            self.send(conn, Reply::<CreateVmReply>::fault(fault)).await?;
            return Ok(Flow::Close);
        }
        if request.image_data_size > 0 {
            request.image_data = conn.reader.read_payload(request.image_data_size, limit).await?;
        }
        if request.user_data_size > 0 {
            request.user_data = conn.reader.read_payload(request.user_data_size, limit).await?;
        }

        let result = classified(self.backend.create_vm(auth, request).await).map(|outcome| CreateVmReply {
            ip_address: Some(outcome.ip_address),
            dhcp_timed_out: outcome.dhcp_timed_out,
            vm: outcome.vm,
        });
        let failed = self.send(conn, Reply::from_result(result)).await?;
        self.stats.record(failed);
        Ok(Flow::Continue)
    }
}
