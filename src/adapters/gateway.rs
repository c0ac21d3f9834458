//! HTTP/JSON gateway.
//!
//! Fronts the protobuf handlers for clients that cannot speak HTTP/2:
//! `POST /v1/<Method>` takes the request message as JSON and answers with
//! the response message as JSON. Failures carry the HTTP mapping of the
//! status code and a `{"code", "message"}` body. Server streaming is not
//! offered here; `GetUpdates` answers `501`.

use super::grpc::FleetGrpcService;
use super::{authorize, FleetMethod};
use crate::core::status::{classify, Classification, StatusCode};
use crate::net::identity::{AuthInformation, IdentityExtractor};
use crate::net::session::{AuthenticatedStream, Incoming, TlsSession};
use axum::extract::connect_info::{ConnectInfo, Connected};
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::serve::IncomingStream;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

const TRANSPORT: &str = "gateway";

/// A classified failure rendered as an HTTP response.
#[derive(Debug)]
pub struct GatewayError(pub Classification);

impl From<Classification> for GatewayError {
    fn from(c: Classification) -> Self {
        Self(c)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let Classification { code, message } = self.0;
        let body = json!({
            "code": code.name(),
            "message": message,
        });
        (code.http_status(), Json(body)).into_response()
    }
}

/// Accepted connections as an axum listener. Each connection's TLS session
/// is its address, so handlers see it through [`ConnectInfo`].
pub struct GatewayListener {
    incoming: Incoming,
}

impl GatewayListener {
    pub fn new(incoming: Incoming) -> Self {
        Self { incoming }
    }
}

impl axum::serve::Listener for GatewayListener {
    type Io = AuthenticatedStream;
    type Addr = TlsSession;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.next().await {
            Some(stream) => {
                let session = stream.session().clone();
                (stream, session)
            }
            // Listener closed; graceful shutdown ends the serve loop.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(TlsSession::new(self.incoming.local_addr(), None))
    }
}

impl Connected<IncomingStream<'_, GatewayListener>> for TlsSession {
    fn connect_info(stream: IncomingStream<'_, GatewayListener>) -> Self {
        stream.remote_addr().clone()
    }
}

/// Gateway state shared by every request.
#[derive(Clone)]
pub struct Gateway {
    service: FleetGrpcService,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn new(service: FleetGrpcService) -> Self {
        let max_body_bytes = service.config().max_frame_bytes;
        Self {
            service: service.with_transport(TRANSPORT),
            max_body_bytes,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/v1/{method}", post(invoke))
            .with_state(Arc::new(self))
    }

    /// Serve authenticated connections until shutdown is signalled.
    pub async fn serve(self, incoming: Incoming, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let addr: SocketAddr = incoming.local_addr();
        tracing::info!(%addr, "starting HTTP gateway");
        let app = self.router().into_make_service_with_connect_info::<TlsSession>();
        axum::serve(GatewayListener::new(incoming), app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("HTTP gateway shutting down");
            })
            .await
    }

    async fn dispatch(&self, method: FleetMethod, auth: &AuthInformation, body: &[u8]) -> Result<Response, GatewayError> {
        let service = &self.service;
        match method {
            FleetMethod::ChangeMachineTags => json_call(body, |r| service.change_machine_tags(auth, r)).await,
            FleetMethod::PowerOnMachine => json_call(body, |r| service.power_on_machine(auth, r)).await,
            FleetMethod::GetMachineInfo => json_call(body, |r| service.get_machine_info(auth, r)).await,
            FleetMethod::MoveIpAddresses => json_call(body, |r| service.move_ip_addresses(auth, r)).await,
            FleetMethod::GetCapacity => json_call(body, |r| service.get_capacity(auth, r)).await,
            FleetMethod::GetHypervisorForVm => json_call(body, |r| service.get_hypervisor_for_vm(auth, r)).await,
            FleetMethod::GetIpInfo => json_call(body, |r| service.get_ip_info(auth, r)).await,
            FleetMethod::ListHypervisorLocations => {
                json_call(body, |r| service.list_hypervisor_locations(auth, r)).await
            }
            FleetMethod::ListHypervisorsInLocation => {
                json_call(body, |r| service.list_hypervisors_in_location(auth, r)).await
            }
            FleetMethod::ListVmsInLocation => json_call(body, |r| service.list_vms_in_location(auth, r)).await,
            FleetMethod::ListSubnets => json_call(body, |r| service.list_subnets(auth, r)).await,
            FleetMethod::GetHypervisorsInLocation => {
                json_call(body, |r| service.get_hypervisors_in_location(auth, r)).await
            }
            FleetMethod::ListVms => json_call(body, |r| service.list_vms(auth, r)).await,
            FleetMethod::GetVmInfos => json_call(body, |r| service.get_vm_infos(auth, r)).await,
            FleetMethod::CreateVm => json_call(body, |r| service.create_vm(auth, r)).await,
            FleetMethod::CreateVmAsync => json_call(body, |r| service.create_vm_async(auth, r)).await,
            FleetMethod::DestroyVm => json_call(body, |r| service.destroy_vm(auth, r)).await,
            FleetMethod::DestroyVmAsync => json_call(body, |r| service.destroy_vm_async(auth, r)).await,
            FleetMethod::StartVm => json_call(body, |r| service.start_vm(auth, r)).await,
            FleetMethod::StartVmAsync => json_call(body, |r| service.start_vm_async(auth, r)).await,
            FleetMethod::StopVm => json_call(body, |r| service.stop_vm(auth, r)).await,
            FleetMethod::GetVmInfo => json_call(body, |r| service.get_vm_info(auth, r)).await,
            FleetMethod::ChangeVmTags => json_call(body, |r| service.change_vm_tags(auth, r)).await,
            FleetMethod::RebootVm => json_call(body, |r| service.reboot_vm(auth, r)).await,
            FleetMethod::ChangeVmOwnerUsers => json_call(body, |r| service.change_vm_owner_users(auth, r)).await,
            FleetMethod::ChangeVmSize => json_call(body, |r| service.change_vm_size(auth, r)).await,
            FleetMethod::GetUpdates => Err(Classification::new(
                StatusCode::Unimplemented,
                "GetUpdates is not available over the HTTP gateway",
            )
            .into()),
        }
    }
}

async fn json_call<Req, Resp, F, Fut>(body: &[u8], handler: F) -> Result<Response, GatewayError>
where
    Req: DeserializeOwned + Default,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, Classification>>,
{
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        Req::default()
    } else {
        serde_json::from_slice(body).map_err(|e| {
            Classification::new(StatusCode::InvalidArgument, format!("invalid JSON request: {}", e))
        })?
    };
    let response = handler(request).await?;
    Ok(Json(response).into_response())
}

async fn invoke(State(gateway): State<Arc<Gateway>>, Path(name): Path<String>, request: Request) -> Response {
    match handle(&gateway, &name, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(method = %name, code = %e.0.code, error = %e.0.message, "gateway call failed");
            e.into_response()
        }
    }
}

async fn handle(gateway: &Gateway, name: &str, request: Request) -> Result<Response, GatewayError> {
    let method = FleetMethod::from_name(name)
        .ok_or_else(|| Classification::new(StatusCode::Unimplemented, format!("unknown method: {}", name)))?;
    let session = request
        .extensions()
        .get::<ConnectInfo<TlsSession>>()
        .map(|ConnectInfo(session)| session.clone());
    let auth = IdentityExtractor::extract(session.as_ref()).map_err(|e| classify(&e))?;
    let access = authorize(&auth, method).map_err(|e| classify(&e))?;
    let _permit = gateway
        .service
        .config()
        .limiter
        .acquire(method, access, &auth.username)
        .map_err(|e| classify(&e))?;
    tracing::debug!(%method, username = %auth.username, ?access, "gateway call");

    let body = axum::body::to_bytes(request.into_body(), gateway.max_body_bytes)
        .await
        .map_err(|e| Classification::new(StatusCode::InvalidArgument, format!("unreadable request body: {}", e)))?;
    gateway.dispatch(method, &auth, &body).await
}

/// JSON shape of a gateway error body.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
