//! Tonic service wrapper for `fleetrpc.v1.Fleet`.
//!
//! Dispatches on the request path without generated server stubs. Unary
//! bodies are buffered until one complete length-prefixed message has
//! arrived; `GetUpdates` answers with a body fed by the update pump.

use super::proto::{self, SERVICE};
use super::service::FleetGrpcService;
use crate::adapters::{authorize, stream_error_status, CallPermit, FleetMethod};
use crate::core::status::{classify, Classification};
use crate::hub::stream::{stream_updates, SinkError, UpdateSink};
use crate::model::ChangeEvent;
use crate::net::identity::{AuthInformation, IdentityExtractor};
use crate::net::session::{Incoming, TlsSession};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body::Frame;
use http_body_util::BodyExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use prost::Message;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tonic::body::BoxBody;
use tonic::Status;

/// gRPC message header: compression flag and big-endian length.
const MESSAGE_HEADER_LEN: usize = 5;

/// Decode one gRPC message from a buffered body.
#[allow(clippy::result_large_err)]
pub fn decode_grpc_message<M: Message + Default>(body: &Bytes) -> Result<M, Status> {
    if body.is_empty() {
        // Clients may send an empty body for an all-default message.
        return Ok(M::default());
    }
    if body.len() < MESSAGE_HEADER_LEN {
        return Err(Status::invalid_argument("gRPC message too short"));
    }
    if body[0] != 0 {
        return Err(Status::unimplemented("compressed messages are not supported"));
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if body.len() < MESSAGE_HEADER_LEN + len {
        return Err(Status::invalid_argument(format!(
            "gRPC message truncated: expected {} bytes, got {}",
            len,
            body.len() - MESSAGE_HEADER_LEN
        )));
    }
    M::decode(&body[MESSAGE_HEADER_LEN..MESSAGE_HEADER_LEN + len])
        .map_err(|e| Status::invalid_argument(format!("decode error: {}", e)))
}

/// Encode one gRPC message with its header.
pub fn encode_grpc_message<M: Message>(msg: &M, buf: &mut BytesMut) {
    let len = msg.encoded_len();
    buf.reserve(MESSAGE_HEADER_LEN + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // Reserved above, so encoding cannot run out of space.
    let _ = msg.encode(buf);
}

/// Bytes escaped in `grpc-message`: controls, non-ASCII and `%`.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Final status of a response, as trailers.
fn status_trailers(status: &Status) -> http::HeaderMap {
    let mut trailers = http::HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from(status.code() as i32));
    if !status.message().is_empty() {
        let encoded = utf8_percent_encode(status.message(), GRPC_MESSAGE_ESCAPES).to_string();
        // Percent-encoded text is visible ASCII, so this only fails on a bug.
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            trailers.insert("grpc-message", value);
        }
    }
    trailers
}

/// Unary body: one data frame, then the status trailers.
struct UnaryBody {
    data: Option<Bytes>,
    trailers_sent: bool,
}

impl http_body::Body for UnaryBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(data) = self.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if !self.trailers_sent {
            self.trailers_sent = true;
            return Poll::Ready(Some(Ok(Frame::trailers(status_trailers(&Status::ok(""))))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers_sent
    }
}

/// Streaming body fed from a channel. The channel closing ends the body.
struct ChannelBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
}

impl http_body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

fn with_grpc_headers(body: BoxBody) -> http::Response<BoxBody> {
    let mut response = http::Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
}

fn grpc_response<M: Message>(msg: &M) -> http::Response<BoxBody> {
    let mut buf = BytesMut::new();
    encode_grpc_message(msg, &mut buf);
    with_grpc_headers(BoxBody::new(UnaryBody {
        data: Some(buf.freeze()),
        trailers_sent: false,
    }))
}

fn grpc_error_response(status: Status) -> http::Response<BoxBody> {
    status.into_http()
}

async fn unary<Req, Resp, F, Fut>(body: &Bytes, handler: F) -> http::Response<BoxBody>
where
    Req: Message + Default,
    Resp: Message,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, Classification>>,
{
    let request = match decode_grpc_message::<Req>(body) {
        Ok(request) => request,
        Err(status) => return grpc_error_response(status),
    };
    match handler(request).await {
        Ok(response) => grpc_response(&response),
        Err(c) => {
            tracing::debug!(code = %c.code, error = %c.message, "grpc call failed");
            grpc_error_response(c.into())
        }
    }
}

/// Sink writing framed updates into a [`ChannelBody`].
struct GrpcSink {
    tx: mpsc::Sender<Frame<Bytes>>,
    buf: BytesMut,
}

#[async_trait]
impl UpdateSink for GrpcSink {
    async fn send(&mut self, event: &ChangeEvent) -> Result<(), SinkError> {
        let update: proto::Update = event.clone().into();
        encode_grpc_message(&update, &mut self.buf);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = self.buf.split().freeze();
        self.tx
            .send(Frame::data(data))
            .await
            .map_err(|_| SinkError::Disconnected)
    }

    async fn closed(&mut self) {
        self.tx.closed().await
    }
}

/// Tonic service for `fleetrpc.v1.Fleet`.
#[derive(Clone)]
pub struct FleetGrpcServer {
    service: FleetGrpcService,
    shutdown: watch::Receiver<bool>,
}

impl FleetGrpcServer {
    pub fn new(service: FleetGrpcService, shutdown: watch::Receiver<bool>) -> Self {
        Self { service, shutdown }
    }

    /// Serve authenticated connections until shutdown is signalled.
    pub async fn serve(self, incoming: Incoming) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown.clone();
        tracing::info!(addr = %incoming.local_addr(), "starting gRPC server");
        tonic::transport::Server::builder()
            .add_service(self)
            .serve_with_incoming_shutdown(incoming.into_stream(), async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("gRPC server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("gRPC server error: {}", e))
    }

    /// Start a `GetUpdates` stream. The pump runs in its own task and ends
    /// the body with the final status in trailers. `permit` is released when
    /// the pump ends.
    fn get_updates(&self, auth: &AuthInformation, body: &Bytes, permit: Option<CallPermit>) -> http::Response<BoxBody> {
        let request = match decode_grpc_message::<proto::GetUpdatesRequest>(body) {
            Ok(request) => request,
            Err(status) => return grpc_error_response(status),
        };
        let subscription = self.service.subscribe(auth, request);
        let (tx, rx) = mpsc::channel(4);
        let backend = self.service.backend().clone();
        let options = self.service.config().stream.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut sink = GrpcSink {
                tx,
                buf: BytesMut::new(),
            };
            let result = stream_updates(subscription, &mut sink, None, shutdown, &options, move || {
                backend.health_status()
            })
            .await;
            let status = match result {
                Ok(end) => {
                    tracing::info!(?end, "update stream closed");
                    Status::ok("")
                }
                Err(e) => {
                    let c = stream_error_status(&e);
                    tracing::warn!(code = %c.code, error = %e, "update stream failed");
                    c.into()
                }
            };
            drop(permit);
            let _ = sink.tx.send(Frame::trailers(status_trailers(&status))).await;
        });
        with_grpc_headers(BoxBody::new(ChannelBody { rx }))
    }

    async fn handle(
        &self,
        method: FleetMethod,
        auth: AuthInformation,
        body: Bytes,
        permit: Option<CallPermit>,
    ) -> http::Response<BoxBody> {
        let service = &self.service;
        let auth = &auth;
        match method {
            FleetMethod::ChangeMachineTags => unary(&body, |r| service.change_machine_tags(auth, r)).await,
            FleetMethod::PowerOnMachine => unary(&body, |r| service.power_on_machine(auth, r)).await,
            FleetMethod::GetMachineInfo => unary(&body, |r| service.get_machine_info(auth, r)).await,
            FleetMethod::MoveIpAddresses => unary(&body, |r| service.move_ip_addresses(auth, r)).await,
            FleetMethod::GetCapacity => unary(&body, |r| service.get_capacity(auth, r)).await,
            FleetMethod::GetHypervisorForVm => unary(&body, |r| service.get_hypervisor_for_vm(auth, r)).await,
            FleetMethod::GetIpInfo => unary(&body, |r| service.get_ip_info(auth, r)).await,
            FleetMethod::ListHypervisorLocations => {
                unary(&body, |r| service.list_hypervisor_locations(auth, r)).await
            }
            FleetMethod::ListHypervisorsInLocation => {
                unary(&body, |r| service.list_hypervisors_in_location(auth, r)).await
            }
            FleetMethod::ListVmsInLocation => unary(&body, |r| service.list_vms_in_location(auth, r)).await,
            FleetMethod::ListSubnets => unary(&body, |r| service.list_subnets(auth, r)).await,
            FleetMethod::GetHypervisorsInLocation => {
                unary(&body, |r| service.get_hypervisors_in_location(auth, r)).await
            }
            FleetMethod::ListVms => unary(&body, |r| service.list_vms(auth, r)).await,
            FleetMethod::GetVmInfos => unary(&body, |r| service.get_vm_infos(auth, r)).await,
            FleetMethod::CreateVm => unary(&body, |r| service.create_vm(auth, r)).await,
            FleetMethod::CreateVmAsync => unary(&body, |r| service.create_vm_async(auth, r)).await,
            FleetMethod::DestroyVm => unary(&body, |r| service.destroy_vm(auth, r)).await,
            FleetMethod::DestroyVmAsync => unary(&body, |r| service.destroy_vm_async(auth, r)).await,
            FleetMethod::StartVm => unary(&body, |r| service.start_vm(auth, r)).await,
            FleetMethod::StartVmAsync => unary(&body, |r| service.start_vm_async(auth, r)).await,
            FleetMethod::StopVm => unary(&body, |r| service.stop_vm(auth, r)).await,
            FleetMethod::GetVmInfo => unary(&body, |r| service.get_vm_info(auth, r)).await,
            FleetMethod::ChangeVmTags => unary(&body, |r| service.change_vm_tags(auth, r)).await,
            FleetMethod::RebootVm => unary(&body, |r| service.reboot_vm(auth, r)).await,
            FleetMethod::ChangeVmOwnerUsers => unary(&body, |r| service.change_vm_owner_users(auth, r)).await,
            FleetMethod::ChangeVmSize => unary(&body, |r| service.change_vm_size(auth, r)).await,
            FleetMethod::GetUpdates => self.get_updates(auth, &body, permit),
        }
    }
}

impl tonic::server::NamedService for FleetGrpcServer {
    const NAME: &'static str = SERVICE;
}

impl<B> tonic::codegen::Service<http::Request<B>> for FleetGrpcServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let server = self.clone();
        let path = req.uri().path().to_string();
        let session = req.extensions().get::<TlsSession>().cloned();

        Box::pin(async move {
            let method = path
                .strip_prefix('/')
                .and_then(|p| p.strip_prefix(SERVICE))
                .and_then(|p| p.strip_prefix('/'))
                .and_then(FleetMethod::from_name);
            let Some(method) = method else {
                return Ok(grpc_error_response(Status::unimplemented(format!(
                    "unknown method: {}",
                    path
                ))));
            };
            let auth = match IdentityExtractor::extract(session.as_ref()) {
                Ok(auth) => auth,
                Err(e) => return Ok(grpc_error_response(classify(&e).into())),
            };
            let access = match authorize(&auth, method) {
                Ok(access) => access,
                Err(e) => return Ok(grpc_error_response(classify(&e).into())),
            };
            let permit = match server.service.config().limiter.acquire(method, access, &auth.username) {
                Ok(permit) => permit,
                Err(e) => return Ok(grpc_error_response(classify(&e).into())),
            };
            tracing::debug!(%method, username = %auth.username, ?access, "grpc call");

            let max_message = server.service.config().max_frame_bytes;
            let mut data = BytesMut::new();
            let mut body = std::pin::pin!(req.into_body());
            loop {
                match body.as_mut().frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(chunk) = frame.into_data() {
                            let chunk: Bytes = chunk.into();
                            data.extend_from_slice(&chunk);
                            if data.len() >= MESSAGE_HEADER_LEN {
                                let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
                                if len > max_message {
                                    tracing::debug!(%method, len, max_message, "request message too large");
                                    return Ok(grpc_error_response(Status::resource_exhausted(format!(
                                        "request message of {} bytes exceeds limit of {}",
                                        len, max_message
                                    ))));
                                }
                                if data.len() >= MESSAGE_HEADER_LEN + len {
                                    break;
                                }
                            }
                        } else {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let e: tonic::codegen::StdError = e.into();
                        tracing::debug!(%method, error = %e, "failed to read request body");
                        return Ok(grpc_error_response(Status::internal("failed to read request body")));
                    }
                    None => break,
                }
            }
            Ok(server.handle(method, auth, data.freeze(), permit).await)
        })
    }
}
