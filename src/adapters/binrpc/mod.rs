//! Binary RPC adapter.
//!
//! Legacy transport: length-prefixed bincode frames over mutually
//! authenticated TLS, with an explicit flush after every reply. Identity is
//! extracted once per connection; a connection without a usable client
//! certificate stays open but every call on it is answered with an
//! `Unauthenticated` fault.
//!
//! ```text
//!  client                         server
//!    │── CallHeader{Fleet.X} ──────►│  resolve, authenticate, authorize
//!    │◄───────────── CallAck ───────│  (fault here ends the call)
//!    │── request [+ payloads] ─────►│
//!    │◄──────── Reply{error,body} ──│  one or more frames, then flush
//! ```
//!
//! `GetUpdates` takes over the connection: once it ends the connection is
//! closed.

pub mod client;
pub mod codec;
mod handlers;
pub mod messages;

use crate::adapters::{authorize, stream_error_status, AdapterConfig, FleetMethod};
use crate::backend::FleetBackend;
use crate::core::error::FleetResult;
use crate::core::status::{classify, Classification, StatusCode};
use crate::hub::stream::{stream_updates, ControlEvent, SinkError, UpdateSink};
use crate::model::ChangeEvent;
use crate::net::identity::{AuthInformation, IdentityExtractor};
use crate::net::session::{AuthenticatedStream, ConnectionId, Incoming};
use async_trait::async_trait;
use codec::{FrameCodec, FrameError, FrameReader, FrameWriter};
use messages::{CallAck, CallHeader, GetUpdatesRequest, HealthRequest, Reply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

pub use client::{BinrpcClient, ClientError, UpdateStream};

const TRANSPORT: &str = "binrpc";

/// Adapter counters.
#[derive(Debug, Default)]
pub struct BinrpcStats {
    pub connections: AtomicU64,
    pub calls: AtomicU64,
    pub faults: AtomicU64,
}

impl BinrpcStats {
    fn record(&self, failed: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Whether a connection can take further calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection state.
struct Connection {
    id: ConnectionId,
    identity: FleetResult<AuthInformation>,
    reader: FrameReader<ReadHalf<AuthenticatedStream>>,
    writer: FrameWriter<WriteHalf<AuthenticatedStream>>,
}

impl Connection {
    /// Read the request frame that follows an ack.
    async fn request<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        self.reader.read().await?.ok_or(FrameError::Truncated)
    }

    /// Write a reply and flush it.
    async fn reply<T: Serialize>(&mut self, reply: &T) -> Result<(), FrameError> {
        self.writer.write(reply).await?;
        self.writer.flush().await
    }

    async fn ack(&mut self, result: Result<(), Classification>) -> Result<(), FrameError> {
        let ack = CallAck {
            error: result.err().map(Into::into),
        };
        self.reply(&ack).await
    }
}

/// Binary RPC server.
pub struct BinrpcServer {
    backend: Arc<dyn FleetBackend>,
    config: Arc<AdapterConfig>,
    stats: Arc<BinrpcStats>,
}

impl BinrpcServer {
    pub fn new(backend: Arc<dyn FleetBackend>, config: Arc<AdapterConfig>) -> Self {
        Self {
            backend,
            config,
            stats: Arc::new(BinrpcStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BinrpcStats> {
        self.stats.clone()
    }

    /// Serve connections until the listener shuts down.
    pub async fn serve(self: Arc<Self>, mut incoming: Incoming, shutdown: watch::Receiver<bool>) {
        while let Some(stream) = incoming.next().await {
            let server = self.clone();
            tokio::spawn(server.handle_connection(stream, shutdown.clone()));
        }
        tracing::debug!("binrpc accept stream closed");
    }

    /// Handle one connection until the peer leaves, a protocol error
    /// occurs, or shutdown is signalled.
    pub async fn handle_connection(self: Arc<Self>, stream: AuthenticatedStream, shutdown: watch::Receiver<bool>) {
        let id = stream.id;
        let remote = stream.session().remote_addr();
        let identity = IdentityExtractor::extract(Some(stream.session()));
        match &identity {
            Ok(auth) => tracing::debug!(%id, %remote, username = %auth.username, "binrpc connection opened"),
            Err(e) => tracing::warn!(%id, %remote, error = %e, "binrpc connection without identity"),
        }
        self.stats.connections.fetch_add(1, Ordering::Relaxed);

        let codec = FrameCodec::new(self.config.max_frame_bytes);
        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Connection {
            id,
            identity,
            reader: FrameReader::new(read_half, codec),
            writer: FrameWriter::new(write_half, codec),
        };
        match self.serve_calls(conn, shutdown).await {
            Ok(()) => tracing::debug!(%id, "binrpc connection closed"),
            Err(e) => tracing::debug!(%id, error = %e, "binrpc connection ended with protocol error"),
        }
    }

    async fn serve_calls(&self, mut conn: Connection, mut shutdown: watch::Receiver<bool>) -> Result<(), FrameError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let header = tokio::select! {
                header = conn.reader.read::<CallHeader>() => match header? {
                    Some(header) => header,
                    None => return Ok(()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
            };

            let Some(method) = FleetMethod::from_qualified(&header.method) else {
                self.stats.record(true);
                conn.ack(Err(Classification::new(
                    StatusCode::Unimplemented,
                    format!("unknown method: {}", header.method),
                )))
                .await?;
                continue;
            };
            let auth = match &conn.identity {
                Ok(auth) => auth.clone(),
                Err(e) => {
                    self.stats.record(true);
                    conn.ack(Err(classify(e))).await?;
                    continue;
                }
            };
            let admitted = authorize(&auth, method).and_then(|access| {
                self.config
                    .limiter
                    .acquire(method, access, &auth.username)
                    .map(|permit| (access, permit))
            });
            let (access, permit) = match admitted {
                Ok(admitted) => admitted,
                Err(e) => {
                    self.stats.record(true);
                    conn.ack(Err(classify(&e))).await?;
                    continue;
                }
            };
            conn.ack(Ok(())).await?;
            tracing::debug!(id = %conn.id, %method, username = %auth.username, ?access, "binrpc call");

            if method == FleetMethod::GetUpdates {
                let result = self.get_updates(conn, &auth, shutdown).await;
                drop(permit);
                return result;
            }
            let flow = self.dispatch(method, &auth, &mut conn).await?;
            drop(permit);
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn get_updates(
        &self,
        conn: Connection,
        auth: &AuthInformation,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), FrameError> {
        let Connection {
            id,
            mut reader,
            writer,
            ..
        } = conn;
        let Some(request) = reader.read::<GetUpdatesRequest>().await? else {
            return Ok(());
        };
        let subscription = self.backend.make_update_channel(request.filter());
        tracing::info!(
            %id,
            username = %auth.username,
            subscription = %subscription.id(),
            location = %request.location,
            max_updates = request.max_updates,
            "update stream opened"
        );

        let (control_tx, control_rx) = mpsc::channel(4);
        let reader_task = tokio::spawn(async move {
            loop {
                let event = match reader.read::<HealthRequest>().await {
                    Ok(Some(_)) => ControlEvent::Request,
                    Ok(None) => ControlEvent::Disconnected,
                    Err(e) => ControlEvent::Failed(e.to_string()),
                };
                let done = event != ControlEvent::Request;
                if control_tx.send(event).await.is_err() || done {
                    break;
                }
            }
        });

        let mut sink = BinrpcSink { writer };
        let options = self.config.stream.clone().with_max_updates(request.max_updates);
        let backend = self.backend.clone();
        let result = stream_updates(
            subscription,
            &mut sink,
            Some(control_rx),
            shutdown,
            &options,
            move || backend.health_status(),
        )
        .await;
        reader_task.abort();

        match result {
            Ok(end) => {
                tracing::info!(%id, ?end, "update stream closed");
                sink.writer.flush().await
            }
            Err(e) => {
                let status = stream_error_status(&e);
                tracing::warn!(%id, code = %status.code, error = %e, "update stream failed");
                // Best effort: the peer may already be gone.
                let _ = sink.writer.write(&Reply::<ChangeEvent>::fault(status)).await;
                let _ = sink.writer.flush().await;
                Ok(())
            }
        }
    }
}

/// Writes update frames without flushing; the pump decides when to flush.
struct BinrpcSink<W> {
    writer: FrameWriter<W>,
}

fn sink_error(error: FrameError) -> SinkError {
    match error {
        FrameError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
            ) =>
        {
            SinkError::Disconnected
        }
        other => SinkError::Failed(other.to_string()),
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> UpdateSink for BinrpcSink<W> {
    async fn send(&mut self, event: &ChangeEvent) -> Result<(), SinkError> {
        let reply = Reply { error: None, body: event };
        self.writer.write(&reply).await.map_err(sink_error)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await.map_err(sink_error)
    }
}
