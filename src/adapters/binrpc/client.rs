//! Client side of the binary protocol.
//!
//! Used by the integration tests and by tooling that talks to a running
//! server. The caller supplies an already-established (TLS) stream.

use super::codec::{FrameCodec, FrameError, FrameReader, FrameWriter};
use super::messages::{
    CallAck, CallHeader, CreateVmReply, GetUpdatesRequest, HealthRequest, Reply, VmChunk,
};
use crate::adapters::FleetMethod;
use crate::core::status::StatusCode;
use crate::model::{ChangeEvent, CreateVmRequest, ListVmsInLocationRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Client failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The server answered with a fault.
    #[error("{0}")]
    Fault(#[from] super::messages::Fault),

    #[error("connection closed by server")]
    Closed,
}

impl ClientError {
    /// Status code of a server fault.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Fault(fault) => Some(fault.code),
            _ => None,
        }
    }
}

/// One binrpc connection.
pub struct BinrpcClient<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> BinrpcClient<S> {
    pub fn new(stream: S, max_frame_bytes: usize) -> Self {
        let codec = FrameCodec::new(max_frame_bytes);
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, codec),
            writer: FrameWriter::new(write_half, codec),
        }
    }

    async fn read<T: DeserializeOwned>(&mut self) -> Result<T, ClientError> {
        self.reader.read().await?.ok_or(ClientError::Closed)
    }

    /// Send the call header and wait for the ack.
    async fn begin(&mut self, method: FleetMethod) -> Result<(), ClientError> {
        self.writer
            .write(&CallHeader {
                method: method.to_string(),
            })
            .await?;
        self.writer.flush().await?;
        let ack: CallAck = self.read().await?;
        match ack.error {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    /// Unary call.
    pub async fn call<Req, Resp>(&mut self, method: FleetMethod, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.begin(method).await?;
        self.writer.write(request).await?;
        self.writer.flush().await?;
        let reply: Reply<Resp> = self.read().await?;
        Ok(reply.into_result()?)
    }

    /// Synchronous create, streaming image and user data after the request.
    pub async fn create_vm(
        &mut self,
        request: &CreateVmRequest,
        image: &[u8],
        user_data: &[u8],
    ) -> Result<CreateVmReply, ClientError> {
        let mut request = request.clone();
        request.image_data_size = image.len() as u64;
        request.user_data_size = user_data.len() as u64;
        self.begin(FleetMethod::CreateVm).await?;
        self.writer.write(&request).await?;
        self.writer.write_raw(image);
        self.writer.write_raw(user_data);
        self.writer.flush().await?;
        let reply: Reply<CreateVmReply> = self.read().await?;
        Ok(reply.into_result()?)
    }

    /// Collect every chunk of a VM listing.
    pub async fn list_vms_in_location(
        &mut self,
        request: &ListVmsInLocationRequest,
    ) -> Result<Vec<IpAddr>, ClientError> {
        self.begin(FleetMethod::ListVmsInLocation).await?;
        self.writer.write(request).await?;
        self.writer.flush().await?;
        let mut ips = Vec::new();
        loop {
            let reply: Reply<VmChunk> = self.read().await?;
            let chunk = reply.into_result()?;
            if chunk.ip_addresses.is_empty() {
                return Ok(ips);
            }
            ips.extend(chunk.ip_addresses);
        }
    }

    /// Open an update stream. The connection is consumed.
    pub async fn get_updates(mut self, request: &GetUpdatesRequest) -> Result<UpdateStream<S>, ClientError> {
        self.begin(FleetMethod::GetUpdates).await?;
        self.writer.write(request).await?;
        self.writer.flush().await?;
        Ok(UpdateStream {
            reader: self.reader,
            writer: self.writer,
        })
    }
}

/// Receiving end of `GetUpdates`.
pub struct UpdateStream<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> UpdateStream<S> {
    /// Next event; `None` once the server closed the stream.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>, ClientError> {
        match self.reader.read::<Reply<ChangeEvent>>().await? {
            Some(reply) => Ok(Some(reply.into_result()?)),
            None => Ok(None),
        }
    }

    /// Ask the server for a health reply.
    pub async fn request_health(&mut self) -> Result<(), ClientError> {
        self.writer.write(&HealthRequest).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Close the sending half; the server ends the stream cleanly.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
