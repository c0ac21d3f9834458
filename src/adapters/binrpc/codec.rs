//! Frame codec.
//!
//! Every message is one frame:
//!
//! ```text
//! ┌────────────────┬───────────────────────────┐
//! │ length: u32 BE │ body: bincode(message)    │
//! └────────────────┴───────────────────────────┘
//! ```
//!
//! Raw payloads (VM images, user data) follow their request frame unframed,
//! with the length announced in the request.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes in the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Write buffer size that triggers an early write-out.
const WRITE_HIGH_WATER: usize = 256 * 1024;

/// Framing failures. Any of these ends the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of decoding a frame from a buffer.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded and consumed.
    Complete(T),
    /// More data is needed.
    Incomplete,
    /// The buffered data can never decode.
    Invalid(FrameError),
}

/// Length-prefixed bincode codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Decode one frame from the front of `buffer`, consuming it on success.
    pub fn decode<T: DeserializeOwned>(&self, buffer: &mut BytesMut) -> DecodeResult<T> {
        if buffer.len() < FRAME_HEADER_LEN {
            return DecodeResult::Incomplete;
        }
        let size = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if size > self.max_frame_bytes {
            return DecodeResult::Invalid(FrameError::TooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        if buffer.len() < FRAME_HEADER_LEN + size {
            buffer.reserve(FRAME_HEADER_LEN + size - buffer.len());
            return DecodeResult::Incomplete;
        }
        buffer.advance(FRAME_HEADER_LEN);
        let body = buffer.split_to(size);
        match bincode::deserialize(&body) {
            Ok(message) => DecodeResult::Complete(message),
            Err(e) => DecodeResult::Invalid(FrameError::Malformed(e.to_string())),
        }
    }

    /// Encode one message as a frame.
    pub fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<Bytes, FrameError> {
        let body = bincode::serialize(message).map_err(|e| FrameError::Encode(e.to_string()))?;
        if body.len() > self.max_frame_bytes || body.len() > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                size: body.len(),
                limit: self.max_frame_bytes,
            });
        }
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }
}

/// Buffered frame reader over the inbound half of a connection.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(8 * 1024),
            codec,
        }
    }

    /// Next message. `None` when the peer closed cleanly between frames.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                DecodeResult::Complete(message) => return Ok(Some(message)),
                DecodeResult::Invalid(e) => return Err(e),
                DecodeResult::Incomplete => {}
            }
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
        }
    }

    /// Read exactly `len` raw payload bytes.
    pub async fn read_payload(&mut self, len: u64, limit: u64) -> Result<Vec<u8>, FrameError> {
        if len > limit {
            return Err(FrameError::TooLarge {
                size: len as usize,
                limit: limit as usize,
            });
        }
        let len = len as usize;
        let mut payload = Vec::with_capacity(len);
        let buffered = self.buffer.len().min(len);
        payload.extend_from_slice(&self.buffer.split_to(buffered));
        while payload.len() < len {
            let mut chunk = vec![0u8; (len - payload.len()).min(64 * 1024)];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Truncated);
            }
            payload.extend_from_slice(&chunk[..n]);
        }
        Ok(payload)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Frame writer with an explicit flush.
///
/// Frames accumulate in memory until [`FrameWriter::flush`], except that
/// a large backlog is written out early.
pub struct FrameWriter<W> {
    inner: W,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: FrameCodec) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(16 * 1024),
            codec,
        }
    }

    /// Queue one frame.
    pub async fn write<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), FrameError> {
        let frame = self.codec.encode(message)?;
        self.buffer.extend_from_slice(&frame);
        if self.buffer.len() >= WRITE_HIGH_WATER {
            self.inner.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Queue raw payload bytes.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write everything queued and flush the transport.
    pub async fn flush(&mut self) -> Result<(), FrameError> {
        if !self.buffer.is_empty() {
            self.inner.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn test_decode_incomplete_then_complete() {
        let codec = FrameCodec::new(1024);
        let frame = codec
            .encode(&Ping {
                seq: 7,
                note: "hi".into(),
            })
            .unwrap();

        let mut buffer = BytesMut::from(&frame[..3]);
        assert!(matches!(codec.decode::<Ping>(&mut buffer), DecodeResult::Incomplete));
        buffer.extend_from_slice(&frame[3..frame.len() - 1]);
        assert!(matches!(codec.decode::<Ping>(&mut buffer), DecodeResult::Incomplete));
        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        match codec.decode::<Ping>(&mut buffer) {
            DecodeResult::Complete(ping) => assert_eq!(ping.seq, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = FrameCodec::new(8);
        let mut buffer = BytesMut::new();
        buffer.put_u32(9);
        assert!(matches!(
            codec.decode::<Ping>(&mut buffer),
            DecodeResult::Invalid(FrameError::TooLarge { size: 9, limit: 8 })
        ));
        assert!(codec.encode(&"a string longer than eight").is_err());
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let codec = FrameCodec::new(1024);
        let mut writer = FrameWriter::new(client, codec);
        let mut reader = FrameReader::new(server, codec);

        writer
            .write(&Ping {
                seq: 1,
                note: "a".into(),
            })
            .await
            .unwrap();
        writer.write_raw(b"payload");
        assert!(writer.pending() > 0);
        writer.flush().await.unwrap();

        let ping: Ping = reader.read().await.unwrap().unwrap();
        assert_eq!(ping.note, "a");
        assert_eq!(reader.read_payload(7, 100).await.unwrap(), b"payload");

        writer.shutdown().await.unwrap();
        assert!(reader.read::<Ping>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, FrameCodec::new(1024));
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);
        assert!(matches!(reader.read::<Ping>().await, Err(FrameError::Truncated)));
    }
}
