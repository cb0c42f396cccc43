//! Envelope streams over any async byte transport
//!
//! [`MessageReader`] and [`MessageWriter`] combine [`FrameCodec`] and
//! [`EnvelopeCodec`] on top of an `AsyncRead` / `AsyncWrite` half. They are
//! deliberately split: the host keeps the writer inside a single writer task
//! and the reader inside the connection loop, so the two never contend.

use crate::error::{ProtocolError, Result, TetherError, TransportError};
use crate::protocol::{CorrelationId, Envelope, EnvelopeCodec, FrameCodec};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Undecodable frames in a row a reader skips before giving up on the peer
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 3;

/// One complete frame from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(Envelope),
    /// The frame did not decode. The stream is still in sync.
    Malformed {
        /// Recovered from the raw JSON so the sender can still be answered
        correlation_id: Option<CorrelationId>,
        error: ProtocolError,
    },
}

/// Reads framed envelopes from a byte stream
pub struct MessageReader<R> {
    inner: R,
    frames: FrameCodec,
    codec: EnvelopeCodec,
    read_buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_frame_codec(inner, FrameCodec::default())
    }

    pub fn with_frame_codec(inner: R, frames: FrameCodec) -> Self {
        Self {
            inner,
            frames,
            codec: EnvelopeCodec::new(),
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Read one raw frame. `Ok(None)` means the peer closed cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.frames.decode(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = self
                .inner
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| TransportError::ReadFailed {
                    reason: e.to_string(),
                })?;

            if bytes_read == 0 {
                self.frames.finish(&self.read_buffer)?;
                return Ok(None);
            }
        }
    }

    /// Read and decode one envelope. `Ok(None)` means a clean close.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(self.codec.decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// Read one frame without failing on an undecodable payload.
    ///
    /// Framing errors are still returned as errors: after them the stream
    /// cannot be trusted.
    pub async fn read_inbound(&mut self) -> Result<Option<Inbound>> {
        let Some(frame) = self.read_frame().await? else {
            return Ok(None);
        };
        let inbound = match self.codec.decode(&frame) {
            Ok(envelope) => Inbound::Envelope(envelope),
            Err(error) => Inbound::Malformed {
                correlation_id: self.codec.recover_correlation_id(&frame),
                error,
            },
        };
        Ok(Some(inbound))
    }

    /// Like [`read_envelope`](Self::read_envelope) but a clean close is an error
    pub async fn expect_envelope(&mut self) -> Result<Envelope> {
        self.read_envelope()
            .await?
            .ok_or(TetherError::Transport(TransportError::Closed))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes framed envelopes to a byte stream
pub struct MessageWriter<W> {
    inner: W,
    frames: FrameCodec,
    codec: EnvelopeCodec,
    write_buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_frame_codec(inner, FrameCodec::default())
    }

    pub fn with_frame_codec(inner: W, frames: FrameCodec) -> Self {
        Self {
            inner,
            frames,
            codec: EnvelopeCodec::new(),
            write_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Encode, frame and flush one envelope.
    ///
    /// The frame is assembled in memory first so a single `write_all` carries
    /// the header and the payload together.
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let payload = self.codec.encode(envelope)?;
        self.write_frame(&payload).await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.write_buffer.clear();
        self.frames.encode_into(payload, &mut self.write_buffer)?;

        self.inner
            .write_all(&self.write_buffer)
            .await
            .map_err(write_failed)?;
        self.inner.flush().await.map_err(write_failed)?;
        Ok(())
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(write_failed)?;
        Ok(())
    }
}

fn write_failed(e: std::io::Error) -> TetherError {
    TransportError::WriteFailed {
        reason: e.to_string(),
    }
    .into()
}

/// Split a bidirectional stream into an envelope reader and writer
pub fn split<T>(
    stream: T,
    frames: FrameCodec,
) -> (
    MessageReader<tokio::io::ReadHalf<T>>,
    MessageWriter<tokio::io::WriteHalf<T>>,
)
where
    T: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        MessageReader::with_frame_codec(read_half, frames),
        MessageWriter::with_frame_codec(write_half, frames),
    )
}

/// True if `error` came from a malformed peer rather than a broken transport
pub fn is_peer_protocol_violation(error: &TetherError) -> bool {
    matches!(
        error,
        TetherError::Protocol(
            ProtocolError::Decode { .. }
                | ProtocolError::InvalidEnvelope { .. }
                | ProtocolError::FrameTooLarge { .. }
        )
    )
}
