//! Length-prefixed framing
//!
//! The wire format is:
//! - 4 bytes: payload length (unsigned, big endian, header not included)
//! - N bytes: payload
//!
//! Framing knows nothing about what the payload means. A configurable maximum
//! frame size guards against a hostile or broken peer announcing a huge frame.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the frame header
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum payload size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame encoder/decoder with a size limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        // The length prefix cannot describe anything larger than u32::MAX
        let max_frame_size = max_frame_size.min(u32::MAX as usize);
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Append one frame carrying `payload` to `dst`
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Encode `payload` as a standalone frame
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `src` is left untouched
    /// in that case. An oversized length prefix is rejected as soon as the
    /// header is visible, before any payload is buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    /// Classify what is left in the buffer once the stream has ended.
    ///
    /// An empty buffer is a clean close; anything else is a truncated frame.
    pub fn finish(&self, remaining: &BytesMut) -> Result<(), ProtocolError> {
        if remaining.is_empty() {
            return Ok(());
        }

        let expected = if remaining.len() >= FRAME_HEADER_LEN {
            FRAME_HEADER_LEN
                + u32::from_be_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize
        } else {
            FRAME_HEADER_LEN
        };

        Err(ProtocolError::TruncatedFrame {
            expected,
            received: remaining.len(),
        })
    }
}

/// Encode a single frame with the default size limit
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(payload)
}

/// Decode a single frame with the default size limit
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    FrameCodec::default().decode(src)
}
