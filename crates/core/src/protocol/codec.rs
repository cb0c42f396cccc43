//! Envelope codec
//!
//! Envelopes are serialized as JSON. The codec is stateless and synchronous;
//! framing is handled separately by [`super::FrameCodec`].

use super::envelope::{CorrelationId, Envelope, RawEnvelope};
use crate::error::ProtocolError;
use bytes::Bytes;

/// JSON envelope codec
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let json_data = serde_json::to_vec(envelope).map_err(|e| ProtocolError::Encode {
            reason: e.to_string(),
        })?;
        Ok(Bytes::from(json_data))
    }

    /// Check a raw envelope before it reaches the wire
    pub fn encode_raw(&self, raw: RawEnvelope) -> Result<Bytes, ProtocolError> {
        self.encode(&raw.conform()?)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode {
            reason: e.to_string(),
        })
    }

    /// Correlation id of a frame that failed [`decode`](Self::decode), when the
    /// frame is still a JSON object carrying a non-empty one
    pub fn recover_correlation_id(&self, bytes: &[u8]) -> Option<CorrelationId> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        match value.get("correlation_id")? {
            serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
            _ => None,
        }
    }
}
