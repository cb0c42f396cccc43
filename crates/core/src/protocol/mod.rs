//! # Protocol Layer
//!
//! Everything both peers must agree on byte for byte.
//!
//! ## Layers
//!
//! - **Framing**: 4-byte big-endian length prefix, then the payload
//! - **Envelope**: JSON object carrying a correlation id and exactly one of
//!   `control`, `request`, `response` or `event`
//! - **Handshake vocabulary**: protocol version, schema fingerprint, features
//!
//! ## Message Flow
//!
//! ```text
//! Client → Host:  control.hello
//! Host → Client:  control.welcome | control.reject
//! Client → Host:  request   (correlation_id = n)
//! Host → Client:  response  (correlation_id = n)
//! Host → Client:  event     (uncorrelated, any time after welcome)
//! ```

pub mod codec;
pub mod envelope;
pub mod features;
pub mod fingerprint;
pub mod framing;
pub mod version;

pub use codec::EnvelopeCodec;
pub use envelope::{
    AssetRequest, AssetResult, BuildReport, BuildRequest, ControlMessage, CorrelationId,
    Envelope, ErrorStatus, Event, EventKind, HealthStatus, Hello, LogEvent, Metadata,
    OperationEvent, OperationStage, Payload, RawEnvelope, Reject, RejectCode, Request, Response,
    StatusCode, Welcome,
};
pub use features::{Feature, FeatureSet};
pub use fingerprint::schema_fingerprint;
pub use framing::{
    DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FrameCodec, decode_frame, encode_frame,
};
pub use version::ProtocolVersion;

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);
