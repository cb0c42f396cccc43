//! Envelope and message definitions
//!
//! The envelope is the outermost wire unit. It carries a correlation id and
//! exactly one payload: a control message (handshake), a request, a response
//! or a pushed event. In Rust that is the [`Payload`] enum; on the wire it is
//! a JSON object with one of the `control` / `request` / `response` / `event`
//! keys, and [`RawEnvelope::conform`] enforces that exactly one is present.

use crate::error::ProtocolError;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque correlation identifier
pub type CorrelationId = String;

/// Free-form string metadata carried by handshake messages
pub type Metadata = BTreeMap<String, String>;

/// The outermost wire unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    /// Empty for control and event messages
    pub correlation_id: CorrelationId,
    pub payload: Payload,
}

/// Exactly one payload per envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Control(ControlMessage),
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Control(control) => control.name(),
            Payload::Request(_) => "request",
            Payload::Response(_) => "response",
            Payload::Event(_) => "event",
        }
    }
}

impl Envelope {
    pub fn control(message: ControlMessage) -> Self {
        Self {
            correlation_id: String::new(),
            payload: Payload::Control(message),
        }
    }

    pub fn request(correlation_id: impl Into<CorrelationId>, request: Request) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: Payload::Request(request),
        }
    }

    pub fn response(correlation_id: impl Into<CorrelationId>, response: Response) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: Payload::Response(response),
        }
    }

    pub fn event(event: Event) -> Self {
        Self {
            correlation_id: String::new(),
            payload: Payload::Event(event),
        }
    }
}

/// Wire shape of an envelope, before the one-payload rule is checked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
}

impl RawEnvelope {
    /// Check the envelope rules and produce a typed envelope
    pub fn conform(self) -> Result<Envelope, ProtocolError> {
        let set = [
            self.control.is_some(),
            self.request.is_some(),
            self.response.is_some(),
            self.event.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        if set != 1 {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("expected exactly one payload variant, found {}", set),
            });
        }

        let payload = if let Some(control) = self.control {
            Payload::Control(control)
        } else if let Some(request) = self.request {
            Payload::Request(request)
        } else if let Some(response) = self.response {
            Payload::Response(response)
        } else if let Some(event) = self.event {
            Payload::Event(event)
        } else {
            unreachable!("payload count checked above")
        };

        let correlated = matches!(payload, Payload::Request(_) | Payload::Response(_));
        if correlated && self.correlation_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("{} without a correlation id", payload.name()),
            });
        }
        if !correlated && !self.correlation_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("{} must not carry a correlation id", payload.name()),
            });
        }

        Ok(Envelope {
            correlation_id: self.correlation_id,
            payload,
        })
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        raw.conform()
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let mut raw = RawEnvelope {
            correlation_id: envelope.correlation_id,
            ..Default::default()
        };
        match envelope.payload {
            Payload::Control(control) => raw.control = Some(control),
            Payload::Request(request) => raw.request = Some(request),
            Payload::Response(response) => raw.response = Some(response),
            Payload::Event(event) => raw.event = Some(event),
        }
        raw
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Handshake traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    Hello(Hello),
    Welcome(Welcome),
    Reject(Reject),
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Hello(_) => "hello",
            ControlMessage::Welcome(_) => "welcome",
            ControlMessage::Reject(_) => "reject",
        }
    }
}

/// First message of every connection, client to host
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
    pub protocol_version: String,
    #[serde(default)]
    pub features: Vec<String>,
    pub schema_fingerprint: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl std::fmt::Debug for Hello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hello")
            .field("token", &"<redacted>")
            .field("protocol_version", &self.protocol_version)
            .field("features", &self.features)
            .field("schema_fingerprint", &self.schema_fingerprint)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Successful handshake answer, host to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub protocol_version: String,
    #[serde(default)]
    pub features: Vec<String>,
    pub schema_fingerprint: String,
    pub host_name: String,
    pub host_version: String,
    pub platform: String,
    pub runtime_version: String,
    pub session_id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Failed handshake answer, host to client. The connection closes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub code: RejectCode,
    pub message: String,
}

impl Reject {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Closed set of handshake rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    Unauthenticated,
    FailedPrecondition,
    PermissionDenied,
    OutOfRange,
    Internal,
    Unavailable,
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RejectCode::Unauthenticated => "unauthenticated",
            RejectCode::FailedPrecondition => "failed-precondition",
            RejectCode::PermissionDenied => "permission-denied",
            RejectCode::OutOfRange => "out-of-range",
            RejectCode::Internal => "internal",
            RejectCode::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// One-shot call from client to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Readiness check
    Health,
    /// Asset database operations
    Assets(AssetRequest),
    /// Player and bundle builds
    Build(BuildRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Health => "health",
            Request::Assets(_) => "assets",
            Request::Build(_) => "build",
        }
    }
}

/// Asset database operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetRequest {
    /// Rescan the project for changed assets
    Refresh,
    Import { path: String },
    Move { from: String, to: String },
    Delete { path: String },
}

/// Build operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildRequest {
    Player {
        target: String,
        output_path: String,
        #[serde(default)]
        development: bool,
    },
    Bundles {
        target: String,
        output_path: String,
    },
}

/// Answer to exactly one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Health(HealthStatus),
    Assets(AssetResult),
    Build(BuildReport),
    Error(ErrorStatus),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Health(_) => "health",
            Response::Assets(_) => "assets",
            Response::Build(_) => "build",
            Response::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ready: bool,
    pub host_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_reason: Option<String>,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetResult {
    /// Asset paths touched by the operation
    pub affected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub operation_id: String,
    pub target: String,
    pub output_path: String,
    pub success: bool,
    pub duration_ms: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Request-level failure carried in a normal response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: StatusCode,
    /// Variable part of the error: a feature name, a path, a reason
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    FeatureNotNegotiated,
    InvalidArgument,
    NotFound,
    Unavailable,
    Internal,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Host to client push notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the host started, monotonic
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log(LogEvent),
    Operation(OperationEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub target: String,
}

/// Lifecycle of a long-running host operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub operation_id: String,
    pub name: String,
    pub stage: OperationStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    Started,
    Progress { fraction: f32, detail: String },
    Completed,
    Failed { message: String },
}
