//! Unified error handling for the tether ecosystem
//!
//! Every layer reports failures through [`TetherError`]. The nested enums keep
//! the taxonomy of the protocol visible: transport failures are retryable,
//! protocol failures kill the connection they happened on, handshake
//! rejections carry the host's reason code, and request-level failures travel
//! inside a normal response without touching the connection.

use crate::protocol::{ErrorStatus, RejectCode, StatusCode};
use std::time::Duration;
use thiserror::Error;

pub mod retry;

/// Result type alias for all tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

/// Central error type for all tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// Transport-related errors (connect, read, write, close)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Framing and envelope errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Handshake rejections and failures
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Errors reported by the host for a single request
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No answer arrived in time
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Transport-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Peer closed the connection, or the local side tore it down
    #[error("Connection closed")]
    Closed,

    /// Reading from the transport failed
    #[error("Read failed: {reason}")]
    ReadFailed { reason: String },

    /// Writing to the transport failed
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Binding a listener failed
    #[error("Failed to bind {endpoint}: {reason}")]
    BindFailed { endpoint: String, reason: String },
}

/// Framing and envelope errors. All of them are fatal for the connection they occur on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A length prefix announced more bytes than the configured maximum
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// The stream ended in the middle of a frame
    #[error("Stream ended mid-frame after {received} of {expected} bytes")]
    TruncatedFrame { expected: usize, received: usize },

    /// Envelope bytes did not parse
    #[error("Envelope decoding failed: {reason}")]
    Decode { reason: String },

    /// Envelope could not be serialized
    #[error("Envelope encoding failed: {reason}")]
    Encode { reason: String },

    /// Envelope parsed but violates the envelope rules
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// A message arrived that the current connection state does not allow
    #[error("Unexpected {actual} while waiting for {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    /// A connection state transition that the state machine forbids
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The host answered with a `Reject`
    #[error("Handshake rejected ({code}): {message}")]
    Rejected { code: RejectCode, message: String },

    /// The handshake did not complete (non-control reply, stream closed, garbage)
    #[error("Handshake failed: {reason}")]
    Failed { reason: String },
}

/// Errors for a single request. These never take the connection down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The operation needs a feature that was not granted at handshake
    #[error("Feature '{feature}' was not negotiated for this connection")]
    FeatureNotNegotiated { feature: String },

    /// The request failed validation
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The request referred to something that does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// The host cannot serve the request right now
    #[error("Host unavailable: {reason}")]
    HostUnavailable { reason: String },

    /// The handler failed
    #[error("Request failed: {message}")]
    Failed { message: String },

    /// The host answered with a different response kind than the request expects
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Missing required configuration
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    /// Configuration file error
    #[error("Configuration file error: {reason}")]
    FileError { reason: String },
}

/// Error kinds surfaced to callers of the client API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Authentication,
    VersionIncompatible,
    SchemaMismatch,
    HostUnavailable,
    FeatureNotNegotiated,
    RequestFailed,
    Protocol,
    Configuration,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::VersionIncompatible => "version-incompatible",
            ErrorKind::SchemaMismatch => "schema-mismatch",
            ErrorKind::HostUnavailable => "host-unavailable",
            ErrorKind::FeatureNotNegotiated => "feature-not-negotiated",
            ErrorKind::RequestFailed => "request-failed",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

// Convenience constructors for common error cases
impl TetherError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(ProtocolError::InvalidEnvelope {
            reason: message.into(),
        })
    }

    pub fn config<S: Into<String>>(key: S, reason: S) -> Self {
        Self::Config(ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        })
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    pub fn rejected<S: Into<String>>(code: RejectCode, message: S) -> Self {
        Self::Handshake(HandshakeError::Rejected {
            code,
            message: message.into(),
        })
    }

    /// User-facing classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::Transport(_) | TetherError::Io(_) => ErrorKind::Transport,
            TetherError::Timeout { .. } => ErrorKind::Timeout,
            TetherError::Protocol(_) => ErrorKind::Protocol,
            TetherError::Handshake(HandshakeError::Rejected { code, .. }) => match code {
                RejectCode::Unauthenticated | RejectCode::PermissionDenied => {
                    ErrorKind::Authentication
                }
                RejectCode::OutOfRange => ErrorKind::VersionIncompatible,
                RejectCode::FailedPrecondition => ErrorKind::SchemaMismatch,
                RejectCode::Unavailable => ErrorKind::HostUnavailable,
                RejectCode::Internal => ErrorKind::Internal,
            },
            TetherError::Handshake(HandshakeError::Failed { .. }) => ErrorKind::Protocol,
            TetherError::Request(RequestError::FeatureNotNegotiated { .. }) => {
                ErrorKind::FeatureNotNegotiated
            }
            TetherError::Request(RequestError::HostUnavailable { .. }) => {
                ErrorKind::HostUnavailable
            }
            TetherError::Request(_) => ErrorKind::RequestFailed,
            TetherError::Config(_) => ErrorKind::Configuration,
            TetherError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if a fresh connection attempt may succeed where this one failed
    pub fn is_retriable(&self) -> bool {
        match self {
            TetherError::Transport(_) => true,
            TetherError::Io(_) => true,
            TetherError::Timeout { .. } => true,
            TetherError::Protocol(_) => true,
            TetherError::Handshake(HandshakeError::Failed { .. }) => true,
            TetherError::Handshake(HandshakeError::Rejected { code, .. }) => {
                matches!(code, RejectCode::Unavailable)
            }
            _ => false,
        }
    }

    /// Check if this error needs a configuration change before anything can succeed
    pub fn is_permanent(&self) -> bool {
        match self {
            TetherError::Handshake(HandshakeError::Rejected { code, .. }) => matches!(
                code,
                RejectCode::Unauthenticated
                    | RejectCode::PermissionDenied
                    | RejectCode::OutOfRange
                    | RejectCode::FailedPrecondition
            ),
            TetherError::Config(_) => true,
            _ => false,
        }
    }

    /// Check if the connection this error happened on is no longer usable
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TetherError::Transport(_) | TetherError::Protocol(_) | TetherError::Io(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TetherError::Transport(_) => "transport",
            TetherError::Protocol(_) => "protocol",
            TetherError::Handshake(_) => "handshake",
            TetherError::Request(_) => "request",
            TetherError::Config(_) => "config",
            TetherError::Timeout { .. } => "timeout",
            TetherError::Io(_) => "io",
            TetherError::Internal { .. } => "internal",
        }
    }
}

impl ProtocolError {
    /// True for failures confined to one correctly framed message. The
    /// stream is still in sync, so a reader may skip the message.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decode { .. } | ProtocolError::InvalidEnvelope { .. }
        )
    }
}

impl RequestError {
    /// Wire status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RequestError::FeatureNotNegotiated { .. } => StatusCode::FeatureNotNegotiated,
            RequestError::InvalidRequest { .. } => StatusCode::InvalidArgument,
            RequestError::NotFound { .. } => StatusCode::NotFound,
            RequestError::HostUnavailable { .. } => StatusCode::Unavailable,
            RequestError::Failed { .. } | RequestError::UnexpectedResponse { .. } => {
                StatusCode::Internal
            }
        }
    }

    /// The variable part of the error, without the fixed wording
    fn detail(&self) -> String {
        match self {
            RequestError::FeatureNotNegotiated { feature } => feature.clone(),
            RequestError::InvalidRequest { reason } => reason.clone(),
            RequestError::NotFound { what } => what.clone(),
            RequestError::HostUnavailable { reason } => reason.clone(),
            RequestError::Failed { message } => message.clone(),
            RequestError::UnexpectedResponse { .. } => self.to_string(),
        }
    }
}

/// Wire form: the status code plus the variable detail
impl From<&RequestError> for ErrorStatus {
    fn from(error: &RequestError) -> Self {
        ErrorStatus {
            code: error.status_code(),
            message: error.detail(),
        }
    }
}

impl From<ErrorStatus> for RequestError {
    fn from(status: ErrorStatus) -> Self {
        match status.code {
            StatusCode::FeatureNotNegotiated => RequestError::FeatureNotNegotiated {
                feature: status.message,
            },
            StatusCode::InvalidArgument => RequestError::InvalidRequest {
                reason: status.message,
            },
            StatusCode::NotFound => RequestError::NotFound {
                what: status.message,
            },
            StatusCode::Unavailable => RequestError::HostUnavailable {
                reason: status.message,
            },
            StatusCode::Internal => RequestError::Failed {
                message: status.message,
            },
        }
    }
}
