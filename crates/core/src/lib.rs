//! # Tether Core Library
//!
//! Shared pieces of the tether IPC session protocol: the wire format
//! (framing, envelope, codec), handshake rules, feature negotiation, the
//! event broadcaster, and the ambient infrastructure (errors, retry policy,
//! configuration, logging) used by the host, the client and the CLI.
//!
//! ## Key Components
//!
//! - **Protocol**: length-prefixed frames carrying JSON envelopes
//! - **Message Channel**: async envelope reader/writer over any byte stream
//! - **Handshake**: connection state machine and `Hello` validation pipeline
//! - **Events**: bounded, priority-aware fan-out of host notifications
//! - **Configuration & Logging**: TOML + environment config, `tracing` setup

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handshake;
pub mod logging;
pub mod message_channel;
pub mod protocol;
pub mod session;

// Re-export commonly used types
pub use config::{TetherConfig, Token, generate_token};
pub use endpoint::Endpoint;
pub use error::retry::{RetryPolicy, retry_async};
pub use error::{ErrorKind, Result, TetherError};
pub use events::{EventBroadcaster, EventPriority, EventSubscription};
pub use handshake::{ConnectionState, HandshakePolicy, HelloBuilder, Negotiation};
pub use logging::{LogFormat, LogLevel, LogOutput, LoggerBuilder, LoggingConfig};
pub use message_channel::{Inbound, MessageReader, MessageWriter};
pub use protocol::{Feature, FeatureSet, PROTOCOL_VERSION, ProtocolVersion};
pub use session::{ConnectionId, SessionId};
