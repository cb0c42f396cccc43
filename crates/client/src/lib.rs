//! # Tether Client Library
//!
//! Client side of the tether IPC session protocol: open a transport to the
//! editor host, negotiate a session, and issue correlated calls while
//! receiving pushed events.
//!
//! ## Key Components
//!
//! - **Transports**: Unix domain socket and loopback TCP streams
//! - **Correlation**: pending calls matched to responses by correlation id
//! - **Session**: one negotiated connection with reader and writer tasks
//! - **Client**: reconnecting [`TetherClient`] with typed helpers

pub mod client;
pub mod correlation;
pub mod handshake;
pub mod session;
pub mod transport;

pub use client::{ClientOptions, ClientState, TetherClient};
pub use correlation::{CorrelationRegistry, Waiter};
pub use handshake::perform_handshake;
pub use session::{ClientSession, SessionOptions};
pub use transport::{EndpointStream, EndpointTransport, Transport};
