//! # Tether Host Library
//!
//! The editor side of the tether IPC session protocol. Network I/O runs on
//! tokio worker tasks; the editor API is only ever touched from the editor's
//! main thread, reached through the [`dispatcher`].
//!
//! ## Key Components
//!
//! - **Dispatcher**: queues closures for the main thread and pumps them once per tick
//! - **Editor**: the editor API boundary and an in-memory headless editor
//! - **Handlers**: health, asset and build requests, gated by negotiated features
//! - **Handshake**: readiness check and `Welcome` construction on the main thread
//! - **Connection**: per-connection reader, request worker, event forwarder and writer
//! - **Server**: listener, accept loop, connection registry and shutdown

pub mod connection;
pub mod dispatcher;
pub mod editor;
pub mod handlers;
pub mod handshake;
pub mod log_events;
pub mod registry;
pub mod server;

pub use dispatcher::{
    DispatchError, Dispatcher, MainThreadHandle, MainThreadPump, assert_main_thread,
    is_main_thread, spawn_main_thread,
};
pub use editor::{EditorHost, HeadlessEditor, Readiness};
pub use handlers::HostContext;
pub use log_events::EventLogLayer;
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::{HostOptions, HostServer, ShutdownHandle};
