//! Active connection bookkeeping
//!
//! The registry enforces the connection limit. Admission hands out a
//! [`ConnectionSlot`] that releases itself when dropped, so a connection task
//! cannot leak its slot on any exit path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tether_core::handshake::ConnectionState;
use tether_core::session::{ConnectionId, SessionId};
use tracing::debug;

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub client_name: Option<String>,
    pub session_id: Option<SessionId>,
    pub state: ConnectionState,
    pub connected_at: SystemTime,
}

struct Inner {
    limit: usize,
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Claim a slot, or `None` when the limit is reached
    pub fn try_admit(&self, peer: impl Into<String>) -> Option<ConnectionSlot> {
        let mut connections = self.inner.connections.lock();
        if connections.len() >= self.inner.limit {
            return None;
        }

        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        connections.insert(
            id,
            ConnectionInfo {
                id,
                peer: peer.into(),
                client_name: None,
                session_id: None,
                state: ConnectionState::Connecting,
                connected_at: SystemTime::now(),
            },
        );
        Some(ConnectionSlot {
            id,
            registry: self.inner.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections ordered by id
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("limit", &self.inner.limit)
            .field("active", &self.len())
            .finish()
    }
}

/// A claimed registry entry; dropping it frees the slot
pub struct ConnectionSlot {
    id: ConnectionId,
    registry: Arc<Inner>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn set_state(&self, state: ConnectionState) {
        if let Some(info) = self.registry.connections.lock().get_mut(&self.id) {
            info.state = state;
        }
    }

    pub fn set_session(&self, client_name: &str, session_id: SessionId) {
        if let Some(info) = self.registry.connections.lock().get_mut(&self.id) {
            info.client_name = Some(client_name.to_string());
            info.session_id = Some(session_id);
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.connections.lock().remove(&self.id);
        debug!("{} released its connection slot", self.id);
    }
}
