//! Matching responses to the calls waiting for them
//!
//! A caller registers a [`Waiter`] *before* its request is written, so a fast
//! response can never arrive for an id nobody is waiting on. Entries leave the
//! registry exactly once: resolved by a response, failed by a response that
//! did not decode, removed by the caller's timeout, or failed when the
//! connection goes away.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::error::{TetherError, TransportError};
use tether_core::protocol::{CorrelationId, Response};
use tokio::sync::oneshot;
use tracing::trace;

type Completion = oneshot::Sender<Result<Response, TetherError>>;

/// One pending call
#[derive(Debug)]
pub struct Waiter {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Response, TetherError>>,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response or the connection failure
    pub async fn wait(self) -> Result<Response, TetherError> {
        self.rx
            .await
            .unwrap_or(Err(TetherError::Transport(TransportError::Closed)))
    }
}

#[derive(Default)]
struct State {
    pending: HashMap<CorrelationId, Completion>,
    /// Set once the connection is gone; later registrations fail at once
    failed: Option<TransportError>,
}

#[derive(Default)]
pub struct CorrelationRegistry {
    next: AtomicU64,
    state: Mutex<State>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id, unique for the lifetime of this registry
    pub fn next_id(&self) -> CorrelationId {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn register(&self, id: CorrelationId) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match &state.failed {
            Some(reason) => {
                let _ = tx.send(Err(reason.clone().into()));
            }
            None => {
                state.pending.insert(id.clone(), tx);
            }
        }
        Waiter { id, rx }
    }

    /// Complete the waiter for `id`. Unknown or expired ids are dropped.
    pub fn resolve(&self, id: &str, response: Response) -> bool {
        let completion = self.state.lock().pending.remove(id);
        match completion {
            Some(tx) => {
                // The caller may have given up in the meantime
                let _ = tx.send(Ok(response));
                true
            }
            None => {
                trace!("Dropping response for unknown correlation id {}", id);
                false
            }
        }
    }

    /// Fail the waiter for `id` alone, e.g. when its response did not decode
    pub fn fail(&self, id: &str, error: TetherError) -> bool {
        let completion = self.state.lock().pending.remove(id);
        match completion {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a waiter, e.g. after its caller timed out
    pub fn remove(&self, id: &str) -> bool {
        self.state.lock().pending.remove(id).is_some()
    }

    /// Fail every pending waiter and every future registration
    pub fn fail_all(&self, reason: TransportError) {
        let drained: Vec<Completion> = {
            let mut state = self.state.lock();
            if state.failed.is_none() {
                state.failed = Some(reason.clone());
            }
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            trace!("Failing {} pending calls: {}", drained.len(), reason);
        }
        for tx in drained {
            let _ = tx.send(Err(reason.clone().into()));
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending())
            .field("failed", &self.is_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::error::{ErrorKind, ProtocolError};
    use tether_core::protocol::{AssetResult, HealthStatus};

    fn assets(path: &str) -> Response {
        Response::Assets(AssetResult {
            affected: vec![path.to_string()],
        })
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_the_right_waiter() {
        let registry = CorrelationRegistry::new();
        let ids: Vec<_> = (0..3).map(|_| registry.next_id()).collect();
        let waiters: Vec<_> = ids.iter().map(|id| registry.register(id.clone())).collect();

        for id in ids.iter().rev() {
            assert!(registry.resolve(id, assets(id)));
        }
        for (id, waiter) in ids.iter().zip(waiters) {
            assert_eq!(waiter.wait().await.unwrap(), assets(id));
        }
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_removed_ids_are_ignored() {
        let registry = CorrelationRegistry::new();
        let id = registry.next_id();
        let _waiter = registry.register(id.clone());
        assert!(registry.remove(&id));

        let late = Response::Health(HealthStatus {
            ready: true,
            host_version: "1".to_string(),
            busy_reason: None,
            uptime_ms: 0,
        });
        assert!(!registry.resolve(&id, late.clone()));
        assert!(!registry.resolve("does-not-exist", late));
    }

    #[tokio::test]
    async fn test_fail_all_fails_pending_and_future_waiters() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register(registry.next_id());

        registry.fail_all(TransportError::Closed);
        assert!(matches!(
            pending.wait().await,
            Err(TetherError::Transport(TransportError::Closed))
        ));

        let late = registry.register(registry.next_id());
        assert!(matches!(
            late.wait().await,
            Err(TetherError::Transport(TransportError::Closed))
        ));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_one_leaves_the_others_pending() {
        let registry = CorrelationRegistry::new();
        let broken_id = registry.next_id();
        let broken = registry.register(broken_id.clone());
        let healthy_id = registry.next_id();
        let healthy = registry.register(healthy_id.clone());

        let decode = ProtocolError::Decode {
            reason: "missing field `affected`".to_string(),
        };
        assert!(registry.fail(&broken_id, decode.into()));
        assert!(!registry.fail(&broken_id, TransportError::Closed.into()));
        assert_eq!(broken.wait().await.unwrap_err().kind(), ErrorKind::Protocol);

        assert_eq!(registry.pending(), 1);
        assert!(registry.resolve(&healthy_id, assets("Assets/a.png")));
        assert_eq!(healthy.wait().await.unwrap(), assets("Assets/a.png"));
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = CorrelationRegistry::new();
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| registry.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
