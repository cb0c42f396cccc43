//! Request handlers
//!
//! Each category gets the typed request and the connection's negotiated
//! [`FeatureSet`], checks its feature gate, then does all editor work inside a
//! dispatcher closure. Failures become `Response::Error` here and never reach
//! the connection loop.

pub mod assets;
pub mod build;
pub mod health;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::editor::{EditorHost, Readiness};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tether_core::error::RequestError;
use tether_core::events::EventBroadcaster;
use tether_core::protocol::{
    ErrorStatus, Event, EventKind, FeatureSet, OperationEvent, OperationStage, Request, Response,
};
use tracing::debug;

impl From<DispatchError> for RequestError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Closed => RequestError::HostUnavailable {
                reason: "the editor is shutting down".to_string(),
            },
            DispatchError::Panicked { message } => RequestError::Failed { message },
        }
    }
}

/// Everything a handler needs, shared by all connections of one host
#[derive(Clone)]
pub struct HostContext {
    dispatcher: Dispatcher,
    editor: Arc<dyn EditorHost>,
    events: EventBroadcaster,
    started: Instant,
    next_operation: Arc<AtomicU64>,
}

impl HostContext {
    /// `started` anchors event timestamps; share it with other event producers
    pub fn new(
        dispatcher: Dispatcher,
        editor: Arc<dyn EditorHost>,
        events: EventBroadcaster,
        started: Instant,
    ) -> Self {
        Self {
            dispatcher,
            editor,
            events,
            started,
            next_operation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Milliseconds since the host started, monotonic
    pub fn timestamp_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run `work` against the editor on the main thread
    pub async fn on_editor<T, F>(&self, work: F) -> Result<T, RequestError>
    where
        F: FnOnce(&dyn EditorHost) -> Result<T, RequestError> + Send + 'static,
        T: Send + 'static,
    {
        let editor = self.editor.clone();
        self.dispatcher
            .run_on_main(move || work(editor.as_ref()))
            .await?
    }

    /// Like [`on_editor`](Self::on_editor), but refuse while the editor is busy
    pub async fn on_ready_editor<T, F>(&self, work: F) -> Result<T, RequestError>
    where
        F: FnOnce(&dyn EditorHost) -> Result<T, RequestError> + Send + 'static,
        T: Send + 'static,
    {
        self.on_editor(move |editor| match editor.readiness() {
            Readiness::Ready => work(editor),
            Readiness::Busy { reason } => Err(RequestError::HostUnavailable { reason }),
        })
        .await
    }

    pub(crate) fn next_operation_id(&self) -> String {
        format!("op-{}", self.next_operation.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn publish_operation(&self, operation_id: &str, name: &str, stage: OperationStage) {
        self.events.publish(Event {
            timestamp_ms: self.timestamp_ms(),
            kind: EventKind::Operation(OperationEvent {
                operation_id: operation_id.to_string(),
                name: name.to_string(),
                stage,
            }),
        });
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("dispatcher", &self.dispatcher)
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}

/// Route one request to its category and fold any failure into the response
pub async fn handle_request(
    context: &HostContext,
    features: &FeatureSet,
    request: Request,
) -> Response {
    let kind = request.name();
    let result = match request {
        Request::Health => health::handle(context, features).await.map(Response::Health),
        Request::Assets(request) => assets::handle(context, features, request)
            .await
            .map(Response::Assets),
        Request::Build(request) => build::handle(context, features, request)
            .await
            .map(Response::Build),
    };

    result.unwrap_or_else(|error| {
        debug!("{} request failed: {}", kind, error);
        Response::Error(ErrorStatus::from(&error))
    })
}
