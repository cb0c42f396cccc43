//! One physical connection
//!
//! ```text
//!   reader loop ──requests──▶ request worker ──responses──┐
//!        │                                                ▼
//!        └── stray frames: log                     writer task ──▶ socket
//!                                                         ▲
//!   event broadcaster ──▶ event forwarder ──events────────┘
//! ```
//!
//! The request worker handles requests strictly in arrival order. A request
//! frame that fails to decode but still names its correlation id takes its
//! place in that order and is answered with `invalid_argument`; without an id
//! it is logged and skipped. Everything that reaches the socket goes through
//! the single writer task.

use crate::handlers::{self, HostContext};
use crate::handshake::HostHandshake;
use crate::registry::{ConnectionRegistry, ConnectionSlot};
use std::sync::Arc;
use std::time::Duration;
use tether_core::error::{ProtocolError, RequestError, TetherError};
use tether_core::handshake::ConnectionState;
use tether_core::message_channel::{
    self, Inbound, MAX_CONSECUTIVE_DECODE_FAILURES, MessageReader, MessageWriter,
    is_peer_protocol_violation,
};
use tether_core::protocol::{
    ControlMessage, CorrelationId, Envelope, ErrorStatus, EventKind, Feature, FeatureSet,
    FrameCodec, Hello, Payload, Reject, RejectCode, Request, Response,
};
use tether_core::session::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Outbound queue depth per connection
const OUTBOUND_CAPACITY: usize = 256;
/// Requests read ahead of the worker before the reader stops reading
const REQUEST_QUEUE_CAPACITY: usize = 64;
/// Time the writer gets to flush queued messages during teardown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One unit of work for the request worker, answered in arrival order
enum Work {
    Request(CorrelationId, Request),
    Malformed(CorrelationId, ProtocolError),
}

/// Host-wide services every connection task uses
#[derive(Debug, Clone)]
pub struct ConnectionServices {
    pub context: HostContext,
    pub handshake: Arc<HostHandshake>,
    pub registry: ConnectionRegistry,
    pub frames: FrameCodec,
    pub handshake_timeout: Duration,
}

/// Serve one accepted stream until the peer leaves, a fatal error occurs, or
/// `shutdown` flips to `true`
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    services: ConnectionServices,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = message_channel::split(stream, services.frames);

    let Some(slot) = services.registry.try_admit(peer.clone()) else {
        warn!(
            "Connection limit of {} reached, refusing {}",
            services.registry.limit(),
            peer
        );
        refuse(reader, writer, services.handshake_timeout).await;
        return;
    };

    let id = slot.id();
    info!("{} accepted from {}", id, peer);
    let mut connection = Connection {
        id,
        slot,
        state: ConnectionState::Connecting,
        services,
    };

    if let Err(e) = connection.run(reader, writer, shutdown).await {
        if is_peer_protocol_violation(&e) {
            warn!("{} closed after protocol violation: {}", id, e);
        } else {
            debug!("{} closed: {}", id, e);
        }
    }
    connection.enter(ConnectionState::Closed);
    info!("{} disconnected", id);
}

/// Resolves once the host shutdown flag is set or its sender is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Read the `Hello` so the client gets a proper answer, then turn it away
async fn refuse<R, W>(mut reader: MessageReader<R>, mut writer: MessageWriter<W>, timeout: Duration)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Ok(Ok(Some(_))) = tokio::time::timeout(timeout, reader.read_envelope()).await {
        let reject = Reject::new(
            RejectCode::Unavailable,
            "The host has reached its connection limit.",
        );
        let _ = writer
            .write_envelope(&Envelope::control(ControlMessage::Reject(reject)))
            .await;
    }
    let _ = writer.shutdown().await;
}

struct Connection {
    id: ConnectionId,
    slot: ConnectionSlot,
    state: ConnectionState,
    services: ConnectionServices,
}

impl Connection {
    fn enter(&mut self, next: ConnectionState) {
        match self.state.transition(next) {
            Ok(()) => self.slot.set_state(next),
            Err(e) => warn!("{}: {}", self.id, e),
        }
    }

    async fn run<R, W>(
        &mut self,
        mut reader: MessageReader<R>,
        mut writer: MessageWriter<W>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TetherError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.enter(ConnectionState::AwaitingHello);

        let hello = match self.read_hello(&mut reader).await? {
            Some(hello) => hello,
            None => return Ok(()),
        };

        let accepted = match self
            .services
            .handshake
            .accept(&self.services.context, &hello)
            .await
        {
            Ok(accepted) => accepted,
            Err(reject) => {
                info!(
                    "{} handshake rejected ({}): {}",
                    self.id, reject.code, reject.message
                );
                writer
                    .write_envelope(&Envelope::control(ControlMessage::Reject(reject)))
                    .await?;
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        writer
            .write_envelope(&Envelope::control(ControlMessage::Welcome(
                accepted.welcome,
            )))
            .await?;
        self.enter(ConnectionState::Negotiated);
        self.slot.set_session(&hello.client_name, accepted.session_id);
        info!(
            "{} session {} for {} with features [{}]",
            self.id,
            accepted.session_id,
            hello.client_name,
            accepted.features.to_wire().join(", ")
        );

        let features = accepted.features;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_loop(self.id, writer, outbound_rx));
        let mut tasks = JoinSet::new();

        self.spawn_event_forwarder(&mut tasks, &features, outbound.clone());
        let (requests, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        tasks.spawn(request_worker(
            self.services.context.clone(),
            features,
            requests_rx,
            outbound,
        ));

        self.enter(ConnectionState::Serving);
        let result = self.read_loop(&mut reader, &requests, &mut shutdown).await;

        // In-flight work is cancelled; responses already queued still drain
        tasks.abort_all();
        drop(requests);
        finish_writer(self.id, writer_task).await;
        result
    }

    async fn read_hello<R>(&self, reader: &mut MessageReader<R>) -> Result<Option<Hello>, TetherError>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = self.services.handshake_timeout;
        let envelope = match tokio::time::timeout(timeout, reader.read_envelope()).await {
            Ok(read) => read?,
            Err(_) => return Err(TetherError::timeout("handshake", timeout)),
        };

        match envelope {
            Some(Envelope {
                payload: Payload::Control(ControlMessage::Hello(hello)),
                ..
            }) => Ok(Some(hello)),
            Some(other) => {
                warn!(
                    "{} sent {} before hello, closing",
                    self.id,
                    other.payload.name()
                );
                Ok(None)
            }
            None => {
                debug!("{} closed before the handshake", self.id);
                Ok(None)
            }
        }
    }

    async fn read_loop<R>(
        &self,
        reader: &mut MessageReader<R>,
        requests: &mpsc::Sender<Work>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TetherError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decode_failures = 0;

        loop {
            let read = tokio::select! {
                _ = stopped(shutdown) => {
                    debug!("{} stopping for host shutdown", self.id);
                    return Ok(());
                }
                read = reader.read_inbound() => read?,
            };

            let work = match read {
                Some(Inbound::Envelope(envelope)) => {
                    decode_failures = 0;
                    match envelope.payload {
                        Payload::Request(request) => Work::Request(envelope.correlation_id, request),
                        other => {
                            warn!("{} ignoring stray {} message", self.id, other.name());
                            continue;
                        }
                    }
                }
                Some(Inbound::Malformed {
                    correlation_id,
                    error,
                }) => {
                    decode_failures += 1;
                    if decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        return Err(error.into());
                    }
                    match correlation_id {
                        Some(correlation_id) => {
                            warn!(
                                "{} rejecting undecodable request {}: {}",
                                self.id, correlation_id, error
                            );
                            Work::Malformed(correlation_id, error)
                        }
                        None => {
                            warn!("{} discarding undecodable message: {}", self.id, error);
                            continue;
                        }
                    }
                }
                None => {
                    debug!("{} peer closed the connection", self.id);
                    return Ok(());
                }
            };

            if requests.send(work).await.is_err() {
                return Ok(());
            }
        }
    }

    fn spawn_event_forwarder(
        &self,
        tasks: &mut JoinSet<()>,
        features: &FeatureSet,
        outbound: mpsc::Sender<Envelope>,
    ) {
        let logs = features.contains(&Feature::LogEvents);
        let operations = features.contains(&Feature::OperationEvents);
        if !logs && !operations {
            return;
        }

        let mut subscription = self.services.context.events().subscribe();
        let id = self.id;
        tasks.spawn(async move {
            while let Some(event) = subscription.recv().await {
                let wanted = match event.kind {
                    EventKind::Log(_) => logs,
                    EventKind::Operation(_) => operations,
                };
                if wanted && outbound.send(Envelope::event(event)).await.is_err() {
                    break;
                }
            }
            if subscription.dropped() > 0 {
                debug!("{} dropped {} low-priority events", id, subscription.dropped());
            }
        });
    }
}

async fn request_worker(
    context: HostContext,
    features: FeatureSet,
    mut requests: mpsc::Receiver<Work>,
    outbound: mpsc::Sender<Envelope>,
) {
    while let Some(work) = requests.recv().await {
        let (correlation_id, response) = match work {
            Work::Request(correlation_id, request) => (
                correlation_id,
                handlers::handle_request(&context, &features, request).await,
            ),
            Work::Malformed(correlation_id, error) => {
                let error = RequestError::InvalidRequest {
                    reason: error.to_string(),
                };
                (correlation_id, Response::Error(ErrorStatus::from(&error)))
            }
        };
        if outbound
            .send(Envelope::response(correlation_id, response))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn write_loop<W>(id: ConnectionId, mut writer: MessageWriter<W>, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = writer.write_envelope(&envelope).await {
            debug!("{} write failed: {}", id, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn finish_writer(id: ConnectionId, mut writer_task: JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
        .await
        .is_err()
    {
        debug!("{} writer did not drain in time", id);
        writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::HeadlessEditor;
    use crate::handlers::test_support::{Fixture, fixture};
    use tether_core::handshake::{HandshakePolicy, HelloBuilder};
    use tether_core::protocol::{HealthStatus, Response};
    use tokio::io::duplex;

    fn services(fx: &Fixture, limit: usize) -> ConnectionServices {
        ConnectionServices {
            context: fx.context.clone(),
            handshake: Arc::new(HostHandshake::new(
                HandshakePolicy::new("s3cret", FeatureSet::all()),
                "test-host",
            )),
            registry: ConnectionRegistry::new(limit),
            frames: FrameCodec::default(),
            handshake_timeout: Duration::from_secs(2),
        }
    }

    type Peer = (
        MessageReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        MessageWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    );

    fn connect(services: ConnectionServices, shutdown: watch::Receiver<bool>) -> (Peer, JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            "duplex".to_string(),
            services,
            shutdown,
        ));
        (message_channel::split(client, FrameCodec::default()), task)
    }

    async fn handshake(peer: &mut Peer) {
        peer.1
            .write_envelope(&HelloBuilder::new("s3cret").into_envelope())
            .await
            .unwrap();
        let reply = peer.0.expect_envelope().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::Control(ControlMessage::Welcome(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stray_and_garbage_frames_do_not_kill_the_session() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let (_tx, shutdown) = watch::channel(false);
        let (mut peer, _task) = connect(services(&fx, 4), shutdown);
        handshake(&mut peer).await;

        peer.1
            .write_envelope(&Envelope::control(ControlMessage::Hello(
                HelloBuilder::new("s3cret").build(),
            )))
            .await
            .unwrap();
        peer.1.write_frame(b"{not json").await.unwrap();
        peer.1
            .write_envelope(&Envelope::request("7", Request::Health))
            .await
            .unwrap();

        let reply = peer.0.expect_envelope().await.unwrap();
        assert_eq!(reply.correlation_id, "7");
        assert!(matches!(
            reply.payload,
            Payload::Response(Response::Health(HealthStatus { ready: true, .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undecodable_request_is_answered_with_its_id() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let (_tx, shutdown) = watch::channel(false);
        let (mut peer, _task) = connect(services(&fx, 4), shutdown);
        handshake(&mut peer).await;

        peer.1
            .write_frame(br#"{"correlation_id":"9","request":{"assets":{"import":{}}}}"#)
            .await
            .unwrap();
        peer.1
            .write_envelope(&Envelope::request("10", Request::Health))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(3), peer.0.expect_envelope())
            .await
            .expect("host did not answer the undecodable request")
            .unwrap();
        assert_eq!(reply.correlation_id, "9");
        match reply.payload {
            Payload::Response(Response::Error(status)) => {
                assert_eq!(status.code, tether_core::protocol::StatusCode::InvalidArgument)
            }
            other => panic!("expected an error response, got {:?}", other),
        }

        let next = peer.0.expect_envelope().await.unwrap();
        assert_eq!(next.correlation_id, "10");
        assert!(matches!(
            next.payload,
            Payload::Response(Response::Health(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_garbage_is_fatal() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let (_tx, shutdown) = watch::channel(false);
        let (mut peer, task) = connect(services(&fx, 4), shutdown);
        handshake(&mut peer).await;

        for _ in 0..MAX_CONSECUTIVE_DECODE_FAILURES {
            peer.1.write_frame(b"\x00\x01garbage").await.unwrap();
        }
        assert!(peer.0.read_envelope().await.unwrap().is_none());
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_before_hello_closes_without_reply() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let (_tx, shutdown) = watch::channel(false);
        let (mut peer, task) = connect(services(&fx, 4), shutdown);

        peer.1
            .write_envelope(&Envelope::request("1", Request::Health))
            .await
            .unwrap();
        assert!(peer.0.read_envelope().await.unwrap().is_none());
        task.await.unwrap();
        assert_eq!(fx.editor.api_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_limit_rejects_with_unavailable() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let services = services(&fx, 1);
        let (_tx, shutdown) = watch::channel(false);

        let (mut first, _first_task) = connect(services.clone(), shutdown.clone());
        handshake(&mut first).await;

        let (mut second, _second_task) = connect(services.clone(), shutdown);
        second
            .1
            .write_envelope(&HelloBuilder::new("s3cret").into_envelope())
            .await
            .unwrap();
        match second.0.expect_envelope().await.unwrap().payload {
            Payload::Control(ControlMessage::Reject(reject)) => {
                assert_eq!(reject.code, RejectCode::Unavailable)
            }
            other => panic!("expected reject, got {:?}", other),
        }
        assert_eq!(services.registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_releases_the_slot() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let services = services(&fx, 4);
        let (tx, shutdown) = watch::channel(false);
        let (mut peer, task) = connect(services.clone(), shutdown);
        handshake(&mut peer).await;
        assert_eq!(services.registry.len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(services.registry.is_empty());
        assert!(peer.0.read_envelope().await.unwrap().is_none());
    }
}
