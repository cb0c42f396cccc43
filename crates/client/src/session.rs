//! One negotiated connection to a host
//!
//! A [`ClientSession`] owns a reader task and a writer task. Callers never
//! touch the socket: a call registers in the [`CorrelationRegistry`], queues
//! its request for the writer and waits. The reader resolves responses by
//! correlation id in whatever order they arrive, republishes events to local
//! subscribers, and fails every pending call the moment the connection dies.

use crate::correlation::CorrelationRegistry;
use crate::handshake::perform_handshake;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_core::config::Token;
use tether_core::error::{RequestError, Result, TetherError, TransportError};
use tether_core::events::{DEFAULT_EVENT_CAPACITY, EventBroadcaster, EventSubscription};
use tether_core::handshake::HelloBuilder;
use tether_core::message_channel::{
    self, Inbound, MAX_CONSECUTIVE_DECODE_FAILURES, MessageReader, MessageWriter,
};
use tether_core::protocol::{Envelope, FeatureSet, FrameCodec, Payload, Request, Response, Welcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Requests queued for the writer before callers start waiting on it
const OUTBOUND_CAPACITY: usize = 256;

/// What a session presents in its `Hello`
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub token: Token,
    pub features: FeatureSet,
    pub client_name: String,
    pub handshake_timeout: Duration,
    pub frames: FrameCodec,
    pub event_capacity: usize,
}

impl SessionOptions {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            features: FeatureSet::all(),
            client_name: "tether-client".to_string(),
            handshake_timeout: Duration::from_secs(5),
            frames: FrameCodec::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    fn hello(&self) -> HelloBuilder {
        HelloBuilder::new(self.token.expose())
            .features(&self.features)
            .client(self.client_name.clone(), env!("CARGO_PKG_VERSION"))
    }
}

pub struct ClientSession {
    welcome: Welcome,
    features: FeatureSet,
    pending: Arc<CorrelationRegistry>,
    outbound: mpsc::Sender<Envelope>,
    events: EventBroadcaster,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    /// Handshake over `stream` and start serving calls on it
    pub async fn establish<S>(stream: S, options: &SessionOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = message_channel::split(stream, options.frames);
        let welcome = perform_handshake(
            &mut reader,
            &mut writer,
            options.hello(),
            &options.features,
            options.handshake_timeout,
        )
        .await?;
        let features = FeatureSet::from_wire(&welcome.features);

        let pending = Arc::new(CorrelationRegistry::new());
        let events = EventBroadcaster::new(options.event_capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            pending.clone(),
            closed.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        Ok(Self {
            welcome,
            features,
            pending,
            outbound,
            events,
            closed,
            reader,
            writer,
        })
    }

    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// A request-level failure from the host comes back as
    /// [`TetherError::Request`]; the session stays usable. A timeout forgets
    /// the call, so a late response is dropped.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let id = self.pending.next_id();
        let waiter = self.pending.register(id.clone());
        trace!("Call {} ({})", id, request.name());

        let exchange = async {
            self.outbound
                .send(Envelope::request(id.clone(), request))
                .await
                .map_err(|_| TetherError::from(TransportError::Closed))?;
            waiter.wait().await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Response::Error(status))) => Err(RequestError::from(status).into()),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.pending.remove(&id);
                Err(e)
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(TetherError::timeout("call", timeout))
            }
        }
    }

    /// Events received on this session. Ends when the session closes.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    /// Features the host granted
    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Calls still waiting for a response
    pub fn pending(&self) -> usize {
        self.pending.pending()
    }

    /// Tear the session down, failing whatever is still pending
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
        self.pending.fail_all(TransportError::Closed);
        self.events.close();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.welcome.session_id)
            .field("features", &self.features)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut reader: MessageReader<R>,
    pending: Arc<CorrelationRegistry>,
    events: EventBroadcaster,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut decode_failures = 0;

    let reason = loop {
        match reader.read_inbound().await {
            Ok(Some(Inbound::Envelope(envelope))) => {
                decode_failures = 0;
                match envelope.payload {
                    Payload::Response(response) => {
                        pending.resolve(&envelope.correlation_id, response);
                    }
                    Payload::Event(event) => events.publish(event),
                    other => warn!("Ignoring stray {} message from host", other.name()),
                }
            }
            Ok(None) => {
                debug!("Host closed the connection");
                break TransportError::Closed;
            }
            Ok(Some(Inbound::Malformed {
                correlation_id,
                error,
            })) => {
                decode_failures += 1;
                if decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                    break TransportError::ReadFailed {
                        reason: error.to_string(),
                    };
                }
                warn!("Undecodable message from host: {}", error);
                if let Some(id) = correlation_id {
                    pending.fail(&id, error.into());
                }
            }
            Err(TetherError::Transport(e)) => break e,
            Err(e) => {
                break TransportError::ReadFailed {
                    reason: e.to_string(),
                };
            }
        }
    };

    closed.store(true, Ordering::Release);
    pending.fail_all(reason);
    events.close();
}

async fn write_loop<W>(
    mut writer: MessageWriter<W>,
    mut outbound: mpsc::Receiver<Envelope>,
    pending: Arc<CorrelationRegistry>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = writer.write_envelope(&envelope).await {
            debug!("Write to host failed: {}", e);
            closed.store(true, Ordering::Release);
            pending.fail_all(TransportError::WriteFailed {
                reason: e.to_string(),
            });
            return;
        }
    }
    let _ = writer.shutdown().await;
}
