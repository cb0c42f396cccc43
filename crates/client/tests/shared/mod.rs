//! Scripted in-memory host for client tests

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_client::{ClientOptions, Transport};
use tether_core::error::TransportError;
use tether_core::message_channel::{self, MessageReader, MessageWriter};
use tether_core::protocol::{
    ControlMessage, Envelope, FrameCodec, Payload, Reject, RejectCode, Response, Welcome,
    schema_fingerprint,
};
use tether_core::{Endpoint, RetryPolicy, Token};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex};
use tokio::sync::mpsc;

/// Every `connect` creates a duplex pair and hands the far end to the test
pub struct DuplexTransport {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for DuplexTransport {
    type Stream = DuplexStream;

    async fn connect(&self) -> tether_core::Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (client, host) = duplex(256 * 1024);
        self.accepted
            .send(host)
            .map_err(|_| TransportError::ConnectFailed {
                endpoint: "duplex".to_string(),
                reason: "the fake host is gone".to_string(),
            })?;
        Ok(client)
    }

    fn name(&self) -> &'static str {
        "duplex"
    }
}

pub struct FakeHost {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    attempts: Arc<AtomicUsize>,
    sessions: usize,
}

impl FakeHost {
    pub fn new() -> (Self, DuplexTransport) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let transport = DuplexTransport {
            accepted,
            attempts: attempts.clone(),
        };
        (
            Self {
                incoming,
                attempts,
                sessions: 0,
            },
            transport,
        )
    }

    /// Connection attempts the client has made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn next_stream(&mut self) -> anyhow::Result<DuplexStream> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("client transport dropped"))
    }

    /// Accept the next connection and welcome it with `features`
    pub async fn accept(&mut self, features: &[&str]) -> anyhow::Result<FakeConnection> {
        let stream = self.next_stream().await?;
        let (mut reader, mut writer) = message_channel::split(stream, FrameCodec::default());
        let hello = reader.expect_envelope().await?;
        anyhow::ensure!(
            matches!(hello.payload, Payload::Control(ControlMessage::Hello(_))),
            "expected Hello, got {}",
            hello.payload.name()
        );

        self.sessions += 1;
        let welcome = Welcome {
            protocol_version: "1.0".to_string(),
            features: features.iter().map(|f| f.to_string()).collect(),
            schema_fingerprint: schema_fingerprint().to_string(),
            host_name: "fake-host".to_string(),
            host_version: "0.0.0".to_string(),
            platform: "test".to_string(),
            runtime_version: "test".to_string(),
            session_id: format!("session-{}", self.sessions),
            metadata: Default::default(),
        };
        writer
            .write_envelope(&Envelope::control(ControlMessage::Welcome(welcome)))
            .await?;
        Ok(FakeConnection { reader, writer })
    }

    /// Accept the next connection and turn it away
    pub async fn reject(&mut self, code: RejectCode, message: &str) -> anyhow::Result<()> {
        let stream = self.next_stream().await?;
        let (mut reader, mut writer) = message_channel::split(stream, FrameCodec::default());
        reader.expect_envelope().await?;
        writer
            .write_envelope(&Envelope::control(ControlMessage::Reject(Reject::new(
                code, message,
            ))))
            .await?;
        Ok(())
    }
}

pub struct FakeConnection {
    pub reader: MessageReader<ReadHalf<DuplexStream>>,
    pub writer: MessageWriter<WriteHalf<DuplexStream>>,
}

impl FakeConnection {
    pub async fn respond(&mut self, correlation_id: &str, response: Response) -> anyhow::Result<()> {
        self.writer
            .write_envelope(&Envelope::response(correlation_id, response))
            .await?;
        Ok(())
    }
}

/// Options for a client of the fake host: fast backoff, short timeouts
pub fn options() -> ClientOptions {
    ClientOptions::new(
        Endpoint::Tcp("127.0.0.1:7420".parse().expect("valid address")),
        Token::new("s3cret"),
    )
    .with_connect_timeout(Duration::from_secs(2))
    .with_call_timeout(Duration::from_secs(30))
    .with_retry(
        RetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20)),
    )
}
