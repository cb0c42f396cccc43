//! Handshake rules shared by both peers
//!
//! The host runs [`HandshakePolicy::validate_hello`] for the checks that need
//! nothing but the `Hello` itself (token, protocol version, schema
//! fingerprint). Readiness and the `Welcome` contents depend on the editor and
//! are produced by the host crate in a single dispatcher hop.
//!
//! The client side builds its `Hello` with [`HelloBuilder`] and classifies the
//! single control reply with [`accept_reply`].

use crate::error::{HandshakeError, ProtocolError, Result, TetherError};
use crate::protocol::{
    ControlMessage, Envelope, FeatureSet, Hello, Metadata, PROTOCOL_VERSION, Payload,
    ProtocolVersion, Reject, RejectCode, Welcome, schema_fingerprint,
};
use subtle::ConstantTimeEq;

/// Lifecycle of one physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    AwaitingHello,
    Negotiated,
    Serving,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, AwaitingHello)
                | (AwaitingHello, Negotiated)
                | (Negotiated, Serving)
                | (_, Closed)
        )
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn transition(&mut self, next: ConnectionState) -> std::result::Result<(), ProtocolError> {
        if !self.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHello => "awaiting-hello",
            ConnectionState::Negotiated => "negotiated",
            ConnectionState::Serving => "serving",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of the editor-independent part of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Version the client announced
    pub client_version: ProtocolVersion,
    /// Intersection of requested and supported features
    pub features: FeatureSet,
}

/// Host-side acceptance rules
#[derive(Clone)]
pub struct HandshakePolicy {
    expected_token: String,
    supported: FeatureSet,
    version: ProtocolVersion,
    fingerprint: String,
}

impl std::fmt::Debug for HandshakePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakePolicy")
            .field("expected_token", &"<redacted>")
            .field("supported", &self.supported)
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl HandshakePolicy {
    pub fn new(expected_token: impl Into<String>, supported: FeatureSet) -> Self {
        Self {
            expected_token: expected_token.into(),
            supported,
            version: PROTOCOL_VERSION,
            fingerprint: schema_fingerprint().to_string(),
        }
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn supported(&self) -> &FeatureSet {
        &self.supported
    }

    /// Token, version and schema checks, in that order. The first failure wins.
    pub fn validate_hello(&self, hello: &Hello) -> std::result::Result<Negotiation, Reject> {
        if !self.token_matches(&hello.token) {
            return Err(Reject::new(
                RejectCode::Unauthenticated,
                "The presented token was missing or not accepted.",
            ));
        }

        let client_version: ProtocolVersion = hello.protocol_version.parse().map_err(|_| {
            Reject::new(
                RejectCode::OutOfRange,
                "The protocol version could not be parsed.",
            )
        })?;
        if !self.version.is_compatible_with(&client_version) {
            return Err(Reject::new(
                RejectCode::OutOfRange,
                format!(
                    "Protocol version {} is not compatible with host version {}.",
                    client_version, self.version
                ),
            ));
        }

        if hello.schema_fingerprint.is_empty() || hello.schema_fingerprint != self.fingerprint {
            return Err(Reject::new(
                RejectCode::FailedPrecondition,
                "The message schema fingerprint does not match the host schema.",
            ));
        }

        let requested = FeatureSet::from_wire(&hello.features);
        Ok(Negotiation {
            client_version,
            features: self.supported.negotiate(&requested),
        })
    }

    // Empty on either side never matches
    fn token_matches(&self, presented: &str) -> bool {
        if self.expected_token.is_empty() || presented.is_empty() {
            return false;
        }
        bool::from(
            self.expected_token
                .as_bytes()
                .ct_eq(presented.as_bytes()),
        )
    }
}

/// Builds the client's `Hello`
#[derive(Clone)]
pub struct HelloBuilder {
    hello: Hello,
}

impl HelloBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            hello: Hello {
                token: token.into(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                features: FeatureSet::all().to_wire(),
                schema_fingerprint: schema_fingerprint().to_string(),
                client_name: "tether-client".to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                metadata: Metadata::new(),
            },
        }
    }

    pub fn features(mut self, features: &FeatureSet) -> Self {
        self.hello.features = features.to_wire();
        self
    }

    /// Request raw feature strings, including ones this build does not know
    pub fn raw_features<S: Into<String>>(mut self, features: impl IntoIterator<Item = S>) -> Self {
        self.hello.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn client(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.hello.client_name = name.into();
        self.hello.client_version = version.into();
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.hello.protocol_version = version.into();
        self
    }

    pub fn schema_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.hello.schema_fingerprint = fingerprint.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hello.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Hello {
        self.hello
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::control(ControlMessage::Hello(self.hello))
    }
}

/// Classify the one control reply the client waits for after `Hello`
pub fn accept_reply(reply: Envelope, requested: &FeatureSet) -> Result<Welcome> {
    match reply.payload {
        Payload::Control(ControlMessage::Welcome(welcome)) => {
            let granted = FeatureSet::from_wire(&welcome.features);
            if !granted.is_subset(requested) {
                return Err(HandshakeError::Failed {
                    reason: "host granted features that were not requested".to_string(),
                }
                .into());
            }
            Ok(welcome)
        }
        Payload::Control(ControlMessage::Reject(reject)) => {
            Err(TetherError::rejected(reject.code, reject.message))
        }
        other => Err(HandshakeError::Failed {
            reason: format!("expected welcome or reject, got {}", other.name()),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Feature, Request};

    fn policy() -> HandshakePolicy {
        HandshakePolicy::new("s3cret", FeatureSet::all())
    }

    fn hello() -> HelloBuilder {
        HelloBuilder::new("s3cret")
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut state = ConnectionState::Connecting;
        assert!(state.transition(ConnectionState::Serving).is_err());
        state.transition(ConnectionState::AwaitingHello).unwrap();
        state.transition(ConnectionState::Negotiated).unwrap();
        state.transition(ConnectionState::Serving).unwrap();
        state.transition(ConnectionState::Closed).unwrap();
        // Closing twice is fine
        state.transition(ConnectionState::Closed).unwrap();
        assert!(state.transition(ConnectionState::Serving).is_err());
    }

    #[test]
    fn test_valid_hello_negotiates_intersection() {
        let policy = HandshakePolicy::new("s3cret", FeatureSet::from_wire(&["health", "assets.basic"]));
        let hello = hello()
            .raw_features(["health", "build.minimal", "time.travel"])
            .build();
        let negotiation = policy.validate_hello(&hello).unwrap();
        assert_eq!(negotiation.features.to_wire(), vec!["health"]);
        assert_eq!(negotiation.client_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_token_is_checked_first() {
        let hello = HelloBuilder::new("wrong")
            .protocol_version("9.0")
            .schema_fingerprint("nope")
            .build();
        let reject = policy().validate_hello(&hello).unwrap_err();
        assert_eq!(reject.code, RejectCode::Unauthenticated);
        assert!(!reject.message.contains("wrong"));
        assert!(!reject.message.contains("s3cret"));
    }

    #[test]
    fn test_empty_tokens_never_match() {
        let reject = policy()
            .validate_hello(&HelloBuilder::new("").build())
            .unwrap_err();
        assert_eq!(reject.code, RejectCode::Unauthenticated);

        let open = HandshakePolicy::new("", FeatureSet::all());
        let reject = open.validate_hello(&HelloBuilder::new("").build()).unwrap_err();
        assert_eq!(reject.code, RejectCode::Unauthenticated);
    }

    #[test]
    fn test_version_checks() {
        let reject = policy()
            .validate_hello(&hello().protocol_version("2.0").schema_fingerprint("x").build())
            .unwrap_err();
        assert_eq!(reject.code, RejectCode::OutOfRange);

        let reject = policy()
            .validate_hello(&hello().protocol_version("one.zero").build())
            .unwrap_err();
        assert_eq!(reject.code, RejectCode::OutOfRange);

        // Minor drift is accepted
        assert!(
            policy()
                .validate_hello(&hello().protocol_version("1.7").build())
                .is_ok()
        );
    }

    #[test]
    fn test_schema_mismatch_and_missing_fingerprint() {
        for fingerprint in ["", "deadbeef"] {
            let reject = policy()
                .validate_hello(&hello().schema_fingerprint(fingerprint).build())
                .unwrap_err();
            assert_eq!(reject.code, RejectCode::FailedPrecondition);
        }
    }

    #[test]
    fn test_accept_reply_classification() {
        let requested = FeatureSet::from_wire(&["health"]);

        let reject = Envelope::control(ControlMessage::Reject(Reject::new(
            RejectCode::Unavailable,
            "The editor is compiling scripts.",
        )));
        let err = accept_reply(reject, &requested).unwrap_err();
        assert!(err.is_retriable());

        let stray = Envelope::request("1", Request::Health);
        let err = accept_reply(stray, &requested).unwrap_err();
        assert!(matches!(err, TetherError::Handshake(HandshakeError::Failed { .. })));
    }

    #[test]
    fn test_accept_reply_refuses_unrequested_grants() {
        let requested = FeatureSet::from_wire(&["health"]);
        let welcome = Welcome {
            protocol_version: "1.0".to_string(),
            features: vec![Feature::BuildMinimal.to_string()],
            schema_fingerprint: schema_fingerprint().to_string(),
            host_name: "editor".to_string(),
            host_version: "2022.3".to_string(),
            platform: "linux".to_string(),
            runtime_version: "test".to_string(),
            session_id: "s".to_string(),
            metadata: Metadata::new(),
        };
        let envelope = Envelope::control(ControlMessage::Welcome(welcome));
        assert!(accept_reply(envelope, &requested).is_err());
    }
}
