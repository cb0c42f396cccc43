//! Host side of the handshake
//!
//! Token, version and schema are checked on the I/O task. Readiness and the
//! `Welcome` need the editor, so they share one dispatcher hop.

use crate::editor::Readiness;
use crate::handlers::HostContext;
use tether_core::error::RequestError;
use tether_core::handshake::{HandshakePolicy, Negotiation};
use tether_core::protocol::{FeatureSet, Hello, Metadata, Reject, RejectCode, Welcome};
use tether_core::session::SessionId;
use tracing::debug;

/// Result of a successful handshake
#[derive(Debug, Clone)]
pub struct Accepted {
    pub session_id: SessionId,
    pub features: FeatureSet,
    pub welcome: Welcome,
}

#[derive(Debug, Clone)]
pub struct HostHandshake {
    policy: HandshakePolicy,
    host_name: String,
}

impl HostHandshake {
    pub fn new(policy: HandshakePolicy, host_name: impl Into<String>) -> Self {
        Self {
            policy,
            host_name: host_name.into(),
        }
    }

    pub fn policy(&self) -> &HandshakePolicy {
        &self.policy
    }

    /// Run the full validation pipeline for one `Hello`
    pub async fn accept(&self, context: &HostContext, hello: &Hello) -> Result<Accepted, Reject> {
        let Negotiation {
            client_version,
            features,
        } = self.policy.validate_hello(hello)?;
        debug!(
            "Hello from {} {} (protocol {}) passed validation",
            hello.client_name, hello.client_version, client_version
        );

        let session_id = SessionId::new();
        let protocol_version = self.policy.version().to_string();
        let schema_fingerprint = self.policy.fingerprint().to_string();
        let host_name = self.host_name.clone();
        let granted = features.clone();

        let welcome = context
            .on_editor(move |editor| {
                if let Readiness::Busy { reason } = editor.readiness() {
                    return Ok(Err(reason));
                }
                let identity = editor.identity();
                let mut metadata = Metadata::new();
                metadata.insert("project".to_string(), identity.project);
                Ok(Ok(Welcome {
                    protocol_version,
                    features: granted.to_wire(),
                    schema_fingerprint,
                    host_name,
                    host_version: identity.editor_version,
                    platform: identity.platform,
                    runtime_version: identity.runtime_version,
                    session_id: session_id.to_string(),
                    metadata,
                }))
            })
            .await
            .map_err(|error| {
                debug!("Handshake dispatch failed: {}", error);
                match error {
                    RequestError::HostUnavailable { .. } => {
                        Reject::new(RejectCode::Unavailable, "The host is shutting down.")
                    }
                    _ => Reject::new(
                        RejectCode::Internal,
                        "The host failed while preparing the session.",
                    ),
                }
            })?
            .map_err(|reason| {
                debug!("Refusing session while editor is busy: {}", reason);
                Reject::new(
                    RejectCode::Unavailable,
                    "The editor is busy and cannot serve requests yet.",
                )
            })?;

        Ok(Accepted {
            session_id,
            features,
            welcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::HeadlessEditor;
    use crate::handlers::test_support::fixture;
    use tether_core::handshake::HelloBuilder;

    fn handshake() -> HostHandshake {
        HostHandshake::new(
            HandshakePolicy::new("s3cret", FeatureSet::all()),
            "test-host",
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_welcome_carries_identity_and_fresh_session() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let hello = HelloBuilder::new("s3cret")
            .raw_features(["health", "events.log", "x.unknown"])
            .build();

        let first = handshake().accept(&fx.context, &hello).await.unwrap();
        let second = handshake().accept(&fx.context, &hello).await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.welcome.features, vec!["health", "events.log"]);
        assert_eq!(first.welcome.host_name, "test-host");
        assert_eq!(first.welcome.metadata.get("project").map(String::as_str), Some("demo"));
        assert_eq!(first.welcome.session_id, first.session_id.to_string());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_token_never_reaches_editor() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let hello = HelloBuilder::new("guess").build();

        let reject = handshake().accept(&fx.context, &hello).await.unwrap_err();
        assert_eq!(reject.code, RejectCode::Unauthenticated);
        assert_eq!(fx.editor.api_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_editor_rejects_unavailable() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let editor = fx.editor.clone();
        fx.context
            .dispatcher()
            .run_on_main(move || editor.set_busy(Some("compiling".to_string())))
            .await
            .unwrap();

        let reject = handshake()
            .accept(&fx.context, &HelloBuilder::new("s3cret").build())
            .await
            .unwrap_err();
        assert_eq!(reject.code, RejectCode::Unavailable);
        assert!(!reject.message.contains("compiling"));
    }
}
