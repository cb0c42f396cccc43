mod shared;

use anyhow::Result;
use shared::{FakeHost, options};
use std::time::Duration;
use tether_client::{ClientState, TetherClient};
use tether_core::ErrorKind;
use tether_core::protocol::{
    AssetRequest, AssetResult, Envelope, Event, EventKind, HealthStatus, OperationEvent,
    OperationStage, Payload, RejectCode, Request, Response,
};

fn affected(path: &str) -> Response {
    Response::Assets(AssetResult {
        affected: vec![path.to_string()],
    })
}

fn import_path(envelope: &Envelope) -> String {
    match &envelope.payload {
        Payload::Request(Request::Assets(AssetRequest::Import { path })) => path.clone(),
        other => panic!("expected an import request, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_responses_in_reverse_order_reach_their_callers() -> Result<()> {
    let (mut host, transport) = FakeHost::new();
    let client = TetherClient::with_transport(transport, options());

    let serve = tokio::spawn(async move {
        let mut conn = host.accept(&["assets.basic"]).await?;
        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(conn.reader.expect_envelope().await?);
        }
        for request in requests.iter().rev() {
            conn.respond(&request.correlation_id, affected(&import_path(request)))
                .await?;
        }
        anyhow::Ok(conn)
    });

    let (a, b, c) = tokio::join!(
        client.import_asset("Assets/a.png"),
        client.import_asset("Assets/b.png"),
        client.import_asset("Assets/c.png"),
    );
    assert_eq!(a?.affected, vec!["Assets/a.png"]);
    assert_eq!(b?.affected, vec!["Assets/b.png"]);
    assert_eq!(c?.affected, vec!["Assets/c.png"]);

    // One shared session for concurrent first calls
    let _conn = serve.await??;
    assert_eq!(client.state(), ClientState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_transport_drop_fails_pending_calls_at_once() -> Result<()> {
    let (mut host, transport) = FakeHost::new();
    let client = TetherClient::with_transport(transport, options());

    let (connected, conn) = tokio::join!(
        client.ensure_connected(),
        host.accept(&["health", "assets.basic"])
    );
    connected?;
    let mut conn = conn?;

    let vanish = async move {
        conn.reader.expect_envelope().await?;
        conn.reader.expect_envelope().await?;
        drop(conn);
        anyhow::Ok(())
    };
    // Far below the 30s call timeout
    let (health, refresh, vanished) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(client.health(), client.refresh_assets(), vanish)
    })
    .await?;
    vanished?;
    assert_eq!(health.unwrap_err().kind(), ErrorKind::Transport);
    assert_eq!(refresh.unwrap_err().kind(), ErrorKind::Transport);
    assert_eq!(client.state(), ClientState::Disconnected);

    // The next call opens a fresh session
    let answer = async {
        let mut conn = host.accept(&["health"]).await?;
        let request = conn.reader.expect_envelope().await?;
        let status = HealthStatus {
            ready: true,
            host_version: "0.0.0".to_string(),
            busy_reason: None,
            uptime_ms: 42,
        };
        conn.respond(&request.correlation_id, Response::Health(status))
            .await?;
        anyhow::Ok(conn)
    };
    let (health, conn) = tokio::join!(client.health(), answer);
    let _conn = conn?;
    assert_eq!(health?.uptime_ms, 42);
    assert_eq!(
        client.welcome().map(|w| w.session_id),
        Some("session-2".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_events_reach_subscribers() -> Result<()> {
    let (mut host, transport) = FakeHost::new();
    let client = TetherClient::with_transport(transport, options());

    let (subscription, conn) = tokio::join!(client.subscribe(), host.accept(&["events.operation"]));
    let mut subscription = subscription?;
    let mut conn = conn?;

    let event = Event {
        timestamp_ms: 7,
        kind: EventKind::Operation(OperationEvent {
            operation_id: "op-1".to_string(),
            name: "build.player".to_string(),
            stage: OperationStage::Started,
        }),
    };
    conn.writer.write_envelope(&Envelope::event(event.clone())).await?;
    assert_eq!(subscription.recv().await, Some(event));

    // Closing the connection ends the subscription
    drop(conn);
    assert_eq!(subscription.recv().await, None);
    Ok(())
}

#[tokio::test]
async fn test_permanent_rejection_is_not_retried() -> Result<()> {
    let (mut host, transport) = FakeHost::new();
    let client = TetherClient::with_transport(transport, options());

    let (connected, rejected) = tokio::join!(
        client.ensure_connected(),
        host.reject(RejectCode::Unauthenticated, "The token is not valid.")
    );
    rejected?;
    let err = connected.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(host.attempts(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_host_is_retried_with_backoff() -> Result<()> {
    let (mut host, transport) = FakeHost::new();
    let client = TetherClient::with_transport(transport, options());

    let script = async {
        host.reject(RejectCode::Unavailable, "The editor is compiling scripts.")
            .await?;
        host.reject(RejectCode::Unavailable, "The editor is compiling scripts.")
            .await?;
        host.accept(&["health"]).await
    };
    let (connected, conn) = tokio::join!(client.ensure_connected(), script);
    let _conn = conn?;
    connected?;
    assert_eq!(host.attempts(), 3);
    assert_eq!(client.state(), ClientState::Connected);
    Ok(())
}
