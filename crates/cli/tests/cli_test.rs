//! End-to-end runs of the `tether` binary

mod shared;

use anyhow::Result;
use shared::{TOKEN, TestHost, tether};
use tether_host::HeadlessEditor;

#[tokio::test]
async fn test_token_prints_a_fresh_hex_token() -> Result<()> {
    let first = tether(&["token"]).await?;
    let second = tether(&["token"]).await?;
    assert!(first.status.success(), "stderr: {}", first.stderr);

    let token = first.stdout.trim();
    assert_eq!(token.len(), 64);
    assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_ne!(token, second.stdout.trim());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_prints_json() -> Result<()> {
    let host = TestHost::start(HeadlessEditor::new("Demo")).await?;
    let endpoint = host.endpoint.to_string();

    let output = tether(&["--endpoint", &endpoint, "--token", TOKEN, "health"]).await?;
    assert!(output.status.success(), "stderr: {}", output.stderr);

    let health: serde_json::Value = serde_json::from_str(&output.stdout)?;
    assert_eq!(health["ready"], serde_json::Value::Bool(true));
    assert!(health["host_version"].is_string());

    host.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_token_exits_with_the_error_kind() -> Result<()> {
    let host = TestHost::start(HeadlessEditor::new("Demo")).await?;
    let endpoint = host.endpoint.to_string();

    let output = tether(&[
        "--endpoint",
        &endpoint,
        "--token",
        "not-the-token",
        "--no-retry",
        "health",
    ])
    .await?;
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(
        output.stderr.contains("[authentication]"),
        "stderr: {}",
        output.stderr
    );

    host.stop().await
}

#[tokio::test]
async fn test_missing_token_is_a_configuration_error() -> Result<()> {
    let output = tether(&["--endpoint", "tcp:127.0.0.1:9", "health"]).await?;
    assert!(!output.status.success());
    assert!(output.stderr.contains("--token"), "stderr: {}", output.stderr);
    assert!(
        output.stderr.contains("[configuration]"),
        "stderr: {}",
        output.stderr
    );
    Ok(())
}
