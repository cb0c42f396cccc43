//! Client side of the handshake: one `Hello`, one control reply

use std::time::Duration;
use tether_core::error::{HandshakeError, Result, TetherError};
use tether_core::handshake::{HelloBuilder, accept_reply};
use tether_core::message_channel::{MessageReader, MessageWriter};
use tether_core::protocol::{FeatureSet, Welcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Send `hello` and wait up to `timeout` for the host's verdict
pub async fn perform_handshake<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    hello: HelloBuilder,
    requested: &FeatureSet,
    timeout: Duration,
) -> Result<Welcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_envelope(&hello.into_envelope()).await?;

    let reply = match tokio::time::timeout(timeout, reader.read_envelope()).await {
        Ok(Ok(Some(reply))) => reply,
        Ok(Ok(None)) => {
            return Err(HandshakeError::Failed {
                reason: "host closed the connection during the handshake".to_string(),
            }
            .into());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(TetherError::timeout("handshake", timeout)),
    };

    let welcome = accept_reply(reply, requested)?;
    debug!(
        "Session {} with {} {} ({})",
        welcome.session_id, welcome.host_name, welcome.host_version, welcome.platform
    );
    Ok(welcome)
}
