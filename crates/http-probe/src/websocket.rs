//! WebSocket probe calls.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::HttpProbeError;

/// Payload written on every websocket probe.
pub const WS_PROBE_PAYLOAD: &str = "ws.data";

/// How long to wait for a reply after the probe write.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects, writes the probe payload, waits briefly for one reply and
/// disconnects.
///
/// Success depends only on connect and write. The reply, if any, is
/// returned for logging.
pub async fn send_probe(url: &str, read_timeout: Duration) -> Result<Option<String>, HttpProbeError> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| HttpProbeError::WebSocket(format!("connect {url}: {e}")))?;

    socket
        .send(WsMessage::Text(WS_PROBE_PAYLOAD.into()))
        .await
        .map_err(|e| HttpProbeError::WebSocket(format!("write {url}: {e}")))?;

    let reply = match tokio::time::timeout(read_timeout, socket.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => Some(text.as_str().to_owned()),
        Ok(Some(Ok(WsMessage::Binary(data)))) => Some(format!("<{} bytes>", data.len())),
        Ok(Some(Ok(other))) => {
            debug!(url, kind = ?other, "websocket non-data reply");
            None
        }
        Ok(Some(Err(e))) => {
            debug!(url, error = %e, "websocket read failed");
            None
        }
        Ok(None) => None,
        Err(_) => {
            debug!(url, "websocket read timed out");
            None
        }
    };

    if let Err(e) = socket.close(None).await {
        debug!(url, error = %e, "websocket close failed");
    }
    Ok(reply)
}
