//! Closure codes and close-frame helpers shared by the listener and relay.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Close code sent when the upgrade request carries no API key.
pub const API_KEY_REQUIRED_CODE: u16 = 4000;

/// Close reason paired with [`API_KEY_REQUIRED_CODE`].
pub const API_KEY_REQUIRED_REASON: &str = "API key required";

/// Reason sent to the client when the upstream leg drops mid-session.
pub const UPSTREAM_LOST_REASON: &str = "upstream connection lost";

/// Reason sent upstream when the client leg drops mid-session.
pub const CLIENT_GONE_REASON: &str = "client disconnected";

/// Reason sent when a forwarding task dies unexpectedly.
pub const INTERNAL_ERROR_REASON: &str = "internal relay error";

/// A close frame payload is capped at 125 bytes, two of which are the code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// How long to wait for the peer to answer our close frame.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Build a close frame, truncating the reason to fit the frame limit.
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    }
}

/// Close frame for a missing credential.
pub fn api_key_required() -> CloseFrame {
    close_frame(CloseCode::from(API_KEY_REQUIRED_CODE), API_KEY_REQUIRED_REASON)
}

/// 1011 close frame carrying `reason`.
pub fn internal_error(reason: &str) -> CloseFrame {
    close_frame(CloseCode::Error, reason)
}

/// Truncate `reason` to at most [`MAX_CLOSE_REASON_BYTES`] on a UTF-8
/// character boundary.
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Errors that only mean "this handle was already closed".
pub fn is_already_closed(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

/// Send `frame` and wait briefly for the peer's answering close.
///
/// Safe to call on a connection that is already closing or closed: those
/// errors are swallowed and logged at `debug`.
pub async fn close_gracefully<S>(ws: &mut WebSocketStream<S>, frame: CloseFrame)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = ws.send(Message::Close(Some(frame))).await {
        if !is_already_closed(&err) {
            tracing::debug!(%err, "failed to send close frame");
        }
        return;
    }

    // Read until the peer's close reply (or EOF) so the handshake completes.
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("peer did not answer close frame in time");
    }
}
