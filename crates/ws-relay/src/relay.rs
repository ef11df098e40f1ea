use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::close;

/// How long a cancelled forwarding task may take to notice before it is
/// aborted. Covers a task parked on a write to a stalled peer.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Characters of a text frame included in trace logs.
const PREVIEW_CHARS: usize = 200;

/// Per-session metadata carried into the forwarding tasks for logging.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique identifier for this session.
    pub session_id: uuid::Uuid,
    /// The TCP address of the connecting client.
    pub remote_addr: SocketAddr,
}

/// Direction of message flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client -> upstream
    ClientToUpstream,
    /// Upstream -> client
    UpstreamToClient,
}

/// Why a forwarding loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardEnd {
    /// The source sent a close frame (forwarded to the destination).
    SourceClosed(Option<CloseFrame>),
    /// The source stream ended or errored without a close frame.
    SourceLost(String),
    /// Writing to the destination failed.
    WriteFailed(String),
    /// The sibling direction ended first.
    Cancelled,
    /// The task panicked or was aborted.
    Aborted(String),
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    /// The direction that ended first and triggered teardown.
    pub first: Direction,
    /// Why that direction ended.
    pub end: ForwardEnd,
    /// Messages forwarded client -> upstream.
    pub client_to_upstream: u64,
    /// Messages forwarded upstream -> client.
    pub upstream_to_client: u64,
}

/// What a forwarding task hands back when it stops: its write half, so the
/// relay can close it, plus its exit reason and message count.
struct Forwarded<W> {
    writer: W,
    end: ForwardEnd,
    forwarded: u64,
}

/// Relay messages between `client` and `upstream` until either side ends.
///
/// Two forwarding tasks run concurrently. When the first one stops, a
/// cancellation signal stops the other, and both legs are closed. Frames are
/// forwarded verbatim and in order within each direction.
pub async fn run<C, U>(
    ctx: &SessionContext,
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_write, client_read) = client.split();
    let (upstream_write, upstream_read) = upstream.split();

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut up_task = tokio::spawn(forward(
        client_read,
        upstream_write,
        cancel_rx.clone(),
        ctx.clone(),
        Direction::ClientToUpstream,
    ));
    let mut down_task = tokio::spawn(forward(
        upstream_read,
        client_write,
        cancel_rx,
        ctx.clone(),
        Direction::UpstreamToClient,
    ));

    // Wait for either direction to finish (usually means one side closed).
    let (first, up, down) = tokio::select! {
        result = &mut up_task => {
            let _ = cancel_tx.send(true);
            let down = join_cancelled(down_task).await;
            (Direction::ClientToUpstream, settle(result), down)
        }
        result = &mut down_task => {
            let _ = cancel_tx.send(true);
            let up = join_cancelled(up_task).await;
            (Direction::UpstreamToClient, up, settle(result))
        }
    };

    let (up_end, up_count, upstream_writer) = match up {
        Ok(f) => (f.end, f.forwarded, Some(f.writer)),
        Err(end) => (end, 0, None),
    };
    let (down_end, down_count, client_writer) = match down {
        Ok(f) => (f.end, f.forwarded, Some(f.writer)),
        Err(end) => (end, 0, None),
    };

    let end = match first {
        Direction::ClientToUpstream => up_end,
        Direction::UpstreamToClient => down_end,
    };

    tracing::debug!(
        session_id = %ctx.session_id,
        ?first,
        ?end,
        "relay ending"
    );

    let (client_frame, upstream_frame) = teardown_frames(first, &end);
    if let Some(writer) = client_writer {
        close_leg(writer, client_frame, ctx, "client").await;
    }
    if let Some(writer) = upstream_writer {
        close_leg(writer, upstream_frame, ctx, "upstream").await;
    }

    RelayOutcome {
        first,
        end,
        client_to_upstream: up_count,
        upstream_to_client: down_count,
    }
}

/// Forward messages from `reader` to `writer` until the source ends, a write
/// fails, or `cancel` fires.
async fn forward<R, W>(
    mut reader: R,
    mut writer: W,
    mut cancel: watch::Receiver<bool>,
    ctx: SessionContext,
    direction: Direction,
) -> Forwarded<W>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut forwarded = 0u64;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.changed() => break ForwardEnd::Cancelled,
            next = reader.next() => next,
        };

        let msg = match next {
            None => break ForwardEnd::SourceLost("stream ended".into()),
            Some(Err(err)) => {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    ?direction,
                    %err,
                    "read error, closing relay"
                );
                break ForwardEnd::SourceLost(err.to_string());
            }
            Some(Ok(msg)) => msg,
        };

        match msg {
            Message::Close(frame) => {
                // Propagate the peer's close to the other leg as-is.
                if let Err(err) = writer.send(Message::Close(frame.clone())).await {
                    if !close::is_already_closed(&err) {
                        tracing::debug!(session_id = %ctx.session_id, ?direction, %err, "close forward failed");
                    }
                }
                break ForwardEnd::SourceClosed(frame);
            }
            // Answered by tungstenite on each leg; not application data.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            msg => {
                log_preview(&ctx, direction, &msg);
                if let Err(err) = writer.send(msg).await {
                    break ForwardEnd::WriteFailed(err.to_string());
                }
                forwarded += 1;
            }
        }
    };

    Forwarded {
        writer,
        end,
        forwarded,
    }
}

/// Wait for a cancelled task, aborting it if it does not stop in time.
async fn join_cancelled<W>(mut task: JoinHandle<Forwarded<W>>) -> Result<Forwarded<W>, ForwardEnd> {
    match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
        Ok(result) => settle(result),
        Err(_) => {
            task.abort();
            Err(ForwardEnd::Aborted("did not stop after cancellation".into()))
        }
    }
}

fn settle<W>(result: Result<Forwarded<W>, JoinError>) -> Result<Forwarded<W>, ForwardEnd> {
    result.map_err(|err| {
        tracing::error!(%err, "forwarding task failed");
        ForwardEnd::Aborted(err.to_string())
    })
}

/// Close frames to send to (client, upstream) after the first direction
/// ended for `end`. `None` means the leg already received a close frame or
/// only needs a plain close.
fn teardown_frames(first: Direction, end: &ForwardEnd) -> (Option<CloseFrame>, Option<CloseFrame>) {
    let upstream_lost = || Some(close::internal_error(close::UPSTREAM_LOST_REASON));
    let client_gone = || Some(close::close_frame(CloseCode::Normal, close::CLIENT_GONE_REASON));
    let internal = || Some(close::internal_error(close::INTERNAL_ERROR_REASON));

    match (first, end) {
        (_, ForwardEnd::SourceClosed(_)) | (_, ForwardEnd::Cancelled) => (None, None),
        (_, ForwardEnd::Aborted(_)) => (internal(), internal()),
        (Direction::ClientToUpstream, ForwardEnd::SourceLost(_)) => (None, client_gone()),
        (Direction::ClientToUpstream, ForwardEnd::WriteFailed(_)) => (upstream_lost(), None),
        (Direction::UpstreamToClient, ForwardEnd::SourceLost(_)) => (upstream_lost(), None),
        (Direction::UpstreamToClient, ForwardEnd::WriteFailed(_)) => (None, client_gone()),
    }
}

/// Send an optional close frame and close the sink. Errors from a leg that
/// is already closed are expected and ignored.
async fn close_leg<W>(mut writer: W, frame: Option<CloseFrame>, ctx: &SessionContext, leg: &str)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    if let Some(frame) = frame {
        if let Err(err) = writer.send(Message::Close(Some(frame))).await {
            if !close::is_already_closed(&err) {
                tracing::debug!(session_id = %ctx.session_id, leg, %err, "close frame not delivered");
            }
        }
    }
    if let Err(err) = writer.close().await {
        if !close::is_already_closed(&err) {
            tracing::debug!(session_id = %ctx.session_id, leg, %err, "close failed");
        }
    }
}

fn log_preview(ctx: &SessionContext, direction: Direction, msg: &Message) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    match msg {
        Message::Text(text) => {
            let preview: String = text.as_str().chars().take(PREVIEW_CHARS).collect();
            tracing::trace!(session_id = %ctx.session_id, ?direction, %preview, "forwarding text");
        }
        Message::Binary(data) => {
            tracing::trace!(session_id = %ctx.session_id, ?direction, bytes = data.len(), "forwarding binary");
        }
        _ => {}
    }
}
