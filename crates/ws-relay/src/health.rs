//! Liveness probe handling ahead of the WebSocket upgrade.
//!
//! The request head is peeked, not consumed, so a non-probe connection is
//! handed to the WebSocket handshake untouched.

use std::time::Duration;

use httparse::Status;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Path answered by the liveness responder.
pub const LIVENESS_PATH: &str = "/health";

const LIVENESS_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\
\r\n\
OK";

/// Largest request head we are willing to buffer while peeking.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Header slots offered to the parser; upgrade requests carry far fewer.
const MAX_HEADERS: usize = 64;

/// Pause between peeks while the request head is still arriving.
const PEEK_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Method and target of a fully received HTTP request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Bytes the head occupies on the wire, terminating blank line included.
    pub len: usize,
}

impl RequestHead {
    /// Whether this request is a liveness probe. The query string is ignored.
    pub fn is_liveness_probe(&self) -> bool {
        let path = self.target.split('?').next().unwrap_or_default();
        self.method == "GET" && path == LIVENESS_PATH
    }
}

/// Parse a request head. `Ok(None)` means more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        Status::Partial => Ok(None),
        Status::Complete(len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            len,
        })),
    }
}

/// Peek at the connection until a complete request head is available.
///
/// Returns `Ok(None)` if the peer closed before sending one, the bytes are
/// not HTTP, or the head does not fit in [`MAX_REQUEST_HEAD`]. The caller
/// bounds the wait with a timeout.
pub async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        match parse_request_head(&buf[..n]) {
            Ok(Some(head)) => return Ok(Some(head)),
            Ok(None) if n == buf.len() => return Ok(None),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(%err, "unparseable request head");
                return Ok(None);
            }
        }
        // `peek` keeps returning the same bytes until more arrive.
        if n == seen {
            tokio::time::sleep(PEEK_RETRY_DELAY).await;
        }
        seen = n;
    }
}

/// Consume the probe's request head, answer `200 OK`, and close.
pub async fn respond(mut stream: TcpStream, head: &RequestHead) -> std::io::Result<()> {
    let mut consumed = vec![0u8; head.len];
    stream.read_exact(&mut consumed).await?;

    stream.write_all(LIVENESS_RESPONSE).await?;
    stream.shutdown().await
}
