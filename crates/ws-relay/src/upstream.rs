use std::fmt;
use std::time::Duration;

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::credentials::ApiKey;

/// Default upstream realtime endpoint.
pub const DEFAULT_UPSTREAM_URI: &str = "wss://api.stepfun.com/v1/realtime";

/// Content type announced on the upstream upgrade request.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Upper bound on a single upstream dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An established upstream leg.
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to dial the upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URI of the upstream (`ws://` or `wss://`).
    pub uri: String,
    /// Value of the `Content-Type` header on the upgrade request.
    pub content_type: String,
    /// Upper bound on the dial, TLS and handshake included.
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_UPSTREAM_URI.to_string(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Coarse category of a transport-level connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCategory {
    /// DNS resolution or TCP connect.
    Io,
    /// TLS negotiation.
    Tls,
    /// The upstream URI could not be used.
    Url,
    /// The server answered but the WebSocket handshake was invalid.
    Handshake,
    /// Anything else tungstenite reports.
    WebSocket,
}

impl fmt::Display for TransportCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::Tls => "tls",
            Self::Url => "url",
            Self::Handshake => "handshake",
            Self::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Why the upstream leg could not be established.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream answered the upgrade with an explicit non-101 status.
    #[error("{status}")]
    Rejected { status: StatusCode },

    /// The connection failed below the HTTP layer.
    #[error("{category} error: {message}")]
    Transport {
        category: TransportCategory,
        message: String,
    },

    /// The dial did not complete within the configured bound.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The upgrade request itself could not be built.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Classify a tungstenite connect error.
    pub fn from_connect_error(err: WsError) -> Self {
        let category = match &err {
            WsError::Http(response) => {
                return Self::Rejected {
                    status: response.status(),
                }
            }
            WsError::Io(_) => TransportCategory::Io,
            WsError::Tls(_) => TransportCategory::Tls,
            WsError::Url(_) => TransportCategory::Url,
            WsError::Protocol(_) | WsError::HttpFormat(_) => TransportCategory::Handshake,
            _ => TransportCategory::WebSocket,
        };
        Self::Transport {
            category,
            message: err.to_string(),
        }
    }

    /// The upstream HTTP status, when the upstream rejected explicitly.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status } => Some(*status),
            _ => None,
        }
    }

    /// Reason string for the 1011 close sent to the client.
    pub fn close_reason(&self) -> String {
        format!("upstream connection failed: {self}")
    }
}

/// Build the upstream upgrade request carrying the bearer credential.
pub fn build_request(config: &UpstreamConfig, api_key: &ApiKey) -> Result<Request, UpstreamError> {
    let mut request = config
        .uri
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.expose()))
        .map_err(|_| UpstreamError::InvalidRequest("api key is not a valid header value".into()))?;
    let content_type = HeaderValue::from_str(&config.content_type)
        .map_err(|_| UpstreamError::InvalidRequest("invalid content type".into()))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, content_type);

    Ok(request)
}

/// Dial the upstream once. There is no retry: any failure is terminal for
/// the session.
pub async fn connect(config: &UpstreamConfig, api_key: &ApiKey) -> Result<UpstreamStream, UpstreamError> {
    let request = build_request(config, api_key)?;

    let (stream, response) =
        tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| UpstreamError::Timeout(config.connect_timeout))?
            .map_err(UpstreamError::from_connect_error)?;

    tracing::debug!(status = %response.status(), upstream = %config.uri, "upstream handshake complete");

    Ok(stream)
}
