use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::registry::{InMemoryRegistry, Registration, SessionInfo, SessionRegistry, SessionState};
use crate::relay::{Direction, SessionContext};
use crate::upstream::UpstreamConfig;
use crate::{close, credentials, health, relay, upstream};

/// Default interface the proxy listens on.
pub const DEFAULT_LISTEN_HOST: &str = "localhost";

/// Default port the proxy listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 8765;

/// Default bound on the inbound request head and WebSocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` (e.g. descriptor exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the realtime relay.
pub struct ProxyConfig {
    /// Host name or address to bind the listening socket to.
    pub listen_host: String,
    /// Port to bind the listening socket to.
    pub listen_port: u16,
    /// Upstream endpoint every session is relayed to.
    pub upstream: UpstreamConfig,
    /// Bound on reading the request head and completing the inbound upgrade.
    pub handshake_timeout: Duration,
    /// Bookkeeping of active sessions.
    pub registry: Arc<dyn SessionRegistry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            upstream: UpstreamConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            registry: Arc::new(InMemoryRegistry::new()),
        }
    }
}

/// Errors that end a connection before a session could be established.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] WsError),

    #[error("client did not complete the handshake within {}s", .0.as_secs())]
    HandshakeTimeout(Duration),
}

/// The realtime relay server.
///
/// Accepts client WebSocket connections, answers liveness probes, checks for
/// an API key, dials the upstream with that key, and relays frames in both
/// directions until either side goes away.
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    /// Create a new proxy with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The registry sessions are recorded in.
    pub fn registry(&self) -> Arc<dyn SessionRegistry> {
        Arc::clone(&self.config.registry)
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = (self.config.listen_host.as_str(), self.config.listen_port);
        TcpListener::bind(addr).await.with_context(|| {
            format!(
                "failed to bind {}:{}",
                self.config.listen_host, self.config.listen_port
            )
        })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves. Each
    /// connection is handled in its own Tokio task; a failing session never
    /// stops the accept loop.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().context("listener has no local address")?;
        tracing::info!(addr = %local_addr, upstream = %self.config.upstream.uri, "relay listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested; no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(%err, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let config = Arc::clone(&self.config);

                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, remote_addr, config).await {
                            tracing::warn!(%remote_addr, %err, "connection handler error");
                        }
                    });
                }
            }
        }
    }
}

/// Handle a single TCP connection from accept through relay and teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<ProxyConfig>,
) -> Result<(), SessionError> {
    let handshake_timeout = config.handshake_timeout;

    // ------------------------------------------------------------------
    // 1. Answer liveness probes before any WebSocket handling.
    // ------------------------------------------------------------------
    let request_head = tokio::time::timeout(handshake_timeout, health::peek_request_head(&stream))
        .await
        .map_err(|_| SessionError::HandshakeTimeout(handshake_timeout))??;

    if let Some(head) = request_head.filter(|head| head.is_liveness_probe()) {
        tracing::debug!(%remote_addr, "liveness probe");
        tokio::time::timeout(handshake_timeout, health::respond(stream, &head))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(handshake_timeout))??;
        return Ok(());
    }

    // ------------------------------------------------------------------
    // 2. Accept the WebSocket handshake, capturing the request target.
    // ------------------------------------------------------------------
    let captured_target: Arc<std::sync::Mutex<Option<String>>> =
        Arc::new(std::sync::Mutex::new(None));
    let captured_target_cb = Arc::clone(&captured_target);

    let callback =
        move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let target = req.uri().path_and_query().map(|pq| pq.as_str().to_string());
            if let Ok(mut guard) = captured_target_cb.lock() {
                *guard = target;
            }
            Ok(response)
        };

    let mut client_ws =
        tokio::time::timeout(handshake_timeout, tokio_tungstenite::accept_hdr_async(stream, callback))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(handshake_timeout))??;

    let ctx = SessionContext {
        session_id: uuid::Uuid::new_v4(),
        remote_addr,
    };
    let session_id = ctx.session_id;
    let registration = Registration::new(
        Arc::clone(&config.registry),
        SessionInfo::new(session_id, remote_addr),
    );

    tracing::info!(%session_id, %remote_addr, "new websocket connection");

    // ------------------------------------------------------------------
    // 3. Require an API key before touching the upstream.
    // ------------------------------------------------------------------
    let target = captured_target.lock().ok().and_then(|g| g.clone());
    let Some(api_key) = target.as_deref().and_then(credentials::extract_api_key) else {
        tracing::info!(%session_id, %remote_addr, "rejecting connection without api key");
        close::close_gracefully(&mut client_ws, close::api_key_required()).await;
        return Ok(());
    };

    // ------------------------------------------------------------------
    // 4. Dial the upstream once; any failure ends the session.
    // ------------------------------------------------------------------
    tracing::debug!(
        %session_id,
        upstream = %config.upstream.uri,
        %api_key,
        "connecting to upstream"
    );

    let upstream_ws = match upstream::connect(&config.upstream, &api_key).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::error!(
                %session_id,
                %remote_addr,
                status = ?err.status(),
                %err,
                "upstream connection failed"
            );
            close::close_gracefully(&mut client_ws, close::internal_error(&err.close_reason())).await;
            return Ok(());
        }
    };

    tracing::info!(%session_id, upstream = %config.upstream.uri, "connected to upstream");
    registration.set_state(SessionState::Relaying);

    // ------------------------------------------------------------------
    // 5. Relay until either leg ends.
    // ------------------------------------------------------------------
    let outcome = relay::run(&ctx, client_ws, upstream_ws).await;
    registration.set_state(SessionState::Closing);

    let message = match outcome.first {
        Direction::ClientToUpstream => "client disconnected",
        Direction::UpstreamToClient => "upstream disconnected",
    };
    tracing::info!(
        %session_id,
        %remote_addr,
        end = ?outcome.end,
        client_to_upstream = outcome.client_to_upstream,
        upstream_to_client = outcome.upstream_to_client,
        "{message}"
    );

    Ok(())
}
