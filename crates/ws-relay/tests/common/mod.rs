//! Loopback fixtures: a scriptable mock upstream and a relay on an ephemeral
//! port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ws_relay::{InMemoryRegistry, Proxy, ProxyConfig, SessionRegistry, UpstreamConfig};

pub type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type UpstreamSide = WebSocketStream<TcpStream>;

/// How the mock upstream answers upgrade requests.
#[derive(Clone, Copy)]
pub enum UpstreamMode {
    Accept,
    Reject(StatusCode),
}

/// A mock upstream that hands each accepted session to the test.
pub struct MockUpstream {
    pub addr: SocketAddr,
    /// Number of TCP connections the upstream has seen.
    pub dials: Arc<AtomicUsize>,
    /// `Authorization` header of the most recent upgrade request.
    pub last_authorization: Arc<Mutex<Option<String>>>,
    /// `Content-Type` header of the most recent upgrade request.
    pub last_content_type: Arc<Mutex<Option<String>>>,
    sessions: mpsc::UnboundedReceiver<UpstreamSide>,
}

impl MockUpstream {
    pub async fn start(mode: UpstreamMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dials = Arc::new(AtomicUsize::new(0));
        let last_authorization = Arc::new(Mutex::new(None));
        let last_content_type = Arc::new(Mutex::new(None));
        let (tx, sessions) = mpsc::unbounded_channel();

        let dials_task = Arc::clone(&dials);
        let auth_task = Arc::clone(&last_authorization);
        let ctype_task = Arc::clone(&last_content_type);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                dials_task.fetch_add(1, Ordering::SeqCst);

                let auth = Arc::clone(&auth_task);
                let ctype = Arc::clone(&ctype_task);
                let callback = move |req: &HsRequest,
                                     response: HsResponse|
                      -> Result<HsResponse, ErrorResponse> {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    *auth.lock().unwrap() = header("authorization");
                    *ctype.lock().unwrap() = header("content-type");

                    match mode {
                        UpstreamMode::Accept => Ok(response),
                        UpstreamMode::Reject(status) => {
                            let mut err = ErrorResponse::new(Some("rejected".to_string()));
                            *err.status_mut() = status;
                            Err(err)
                        }
                    }
                };

                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    let _ = tx.send(ws);
                }
            }
        });

        Self {
            addr,
            dials,
            last_authorization,
            last_content_type,
            sessions,
        }
    }

    pub fn uri(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    /// Wait for the next session the relay opens upstream.
    pub async fn next_session(&mut self) -> UpstreamSide {
        tokio::time::timeout(Duration::from_secs(5), self.sessions.recv())
            .await
            .expect("relay never connected upstream")
            .expect("mock upstream stopped")
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

/// A relay serving on an ephemeral loopback port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<InMemoryRegistry>,
}

impl TestRelay {
    pub async fn start(upstream_uri: String) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        let config = ProxyConfig {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            upstream: UpstreamConfig {
                uri: upstream_uri,
                connect_timeout: Duration::from_secs(2),
                ..UpstreamConfig::default()
            },
            handshake_timeout: Duration::from_secs(2),
            registry: registry.clone(),
        };
        let proxy = Proxy::new(config);
        let listener = proxy.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            proxy
                .serve(listener, std::future::pending())
                .await
                .unwrap();
        });

        Self { addr, registry }
    }

    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/realtime{}", self.addr, query)
    }

    pub async fn connect(&self, query: &str) -> ClientWs {
        let (ws, _) = tokio_tungstenite::connect_async(self.url(query)).await.unwrap();
        ws
    }

    /// Poll the registry until it reports `expected` active sessions.
    pub async fn wait_for_active(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let active = self.registry.snapshot().active();
            if active == expected {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("registry has {active} sessions, expected {expected}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Next non-control message, failing the test after five seconds.
pub async fn next_message<S>(ws: &mut WebSocketStream<S>) -> Message
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let fut = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => return msg,
                other => panic!("expected a message, got {other:?}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for a message")
}

/// Read until the stream is done so the close handshake completes.
pub async fn drain<S>(ws: &mut WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let fut = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(Duration::from_secs(5), fut).await;
}

/// Send a text frame.
pub async fn send_text<S>(ws: &mut WebSocketStream<S>, text: &str)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    ws.send(Message::text(text.to_string())).await.unwrap();
}
