//! Transparent WebSocket relay in front of an upstream realtime speech API.
//!
//! Clients connect with their API key in the query string; the relay dials
//! the upstream with that key as a bearer credential and forwards frames in
//! both directions without looking at them.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-relay  <--WS-->  Upstream
//!  ?api_key=KEY        |        Authorization: Bearer KEY
//!                 [Registry]
//! ```
//!
//! Each accepted connection is handled by its own task. A `GET /health`
//! request is answered before any upgrade. Otherwise the upgrade is accepted,
//! the API key is checked (close `4000` if missing), the upstream is dialed
//! once (close `1011` on failure), and two forwarding tasks relay frames until
//! either leg ends, at which point both legs are closed.

pub mod close;
pub mod credentials;
pub mod health;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod upstream;

// Re-export the primary public types at the crate root for convenience.
pub use credentials::{extract_api_key, ApiKey};
pub use listener::{Proxy, ProxyConfig, SessionError};
pub use registry::{
    InMemoryRegistry, NoopRegistry, RegistrySnapshot, SessionInfo, SessionRegistry, SessionState,
};
pub use relay::{Direction, ForwardEnd, RelayOutcome, SessionContext};
pub use upstream::{UpstreamConfig, UpstreamError};
