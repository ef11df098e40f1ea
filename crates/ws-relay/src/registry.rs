use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Lifecycle of a session as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade accepted; credential check or upstream dial in progress.
    Connecting,
    /// Both legs established and forwarding.
    Relaying,
    /// A leg has ended and the session is tearing down.
    Closing,
}

/// Diagnostic record for one active session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
}

impl SessionInfo {
    /// A freshly accepted session in the `Connecting` state.
    pub fn new(id: Uuid, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            state: SessionState::Connecting,
            opened_at: Utc::now(),
        }
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub sessions: Vec<SessionInfo>,
}

impl RegistrySnapshot {
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|s| s.id).collect()
    }
}

/// Process-wide bookkeeping of active sessions.
///
/// Used for diagnostics only; relaying never reads from it. Implementations
/// must tolerate concurrent calls from independent sessions.
pub trait SessionRegistry: Send + Sync {
    fn insert(&self, info: SessionInfo);
    fn set_state(&self, id: Uuid, state: SessionState);
    fn remove(&self, id: Uuid) -> Option<SessionInfo>;
    fn snapshot(&self) -> RegistrySnapshot;
}

/// Concurrent in-memory registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    sessions: DashMap<Uuid, SessionInfo>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn insert(&self, info: SessionInfo) {
        self.sessions.insert(info.id, info);
    }

    fn set_state(&self, id: Uuid, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.state = state;
        }
    }

    fn remove(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.remove(&id).map(|(_, info)| info)
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|s| s.opened_at);
        RegistrySnapshot { sessions }
    }
}

/// Registry that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl SessionRegistry for NoopRegistry {
    fn insert(&self, _info: SessionInfo) {}

    fn set_state(&self, _id: Uuid, _state: SessionState) {}

    fn remove(&self, _id: Uuid) -> Option<SessionInfo> {
        None
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::default()
    }
}

/// Registry entry owned by a session; removes itself when dropped, so every
/// exit path (including panics) deregisters the session.
pub struct Registration {
    registry: Arc<dyn SessionRegistry>,
    id: Uuid,
}

impl Registration {
    pub fn new(registry: Arc<dyn SessionRegistry>, info: SessionInfo) -> Self {
        let id = info.id;
        registry.insert(info);
        Self { registry, id }
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.set_state(self.id, state);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
