use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tweetstream_core::SessionId;

use crate::sink::Transport;

#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub transport: Transport,
    pub started_at: DateTime<Utc>,
}

/// Active sessions, touched only when a session starts or finishes.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, id: SessionId, transport: Transport) -> Registration {
        let info = SessionInfo {
            id: id.clone(),
            transport,
            started_at: Utc::now(),
        };
        self.sessions.insert(id.clone(), info);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

/// Removes its session from the registry on drop.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.id);
    }
}
