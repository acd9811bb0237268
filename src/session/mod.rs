//! Session ownership: the per-subject registry and the WebSocket handler.

pub mod frames;
mod ws;

pub use ws::{device_ws, SessionDeps};

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle to one live relay session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub cancel: CancellationToken,
}

/// Process-wide map of subject id → live session. At most one session per
/// subject: a new registration displaces the old one.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<i64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session for a subject. Any prior session is displaced: its
    /// cancellation token is tripped (its tasks observe it and close the
    /// transport) before the new handle is stored.
    pub async fn register(&self, subject_id: i64, handle: SessionHandle) {
        let mut sessions = self.inner.write().await;
        if let Some(existing) = sessions.insert(subject_id, handle) {
            info!(subject_id, "Displacing existing session");
            existing.cancel.cancel();
        }
    }

    /// Remove a session on teardown, but only if the registry still holds
    /// this exact session, so a displaced session cannot evict its
    /// replacement.
    pub async fn remove_if(&self, subject_id: i64, session_id: &str) -> bool {
        let mut sessions = self.inner.write().await;
        match sessions.get(&subject_id) {
            Some(handle) if handle.session_id == session_id => {
                sessions.remove(&subject_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_active(&self, subject_id: i64) -> bool {
        self.inner.read().await.contains_key(&subject_id)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
