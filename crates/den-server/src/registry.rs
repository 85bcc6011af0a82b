//! Session registry: the concurrent map of live session state.
//!
//! Everything the lobby shows or the relays touch (snapshots, pins, helpers,
//! pending invites) lives here. Access goes only through the operations
//! below — reads run concurrently, writes are exclusive. Mutating an absent
//! session returns `false`; callers treat that as a race that already
//! resolved itself and carry on.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// State for one active shell resource.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub resource_id: String,
    /// Username of the owning user.
    pub owner: String,
    /// Display name (nickname).
    pub name: String,
    pub os: String,
    pub avatar: String,
    /// Most recent raw output window, control sequences included.
    pub raw_snapshot: String,
    /// Control-sequence-stripped fallback window.
    pub clean_snapshot: String,
    /// Usernames that pinned this session (set semantics).
    pub pinned_by: Vec<String>,
    /// Usernames currently allowed to co-drive this session.
    pub helpers: Vec<String>,
    /// At most one outstanding invitee.
    pub pending_invite: Option<String>,
}

impl Session {
    pub fn pin_count(&self) -> usize {
        self.pinned_by.len()
    }
}

/// Concurrent map from resource id to [`Session`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session. Idempotent.
    pub async fn register(&self, resource_id: &str, session: Session) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(resource_id.to_string(), session);
        info!(resource_id, total = sessions.len(), "session registered");
    }

    /// Remove a session. No-op if absent.
    pub async fn unregister(&self, resource_id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(resource_id).is_some() {
            info!(resource_id, remaining = sessions.len(), "session unregistered");
        }
    }

    /// Overwrite both snapshot windows. No-op if the session is gone — a
    /// relay racing a disconnect is expected, not an error.
    pub async fn update_snapshot(&self, resource_id: &str, raw: String, clean: String) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(resource_id) {
            s.raw_snapshot = raw;
            s.clean_snapshot = clean;
        }
    }

    /// Add a pin. False if the session is absent or the user already pinned.
    pub async fn pin(&self, resource_id: &str, username: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(resource_id) else {
            return false;
        };
        if s.pinned_by.iter().any(|u| u == username) {
            return false;
        }
        s.pinned_by.push(username.to_string());
        true
    }

    /// Remove a pin. False if the session is absent or the user never pinned.
    pub async fn unpin(&self, resource_id: &str, username: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(resource_id) else {
            return false;
        };
        let before = s.pinned_by.len();
        s.pinned_by.retain(|u| u != username);
        s.pinned_by.len() != before
    }

    /// Add a helper and clear the pending invite. False if already a helper
    /// or the session is absent.
    pub async fn add_helper(&self, resource_id: &str, username: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(resource_id) else {
            return false;
        };
        if s.helpers.iter().any(|u| u == username) {
            return false;
        }
        s.helpers.push(username.to_string());
        s.pending_invite = None;
        true
    }

    /// Remove a helper. False if absent either way.
    pub async fn remove_helper(&self, resource_id: &str, username: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(resource_id) else {
            return false;
        };
        let before = s.helpers.len();
        s.helpers.retain(|u| u != username);
        s.helpers.len() != before
    }

    pub async fn is_helper(&self, resource_id: &str, username: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(resource_id)
            .map(|s| s.helpers.iter().any(|u| u == username))
            .unwrap_or(false)
    }

    pub async fn set_pending_invite(&self, resource_id: &str, invitee: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(resource_id) else {
            return false;
        };
        s.pending_invite = Some(invitee.to_string());
        true
    }

    pub async fn clear_pending_invite(&self, resource_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(resource_id) {
            s.pending_invite = None;
        }
    }

    pub async fn clear_all_helpers(&self, resource_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(resource_id) {
            s.helpers.clear();
        }
    }

    /// Find the session owned by a username.
    pub async fn find_by_owner(&self, username: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.values().find(|s| s.owner == username).cloned()
    }

    pub async fn get(&self, resource_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(resource_id).cloned()
    }

    /// Snapshot copies of all sessions, in no particular order.
    pub async fn list_all(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
