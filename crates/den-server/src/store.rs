//! Persistence interface: chat history, connection accounting, resource
//! status.
//!
//! Durable storage lives behind [`ChatStore`]; the server never touches a
//! database directly. [`MemoryStore`] is the in-tree implementation — a
//! bounded chat ring plus online-time bookkeeping — and doubles as the test
//! double.

use async_trait::async_trait;
use den_core::{ChatRecord, DenResult};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

/// Storage operations the lobby and relays need.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist one chat message (display name, avatar, content, kind).
    async fn save_chat_message(
        &self,
        name: &str,
        avatar: &str,
        content: &str,
        kind: &str,
    ) -> DenResult<()>;

    /// Most recent messages, oldest first, at most `limit`.
    async fn recent_messages(&self, limit: usize) -> DenResult<Vec<ChatRecord>>;

    /// Mark a user connected (online-time accounting).
    async fn record_connect(&self, username: &str, avatar: &str) -> DenResult<()>;

    /// Mark a user disconnected and credit their online time.
    async fn record_disconnect(&self, username: &str) -> DenResult<()>;

    /// Update a resource's persisted status (e.g. "removed"). Best-effort.
    async fn update_resource_status(&self, resource_id: &str, status: &str) -> DenResult<()>;
}

struct StoredMessage {
    user: String,
    content: String,
    ts: i64,
}

#[derive(Default)]
struct OnlineEntry {
    avatar: String,
    connected_at: Option<Instant>,
    total: Duration,
}

#[derive(Default)]
struct MemoryInner {
    messages: VecDeque<StoredMessage>,
    online: HashMap<String, OnlineEntry>,
    resource_status: HashMap<String, String>,
}

/// In-memory [`ChatStore`] with a bounded message window.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_messages: usize,
}

impl MemoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            max_messages,
        }
    }

    /// Accumulated online time for a user (testing/leaderboard hook).
    pub async fn online_total(&self, username: &str) -> Duration {
        let inner = self.inner.lock().await;
        inner
            .online
            .get(username)
            .map(|e| e.total)
            .unwrap_or_default()
    }

    /// Last persisted status for a resource.
    pub async fn resource_status(&self, resource_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.resource_status.get(resource_id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_chat_message(
        &self,
        name: &str,
        _avatar: &str,
        content: &str,
        _kind: &str,
    ) -> DenResult<()> {
        let mut inner = self.inner.lock().await;
        inner.messages.push_back(StoredMessage {
            user: name.to_string(),
            content: content.to_string(),
            ts: unix_now(),
        });
        while inner.messages.len() > self.max_messages {
            inner.messages.pop_front();
        }
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> DenResult<Vec<ChatRecord>> {
        let inner = self.inner.lock().await;
        let skip = inner.messages.len().saturating_sub(limit);
        Ok(inner
            .messages
            .iter()
            .skip(skip)
            .map(|m| ChatRecord {
                user: m.user.clone(),
                content: m.content.clone(),
                ts: m.ts.to_string(),
            })
            .collect())
    }

    async fn record_connect(&self, username: &str, avatar: &str) -> DenResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.online.entry(username.to_string()).or_default();
        entry.avatar = avatar.to_string();
        entry.connected_at = Some(Instant::now());
        Ok(())
    }

    async fn record_disconnect(&self, username: &str) -> DenResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.online.get_mut(username) {
            if let Some(started) = entry.connected_at.take() {
                entry.total += started.elapsed();
            }
        }
        Ok(())
    }

    async fn update_resource_status(&self, resource_id: &str, status: &str) -> DenResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .resource_status
            .insert(resource_id.to_string(), status.to_string());
        debug!(resource_id, status, "resource status updated");
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
