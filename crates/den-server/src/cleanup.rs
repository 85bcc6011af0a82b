//! Delayed eviction of idle resources.
//!
//! Counts open relay connections per resource. When the count drops to zero
//! a delayed eviction task is armed; a reconnect cancels it. At expiry the
//! refcount is re-checked under the same lock used by connect/disconnect, so
//! a reconnect racing the timer is never lost. Provider failures during
//! eviction are retried a bounded number of times and never escalate: the
//! in-memory bookkeeping is cleaned up regardless.

use crate::provider::SessionProvider;
use crate::registry::SessionRegistry;
use crate::store::ChatStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STOP_ATTEMPTS: u32 = 2;
const REMOVE_ATTEMPTS: u32 = 3;

/// Tunables for the eviction pipeline.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How long a resource may sit with zero connections before eviction.
    pub delay: Duration,
    /// Pause between failed stop attempts.
    pub stop_backoff: Duration,
    /// Pause between failed remove attempts.
    pub remove_backoff: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(20 * 60),
            stop_backoff: Duration::from_secs(2),
            remove_backoff: Duration::from_secs(5),
        }
    }
}

struct TimerEntry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct CleanupState {
    refcounts: HashMap<String, usize>,
    timers: HashMap<String, TimerEntry>,
    next_generation: u64,
}

/// Connection-refcounted delayed-eviction scheduler.
///
/// Cheap to clone; clones share the same state (timer tasks hold one).
#[derive(Clone)]
pub struct CleanupScheduler {
    state: Arc<Mutex<CleanupState>>,
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn ChatStore>,
    registry: Arc<SessionRegistry>,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn ChatStore>,
        registry: Arc<SessionRegistry>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CleanupState::default())),
            provider,
            store,
            registry,
            config,
        }
    }

    /// A relay connected: bump the refcount and cancel any pending eviction.
    pub async fn on_connect(&self, resource_id: &str) {
        let mut state = self.state.lock().await;
        let count = state
            .refcounts
            .entry(resource_id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;
        if let Some(entry) = state.timers.remove(resource_id) {
            entry.token.cancel();
            info!(resource_id, "pending eviction cancelled by reconnect");
        }
        info!(resource_id, connections = count, "connection added");
    }

    /// A relay disconnected: drop the refcount; at zero, arm eviction.
    pub async fn on_disconnect(&self, resource_id: &str) {
        let mut state = self.state.lock().await;
        let count = match state.refcounts.get_mut(resource_id) {
            Some(c) => {
                *c = c.saturating_sub(1);
                *c
            }
            None => 0,
        };
        info!(resource_id, connections = count, "connection removed");
        if count == 0 {
            self.arm_timer(&mut state, resource_id);
        }
    }

    /// Explicitly cancel a pending eviction. Returns whether one existed.
    pub async fn cancel_cleanup(&self, resource_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.timers.remove(resource_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(resource_id, "pending eviction cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn connection_count(&self, resource_id: &str) -> usize {
        let state = self.state.lock().await;
        state.refcounts.get(resource_id).copied().unwrap_or(0)
    }

    pub async fn has_pending_eviction(&self, resource_id: &str) -> bool {
        let state = self.state.lock().await;
        state.timers.contains_key(resource_id)
    }

    fn arm_timer(&self, state: &mut CleanupState, resource_id: &str) {
        if let Some(prev) = state.timers.remove(resource_id) {
            prev.token.cancel();
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let token = CancellationToken::new();
        state.timers.insert(
            resource_id.to_string(),
            TimerEntry {
                generation,
                token: token.clone(),
            },
        );

        let scheduler = self.clone();
        let resource_id = resource_id.to_string();
        let delay = self.config.delay;
        info!(resource_id = %resource_id, delay_secs = delay.as_secs(), "eviction scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Once the delay elapses the eviction runs to completion;
                    // cancellation only wins during the sleep.
                    scheduler.execute_eviction(&resource_id, generation).await;
                }
            }
        });
    }

    /// Runs at timer expiry. The refcount re-check under the state lock is
    /// what closes the reconnect race.
    async fn execute_eviction(&self, resource_id: &str, generation: u64) {
        {
            let mut state = self.state.lock().await;
            // A newer timer may have been armed while this one waited on the
            // lock; only the current one may act.
            match state.timers.get(resource_id) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            if state.refcounts.get(resource_id).copied().unwrap_or(0) > 0 {
                state.timers.remove(resource_id);
                info!(resource_id, "eviction aborted, a connection returned");
                return;
            }
            state.timers.remove(resource_id);
            state.refcounts.remove(resource_id);
        }

        info!(resource_id, "evicting idle resource");

        for attempt in 1..=STOP_ATTEMPTS {
            match self.provider.stop(resource_id).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(resource_id, attempt, error = %e, "stop attempt failed");
                    if attempt < STOP_ATTEMPTS {
                        tokio::time::sleep(self.config.stop_backoff).await;
                    }
                }
            }
        }

        let mut removed = false;
        for attempt in 1..=REMOVE_ATTEMPTS {
            match self.provider.remove(resource_id).await {
                Ok(()) => {
                    removed = true;
                    info!(resource_id, "resource removed");
                    break;
                }
                Err(e) => {
                    warn!(resource_id, attempt, error = %e, "remove attempt failed");
                    if attempt < REMOVE_ATTEMPTS {
                        tokio::time::sleep(self.config.remove_backoff).await;
                    }
                }
            }
        }
        if !removed {
            warn!(resource_id, "eviction incomplete after retries");
        }

        if let Err(e) = self
            .store
            .update_resource_status(resource_id, "removed")
            .await
        {
            warn!(resource_id, error = %e, "status update failed");
        }

        // The session must never outlive its eviction trigger, even when the
        // provider keeps failing.
        self.registry.unregister(resource_id).await;
    }
}
