//! Lobby coordinator: observers, periodic snapshot fan-out, and the
//! invite/helper handshake.
//!
//! Every lobby connection registers an observer with a bounded outbound
//! channel. Broadcasts never await an observer — a full or closed channel
//! gets the observer dropped and logged. All handshake operations lean on
//! the registry's boolean returns, so duplicate messages are harmless
//! no-ops.

use crate::registry::SessionRegistry;
use crate::store::ChatStore;
use crate::transport::ClientIdentity;
use den_core::{LobbyMessage, SessionEntry};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound queue depth per observer; slow observers get dropped, not
/// awaited.
const OBSERVER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub invite_cooldown: Duration,
    pub broadcast_interval: Duration,
    pub history_limit: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            invite_cooldown: Duration::from_secs(30),
            broadcast_interval: Duration::from_secs(3),
            history_limit: 500,
        }
    }
}

struct Observer {
    username: String,
    tx: mpsc::Sender<LobbyMessage>,
}

pub struct LobbyCoordinator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChatStore>,
    observers: RwLock<HashMap<u64, Observer>>,
    next_observer_id: AtomicU64,
    /// Inviter username -> time of their last invite.
    cooldowns: Mutex<HashMap<String, Instant>>,
    config: LobbyConfig,
}

impl LobbyCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn ChatStore>,
        config: LobbyConfig,
    ) -> Self {
        Self {
            registry,
            store,
            observers: RwLock::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
            cooldowns: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Periodic session-snapshot fan-out.
    pub fn spawn_broadcaster(self: Arc<Self>) -> JoinHandle<()> {
        let lobby = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(lobby.config.broadcast_interval);
            loop {
                tick.tick().await;
                if lobby.registry.count().await == 0 {
                    continue;
                }
                let (count, sessions) = lobby.session_entries().await;
                lobby
                    .broadcast(LobbyMessage::Snapshots { count, sessions })
                    .await;
            }
        })
    }

    /// Drive one lobby connection to completion.
    pub async fn handle(self: Arc<Self>, ws: WebSocketStream<TcpStream>, who: ClientIdentity) {
        let (observer_id, tx, mut inbox) = self.attach_observer(&who).await;
        let count = self.observer_count().await;
        info!(username = %who.username, online = count, "lobby joined");
        self.broadcast(LobbyMessage::Join {
            user: who.username.clone(),
            count,
        })
        .await;

        // Initial session list, then chat history, straight to this observer.
        let (session_count, sessions) = self.session_entries().await;
        let _ = tx
            .send(LobbyMessage::Snapshots {
                count: session_count,
                sessions,
            })
            .await;
        match self.store.recent_messages(self.config.history_limit).await {
            Ok(messages) if !messages.is_empty() => {
                let _ = tx.send(LobbyMessage::History { messages }).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "chat history fetch failed"),
        }

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(Message::Text(msg.encode())).await.is_err() {
                        break;
                    }
                }

                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match LobbyMessage::decode(&text) {
                                Some(msg) => self.handle_message(&who, msg, &tx).await,
                                None => debug!(username = %who.username, "malformed lobby frame dropped"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(username = %who.username, error = %e, "lobby read ended");
                            break;
                        }
                    }
                }
            }
        }

        self.detach_observer(observer_id).await;
        let count = self.observer_count().await;
        self.broadcast(LobbyMessage::Leave {
            user: who.username.clone(),
            count,
        })
        .await;
        info!(username = %who.username, online = count, "lobby left");
    }

    /// Register an observer; returns its id, sender, and inbox.
    pub async fn attach_observer(
        &self,
        who: &ClientIdentity,
    ) -> (u64, mpsc::Sender<LobbyMessage>, mpsc::Receiver<LobbyMessage>) {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let mut observers = self.observers.write().await;
        observers.insert(
            id,
            Observer {
                username: who.username.clone(),
                tx: tx.clone(),
            },
        );
        (id, tx, rx)
    }

    pub async fn detach_observer(&self, observer_id: u64) {
        let mut observers = self.observers.write().await;
        observers.remove(&observer_id);
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Fan a message out to every observer without awaiting any of them.
    pub async fn broadcast(&self, msg: LobbyMessage) {
        let mut dead = Vec::new();
        {
            let observers = self.observers.read().await;
            for (id, obs) in observers.iter() {
                if obs.tx.try_send(msg.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut observers = self.observers.write().await;
            for id in dead {
                if let Some(obs) = observers.remove(&id) {
                    warn!(username = %obs.username, "dropping unresponsive lobby observer");
                }
            }
        }
    }

    /// Current sessions sorted for display: pin count descending, then owner
    /// ascending, ranks assigned 1..N.
    pub async fn session_entries(&self) -> (usize, Vec<SessionEntry>) {
        let sessions = self.registry.list_all().await;
        let count = sessions.len();
        let mut entries: Vec<SessionEntry> = sessions
            .into_iter()
            .map(|s| {
                let pin_count = s.pin_count();
                SessionEntry {
                    rank: 0,
                    resource_id: s.resource_id,
                    username: s.owner,
                    name: s.name,
                    os: s.os,
                    avatar: s.avatar,
                    snapshot: s.clean_snapshot,
                    raw_snapshot: s.raw_snapshot,
                    pin_count,
                    helpers: s.helpers,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.pin_count
                .cmp(&a.pin_count)
                .then_with(|| a.username.cmp(&b.username))
        });
        for (i, e) in entries.iter_mut().enumerate() {
            e.rank = i + 1;
        }
        (count, entries)
    }

    /// Dispatch one inbound message. `reply` reaches only the sender.
    pub async fn handle_message(
        &self,
        who: &ClientIdentity,
        msg: LobbyMessage,
        reply: &mpsc::Sender<LobbyMessage>,
    ) {
        match msg {
            LobbyMessage::Chat { content, .. } => {
                if content.is_empty() {
                    return;
                }
                if let Err(e) = self
                    .store
                    .save_chat_message(&who.name, &who.avatar, &content, "text")
                    .await
                {
                    warn!(error = %e, "chat persist failed");
                }
                self.broadcast(LobbyMessage::Chat {
                    user: who.name.clone(),
                    user_name: who.username.clone(),
                    content,
                    ts: unix_now(),
                })
                .await;
            }

            LobbyMessage::Like {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                let target_username = self.owner_of(&target_resource_id).await;
                self.broadcast(LobbyMessage::Like {
                    user: who.username.clone(),
                    target_resource_id,
                    target_username,
                    ts: unix_now(),
                })
                .await;
            }

            LobbyMessage::Pin {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                if self.registry.pin(&target_resource_id, &who.username).await {
                    let target_username = self.owner_of(&target_resource_id).await;
                    info!(username = %who.username, resource_id = %target_resource_id, "session pinned");
                    self.broadcast(LobbyMessage::Pin {
                        user: who.username.clone(),
                        target_resource_id,
                        target_username,
                        ts: unix_now(),
                    })
                    .await;
                }
            }

            LobbyMessage::Unpin {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                if self
                    .registry
                    .unpin(&target_resource_id, &who.username)
                    .await
                {
                    self.broadcast(LobbyMessage::Unpin {
                        user: who.username.clone(),
                        target_resource_id,
                        ts: unix_now(),
                    })
                    .await;
                }
            }

            LobbyMessage::Invite { invite_to, .. } => {
                self.handle_invite(who, invite_to, reply).await;
            }

            LobbyMessage::InviteAccept {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                if self
                    .registry
                    .add_helper(&target_resource_id, &who.username)
                    .await
                {
                    let owner = self.owner_of(&target_resource_id).await;
                    info!(helper = %who.username, owner = %owner, "invite accepted");
                    self.broadcast(LobbyMessage::InviteAccept {
                        user: who.username.clone(),
                        target_resource_id,
                        target_username: owner.clone(),
                        ts: unix_now(),
                    })
                    .await;
                    self.system_notice(format!("{} is now helping {}", who.username, owner))
                        .await;
                }
            }

            LobbyMessage::InviteReject {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                self.registry.clear_pending_invite(&target_resource_id).await;
                let owner = self.owner_of(&target_resource_id).await;
                self.broadcast(LobbyMessage::InviteReject {
                    user: who.username.clone(),
                    target_resource_id: target_resource_id.clone(),
                    target_username: owner.clone(),
                    ts: unix_now(),
                })
                .await;
                // Directed notification; the inviter's client matches on
                // targetUsername.
                self.broadcast(LobbyMessage::InviteRejectedNotify {
                    user: who.username.clone(),
                    target_username: owner,
                    content: format!("{} declined the invite", who.username),
                    target_resource_id,
                    ts: unix_now(),
                })
                .await;
            }

            LobbyMessage::ControlRevoke {
                target_username, ..
            } => {
                if target_username.is_empty() {
                    return;
                }
                let Some(session) = self.registry.find_by_owner(&who.username).await else {
                    return;
                };
                if self
                    .registry
                    .remove_helper(&session.resource_id, &target_username)
                    .await
                {
                    info!(owner = %who.username, helper = %target_username, "helper access revoked");
                    self.broadcast(LobbyMessage::ControlRevoke {
                        user: who.username.clone(),
                        target_resource_id: session.resource_id,
                        target_username,
                        ts: unix_now(),
                    })
                    .await;
                }
            }

            LobbyMessage::HelperLeave {
                target_resource_id, ..
            } => {
                if target_resource_id.is_empty() {
                    return;
                }
                if self
                    .registry
                    .remove_helper(&target_resource_id, &who.username)
                    .await
                {
                    let owner = self.owner_of(&target_resource_id).await;
                    self.broadcast(LobbyMessage::HelperLeave {
                        user: who.username.clone(),
                        target_resource_id,
                        target_username: owner,
                        ts: unix_now(),
                    })
                    .await;
                }
            }

            LobbyMessage::OwnerCancel { .. } => {
                let Some(session) = self.registry.find_by_owner(&who.username).await else {
                    return;
                };
                self.registry.clear_pending_invite(&session.resource_id).await;
                self.registry.clear_all_helpers(&session.resource_id).await;
                info!(owner = %who.username, "invite/helpers cancelled");
                self.broadcast(LobbyMessage::OwnerCancel {
                    user: who.username.clone(),
                    target_resource_id: session.resource_id,
                    content: format!("{} ended assisted control", who.username),
                    ts: unix_now(),
                })
                .await;
            }

            // Server-generated types arriving from a client are dropped.
            _ => {}
        }
    }

    async fn handle_invite(
        &self,
        who: &ClientIdentity,
        invite_to: String,
        reply: &mpsc::Sender<LobbyMessage>,
    ) {
        if invite_to.is_empty() {
            return;
        }

        let remaining = {
            let cooldowns = self.cooldowns.lock().await;
            cooldowns
                .get(&who.username)
                .and_then(|last| self.config.invite_cooldown.checked_sub(last.elapsed()))
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };
        if remaining > 0 {
            info!(username = %who.username, remaining, "invite blocked by cooldown");
            let _ = reply
                .send(LobbyMessage::InviteError {
                    user: who.username.clone(),
                    content: "invite cooldown active, try again shortly".into(),
                    cooldown_remaining: remaining,
                    ts: unix_now(),
                })
                .await;
            return;
        }

        let Some(session) = self.registry.find_by_owner(&who.username).await else {
            warn!(username = %who.username, "invite without an active session");
            return;
        };

        {
            let mut cooldowns = self.cooldowns.lock().await;
            cooldowns.insert(who.username.clone(), Instant::now());
        }
        self.registry
            .set_pending_invite(&session.resource_id, &invite_to)
            .await;

        let _ = reply
            .send(LobbyMessage::InviteSent {
                user: who.username.clone(),
                invite_to: invite_to.clone(),
                target_resource_id: session.resource_id.clone(),
                content: format!("invite sent, waiting for {invite_to}"),
                ts: unix_now(),
            })
            .await;

        // Broadcast to everyone; the invitee's client filters by identity.
        self.broadcast(LobbyMessage::Invite {
            invite_from: who.username.clone(),
            invite_to: invite_to.clone(),
            target_resource_id: session.resource_id.clone(),
            ts: unix_now(),
        })
        .await;
        self.system_notice(format!(
            "{} invited {} to co-drive their terminal",
            who.username, invite_to
        ))
        .await;

        info!(from = %who.username, to = %invite_to, "invite sent");
    }

    async fn owner_of(&self, resource_id: &str) -> String {
        self.registry
            .get(resource_id)
            .await
            .map(|s| s.owner)
            .unwrap_or_default()
    }

    async fn system_notice(&self, content: String) {
        self.broadcast(LobbyMessage::Chat {
            user: "System".into(),
            user_name: String::new(),
            content,
            ts: unix_now(),
        })
        .await;
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Session;
    use crate::store::MemoryStore;

    fn identity(username: &str) -> ClientIdentity {
        ClientIdentity {
            username: username.into(),
            name: username.into(),
            avatar: format!("http://avatars/{username}"),
            os: "alpine".into(),
        }
    }

    fn session(resource_id: &str, owner: &str) -> Session {
        Session {
            resource_id: resource_id.into(),
            owner: owner.into(),
            name: owner.into(),
            ..Default::default()
        }
    }

    struct Fixture {
        lobby: Arc<LobbyCoordinator>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryStore::default());
        let lobby = Arc::new(LobbyCoordinator::new(
            registry.clone(),
            store,
            LobbyConfig::default(),
        ));
        Fixture { lobby, registry }
    }

    fn drain(rx: &mut mpsc::Receiver<LobbyMessage>) -> Vec<LobbyMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn invite_flow_with_cooldown() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;

        let alice = identity("alice");
        let (_id_a, tx_a, mut rx_a) = f.lobby.attach_observer(&alice).await;
        let bob = identity("bob");
        let (_id_b, _tx_b, mut rx_b) = f.lobby.attach_observer(&bob).await;

        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::Invite {
                    invite_from: String::new(),
                    invite_to: "bob".into(),
                    target_resource_id: String::new(),
                    ts: 0,
                },
                &tx_a,
            )
            .await;

        let alice_msgs = drain(&mut rx_a);
        assert!(alice_msgs
            .iter()
            .any(|m| matches!(m, LobbyMessage::InviteSent { invite_to, .. } if invite_to == "bob")));
        let bob_msgs = drain(&mut rx_b);
        assert!(bob_msgs.iter().any(|m| matches!(
            m,
            LobbyMessage::Invite { invite_from, invite_to, .. }
                if invite_from == "alice" && invite_to == "bob"
        )));
        // Everyone also sees the system notice.
        assert!(bob_msgs
            .iter()
            .any(|m| matches!(m, LobbyMessage::Chat { user, .. } if user == "System")));
        assert_eq!(
            f.registry.get("r1").await.unwrap().pending_invite.as_deref(),
            Some("bob")
        );

        // Second invite inside the window is rejected with the remaining
        // seconds, and only the inviter hears about it.
        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::Invite {
                    invite_from: String::new(),
                    invite_to: "carol".into(),
                    target_resource_id: String::new(),
                    ts: 0,
                },
                &tx_a,
            )
            .await;
        let alice_msgs = drain(&mut rx_a);
        assert!(alice_msgs.iter().any(|m| matches!(
            m,
            LobbyMessage::InviteError { cooldown_remaining, .. } if *cooldown_remaining > 0
        )));
        assert!(drain(&mut rx_b).is_empty());

        // After the window passes the next invite goes through.
        tokio::time::sleep(Duration::from_secs(31)).await;
        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::Invite {
                    invite_from: String::new(),
                    invite_to: "carol".into(),
                    target_resource_id: String::new(),
                    ts: 0,
                },
                &tx_a,
            )
            .await;
        assert!(drain(&mut rx_a)
            .iter()
            .any(|m| matches!(m, LobbyMessage::InviteSent { invite_to, .. } if invite_to == "carol")));
    }

    #[tokio::test]
    async fn invite_requires_an_active_session() {
        let f = fixture();
        let alice = identity("alice");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&alice).await;
        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::Invite {
                    invite_from: String::new(),
                    invite_to: "bob".into(),
                    target_resource_id: String::new(),
                    ts: 0,
                },
                &tx,
            )
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn accept_adds_helper_and_is_idempotent() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;
        f.registry.set_pending_invite("r1", "bob").await;

        let bob = identity("bob");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&bob).await;

        let accept = LobbyMessage::InviteAccept {
            user: String::new(),
            target_resource_id: "r1".into(),
            target_username: String::new(),
            ts: 0,
        };
        f.lobby.handle_message(&bob, accept.clone(), &tx).await;

        assert!(f.registry.is_helper("r1", "bob").await);
        assert!(f.registry.get("r1").await.unwrap().pending_invite.is_none());
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            LobbyMessage::InviteAccept { user, target_username, .. }
                if user == "bob" && target_username == "alice"
        )));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, LobbyMessage::Chat { user, .. } if user == "System")));

        // Accepting again changes nothing and broadcasts nothing.
        f.lobby.handle_message(&bob, accept, &tx).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn reject_clears_invite_and_notifies_inviter() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;
        f.registry.set_pending_invite("r1", "bob").await;

        let bob = identity("bob");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&bob).await;
        f.lobby
            .handle_message(
                &bob,
                LobbyMessage::InviteReject {
                    user: String::new(),
                    target_resource_id: "r1".into(),
                    target_username: String::new(),
                    ts: 0,
                },
                &tx,
            )
            .await;

        assert!(f.registry.get("r1").await.unwrap().pending_invite.is_none());
        let msgs = drain(&mut rx);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, LobbyMessage::InviteReject { user, .. } if user == "bob")));
        assert!(msgs.iter().any(|m| matches!(
            m,
            LobbyMessage::InviteRejectedNotify { target_username, .. } if target_username == "alice"
        )));
    }

    #[tokio::test]
    async fn pin_broadcasts_only_on_state_change() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;

        let bob = identity("bob");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&bob).await;

        let pin = LobbyMessage::Pin {
            user: String::new(),
            target_resource_id: "r1".into(),
            target_username: String::new(),
            ts: 0,
        };
        f.lobby.handle_message(&bob, pin.clone(), &tx).await;
        assert_eq!(drain(&mut rx).len(), 1);

        // Double pin: no state change, no broadcast.
        f.lobby.handle_message(&bob, pin, &tx).await;
        assert!(drain(&mut rx).is_empty());

        f.lobby
            .handle_message(
                &bob,
                LobbyMessage::Unpin {
                    user: String::new(),
                    target_resource_id: "r1".into(),
                    ts: 0,
                },
                &tx,
            )
            .await;
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(f.registry.get("r1").await.unwrap().pin_count(), 0);
    }

    #[tokio::test]
    async fn owner_cancel_clears_invite_and_helpers() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;
        f.registry.set_pending_invite("r1", "bob").await;
        f.registry.add_helper("r1", "carol").await;

        let alice = identity("alice");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&alice).await;
        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::OwnerCancel {
                    user: String::new(),
                    target_resource_id: String::new(),
                    content: String::new(),
                    ts: 0,
                },
                &tx,
            )
            .await;

        let s = f.registry.get("r1").await.unwrap();
        assert!(s.pending_invite.is_none());
        assert!(s.helpers.is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, LobbyMessage::OwnerCancel { user, .. } if user == "alice")));
    }

    #[tokio::test]
    async fn control_revoke_only_touches_own_session() {
        let f = fixture();
        f.registry.register("r1", session("r1", "alice")).await;
        f.registry.add_helper("r1", "bob").await;

        // Mallory owns nothing; revoking does nothing.
        let mallory = identity("mallory");
        let (_id, tx, mut rx) = f.lobby.attach_observer(&mallory).await;
        f.lobby
            .handle_message(
                &mallory,
                LobbyMessage::ControlRevoke {
                    user: String::new(),
                    target_resource_id: String::new(),
                    target_username: "bob".into(),
                    ts: 0,
                },
                &tx,
            )
            .await;
        assert!(f.registry.is_helper("r1", "bob").await);
        assert!(drain(&mut rx).is_empty());

        let alice = identity("alice");
        f.lobby
            .handle_message(
                &alice,
                LobbyMessage::ControlRevoke {
                    user: String::new(),
                    target_resource_id: String::new(),
                    target_username: "bob".into(),
                    ts: 0,
                },
                &tx,
            )
            .await;
        assert!(!f.registry.is_helper("r1", "bob").await);
    }

    #[tokio::test]
    async fn snapshots_sorted_by_pins_then_owner() {
        let f = fixture();
        f.registry.register("r1", session("r1", "carol")).await;
        f.registry.register("r2", session("r2", "alice")).await;
        f.registry.register("r3", session("r3", "bob")).await;
        f.registry.pin("r3", "x").await;
        f.registry.pin("r3", "y").await;
        f.registry.pin("r1", "x").await;

        let (count, entries) = f.lobby.session_entries().await;
        assert_eq!(count, 3);
        let order: Vec<_> = entries.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(order, vec!["bob", "carol", "alice"]);
        let ranks: Vec<_> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dead_observers_are_dropped_on_broadcast() {
        let f = fixture();
        let bob = identity("bob");
        let (_id, _tx, rx) = f.lobby.attach_observer(&bob).await;
        drop(rx);
        assert_eq!(f.lobby.observer_count().await, 1);

        f.lobby
            .broadcast(LobbyMessage::Users { count: 1 })
            .await;
        assert_eq!(f.lobby.observer_count().await, 0);
    }

    #[tokio::test]
    async fn chat_is_persisted_and_broadcast_with_server_timestamp() {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryStore::default());
        let lobby = Arc::new(LobbyCoordinator::new(
            registry,
            store.clone(),
            LobbyConfig::default(),
        ));

        let alice = identity("alice");
        let (_id, tx, mut rx) = lobby.attach_observer(&alice).await;
        lobby
            .handle_message(
                &alice,
                LobbyMessage::Chat {
                    user: String::new(),
                    user_name: String::new(),
                    content: "hello den".into(),
                    ts: 0,
                },
                &tx,
            )
            .await;

        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| matches!(
            m,
            LobbyMessage::Chat { user, content, ts, .. }
                if user == "alice" && content == "hello den" && *ts > 0
        )));
        let history = store.recent_messages(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello den");
    }
}
