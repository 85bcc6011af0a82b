//! Terminal relay: pumps bytes between a websocket and an attached resource.
//!
//! One relay per accepted terminal connection. The remote→transport pump
//! also maintains the session's rolling snapshots for lobby observers. The
//! two directions are linked by a cancellation token: failure or close of
//! either unblocks the other. Helper connections re-validate authorization
//! on every inbound message.

use crate::cleanup::CleanupScheduler;
use crate::provider::{AttachedSession, SessionProvider};
use crate::registry::{Session, SessionRegistry};
use crate::store::ChatStore;
use crate::transport::ClientIdentity;
use den_core::{strip_controls, RollingBuffer, TerminalMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw snapshot window: growth cap / retained tail.
const RAW_SNAPSHOT_CAP: usize = 16_000;
const RAW_SNAPSHOT_RETAIN: usize = 12_000;
/// Stripped snapshot window.
const CLEAN_SNAPSHOT_CAP: usize = 400;
const CLEAN_SNAPSHOT_RETAIN: usize = 300;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Whether the connection owns the resource or assists on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Owner,
    Helper,
}

/// Shared pieces a relay needs; one instance serves all connections.
pub struct TerminalRelay {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<CleanupScheduler>,
    provider: Arc<dyn SessionProvider>,
    store: Arc<dyn ChatStore>,
}

impl TerminalRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        scheduler: Arc<CleanupScheduler>,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            provider,
            store,
        }
    }

    /// Drive one terminal connection to completion.
    pub async fn run(
        &self,
        mut ws: WebSocketStream<TcpStream>,
        resource_id: String,
        who: ClientIdentity,
        role: RelayRole,
    ) {
        if role == RelayRole::Helper
            && !self.registry.is_helper(&resource_id, &who.username).await
        {
            send_status(&mut ws, "forbidden").await;
            let _ = ws.close(None).await;
            return;
        }

        if role == RelayRole::Owner {
            self.registry
                .register(
                    &resource_id,
                    Session {
                        resource_id: resource_id.clone(),
                        owner: who.username.clone(),
                        name: who.name.clone(),
                        os: who.os.clone(),
                        avatar: who.avatar.clone(),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = self.store.record_connect(&who.username, &who.avatar).await {
                warn!(username = %who.username, error = %e, "record connect failed");
            }
        }
        self.scheduler.on_connect(&resource_id).await;

        info!(resource_id = %resource_id, username = %who.username, role = ?role, "terminal connected");

        let attached = match self.provider.attach(&resource_id).await {
            Ok(a) => a,
            Err(e) => {
                warn!(resource_id = %resource_id, error = %e, "attach failed");
                send_status(&mut ws, &format!("error: {e}")).await;
                let _ = ws.close(None).await;
                self.finish(&resource_id, &who, role).await;
                return;
            }
        };
        let AttachedSession {
            output,
            input,
            token,
        } = attached;

        let cancel = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::channel::<TerminalMessage>(64);

        let pump = tokio::spawn(pump_output(
            output,
            out_tx,
            cancel.clone(),
            self.registry.clone(),
            resource_id.clone(),
        ));

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                msg = out_rx.recv() => {
                    let Some(msg) = msg else {
                        cancel.cancel();
                        break;
                    };
                    if sink.send(Message::Text(msg.encode())).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }

                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => {
                            String::from_utf8_lossy(&data).into_owned()
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            cancel.cancel();
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(resource_id = %resource_id, error = %e, "websocket read ended");
                            cancel.cancel();
                            break;
                        }
                    };

                    // Helper authorization is re-validated on every message,
                    // not just at connect time.
                    if role == RelayRole::Helper
                        && !self.registry.is_helper(&resource_id, &who.username).await
                    {
                        let revoked = TerminalMessage::Status { data: "revoked".into() };
                        let _ = sink.send(Message::Text(revoked.encode())).await;
                        cancel.cancel();
                        break;
                    }

                    match TerminalMessage::decode(&text) {
                        TerminalMessage::Input { data } => {
                            if input.send(data.into_bytes()).await.is_err() {
                                cancel.cancel();
                                break;
                            }
                        }
                        TerminalMessage::Resize { cols, rows } => {
                            if let Err(e) = self.provider.resize(&token, cols, rows).await {
                                warn!(resource_id = %resource_id, error = %e, "resize failed");
                            }
                        }
                        // Output/status frames only flow server -> client.
                        TerminalMessage::Output { .. } | TerminalMessage::Status { .. } => {}
                    }
                }
            }
        }

        cancel.cancel();
        let _ = pump.await;
        self.finish(&resource_id, &who, role).await;
        info!(resource_id = %resource_id, username = %who.username, "terminal disconnected");
    }

    async fn finish(&self, resource_id: &str, who: &ClientIdentity, role: RelayRole) {
        if role == RelayRole::Owner {
            // The resource persists stopped; eviction removes it later.
            if let Err(e) = self.provider.stop(resource_id).await {
                warn!(resource_id, error = %e, "stop on disconnect failed");
            }
            if let Err(e) = self.store.record_disconnect(&who.username).await {
                warn!(username = %who.username, error = %e, "record disconnect failed");
            }
        }
        self.scheduler.on_disconnect(resource_id).await;
        if role == RelayRole::Owner {
            self.registry.unregister(resource_id).await;
        }
    }
}

/// remote→transport direction: maintain snapshots, forward output frames.
async fn pump_output(
    mut output: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<TerminalMessage>,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    resource_id: String,
) {
    let mut raw = RollingBuffer::new(RAW_SNAPSHOT_CAP, RAW_SNAPSHOT_RETAIN);
    let mut clean = RollingBuffer::new(CLEAN_SNAPSHOT_CAP, CLEAN_SNAPSHOT_RETAIN);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = output.recv() => {
                let Some(bytes) = chunk else {
                    break;
                };
                raw.push(&bytes);
                let stripped = strip_controls(&bytes);
                if !stripped.is_empty() {
                    clean.push(&stripped);
                }
                registry
                    .update_snapshot(&resource_id, raw.to_text(), clean.to_text())
                    .await;

                let data = String::from_utf8_lossy(&bytes).into_owned();
                if out_tx.send(TerminalMessage::Output { data }).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

async fn send_status(ws: &mut WebSocketStream<TcpStream>, data: &str) {
    let msg = TerminalMessage::Status { data: data.into() };
    let _ = ws.send(Message::Text(msg.encode())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(resource_id: &str, owner: &str) -> Session {
        Session {
            resource_id: resource_id.into(),
            owner: owner.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pump_updates_snapshots_and_forwards_output() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("r1", session("r1", "alice")).await;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, mut out_rx) = mpsc::channel::<TerminalMessage>(8);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_output(
            chunk_rx,
            out_tx,
            cancel.clone(),
            registry.clone(),
            "r1".into(),
        ));

        chunk_tx.send(b"\x1b[31mhi\x1b[0m\n".to_vec()).await.unwrap();
        let forwarded = out_rx.recv().await.unwrap();
        assert_eq!(
            forwarded,
            TerminalMessage::Output {
                data: "\u{1b}[31mhi\u{1b}[0m\n".into()
            }
        );

        let s = registry.get("r1").await.unwrap();
        assert_eq!(s.clean_snapshot, "hi\n");
        assert_eq!(s.raw_snapshot, "\u{1b}[31mhi\u{1b}[0m\n");

        drop(chunk_tx);
        pump.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled() {
        let registry = Arc::new(SessionRegistry::new());
        let (_chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, _out_rx) = mpsc::channel::<TerminalMessage>(8);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_output(
            chunk_rx,
            out_tx,
            cancel.clone(),
            registry,
            "r1".into(),
        ));

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_tolerates_unregistered_session() {
        // A disconnect can unregister the session while output is in flight;
        // the pump keeps going without error.
        let registry = Arc::new(SessionRegistry::new());
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, mut out_rx) = mpsc::channel::<TerminalMessage>(8);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_output(
            chunk_rx,
            out_tx,
            cancel,
            registry,
            "gone".into(),
        ));

        chunk_tx.send(b"late output".to_vec()).await.unwrap();
        assert_eq!(
            out_rx.recv().await.unwrap(),
            TerminalMessage::Output {
                data: "late output".into()
            }
        );

        drop(chunk_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_keeps_only_recent_window() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("r1", session("r1", "alice")).await;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(8);
        let (out_tx, mut out_rx) = mpsc::channel::<TerminalMessage>(64);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_output(
            chunk_rx,
            out_tx,
            cancel,
            registry.clone(),
            "r1".into(),
        ));

        // Push well past the clean cap (400 bytes) in printable chunks.
        for _ in 0..10 {
            chunk_tx.send(vec![b'x'; 100]).await.unwrap();
            out_rx.recv().await.unwrap();
        }
        drop(chunk_tx);
        pump.await.unwrap();

        let s = registry.get("r1").await.unwrap();
        assert!(s.clean_snapshot.len() <= CLEAN_SNAPSHOT_CAP);
        assert!(s.clean_snapshot.chars().all(|c| c == 'x'));
    }
}
