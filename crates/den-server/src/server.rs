//! Server wiring: owns the subsystems and dispatches accepted connections.
//!
//! A [`DenServer`] is an explicitly constructed instance — registry,
//! scheduler, lobby and relay are built here and injected into each other;
//! nothing is process-global.

use crate::cleanup::CleanupScheduler;
use crate::config::ServerConfig;
use crate::lobby::LobbyCoordinator;
use crate::provider::SessionProvider;
use crate::registry::SessionRegistry;
use crate::relay::{RelayRole, TerminalRelay};
use crate::store::ChatStore;
use crate::transport::{self, ClientIdentity, WsConnection};
use den_core::{DenError, DenResult, TerminalMessage};
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

pub struct DenServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<CleanupScheduler>,
    lobby: Arc<LobbyCoordinator>,
    relay: TerminalRelay,
}

impl DenServer {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn SessionProvider>,
        store: Arc<dyn ChatStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let scheduler = Arc::new(CleanupScheduler::new(
            provider.clone(),
            store.clone(),
            registry.clone(),
            config.cleanup.clone(),
        ));
        let lobby = Arc::new(LobbyCoordinator::new(
            registry.clone(),
            store.clone(),
            config.lobby.clone(),
        ));
        let relay = TerminalRelay::new(
            registry.clone(),
            scheduler.clone(),
            provider,
            store,
        );

        Arc::new(Self {
            config,
            registry,
            scheduler,
            lobby,
            relay,
        })
    }

    /// Accept connections until the listener closes.
    pub async fn run(self: Arc<Self>) -> DenResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| DenError::Other(format!("invalid address: {e}")))?;

        let mut connections = transport::start_listener(addr).await?;
        let _broadcaster = self.lobby.clone().spawn_broadcaster();

        info!(port = self.config.port, "den-server ready");

        while let Some(conn) = connections.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(conn).await;
            });
        }

        info!("listener closed, shutting down");
        Ok(())
    }

    async fn handle_connection(&self, conn: WsConnection) {
        let who = ClientIdentity::from_params(&conn.params, &conn.remote_addr);
        match conn.path.as_str() {
            "/terminal" | "/helper" => {
                let Some(resource_id) = conn
                    .params
                    .get("resource")
                    .filter(|v| !v.is_empty())
                    .cloned()
                else {
                    warn!(remote = %conn.remote_addr, "terminal connection without resource id");
                    let mut ws = conn.ws_stream;
                    let msg = TerminalMessage::Status {
                        data: "error: resource required".into(),
                    };
                    let _ = ws.send(Message::Text(msg.encode())).await;
                    let _ = ws.close(None).await;
                    return;
                };
                let role = if conn.path == "/helper" {
                    RelayRole::Helper
                } else {
                    RelayRole::Owner
                };
                self.relay.run(conn.ws_stream, resource_id, who, role).await;
            }
            "/lobby" => {
                self.lobby.clone().handle(conn.ws_stream, who).await;
            }
            other => {
                warn!(path = %other, remote = %conn.remote_addr, "unknown websocket path");
            }
        }
    }

    /// Access the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Access the cleanup scheduler (operator cancel hook).
    pub fn scheduler(&self) -> &Arc<CleanupScheduler> {
        &self.scheduler
    }
}
