//! den-server: shared-terminal lobby server.
//!
//! Accepts WebSocket connections for owner/helper terminal relays and lobby
//! observers, backed by a swappable remote session provider.

use clap::Parser;
use den_server::config::ServerConfig;
use den_server::provider::ProcessProvider;
use den_server::server::DenServer;
use den_server::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// den-server — shared-terminal lobby server
#[derive(Parser, Debug)]
#[command(name = "den-server", version, about = "Shared-terminal lobby server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.den/config.toml")]
    config: String,

    /// Shell command for locally backed resources
    #[arg(long)]
    shell: Option<String>,

    /// Idle-eviction delay in seconds
    #[arg(long)]
    cleanup_delay: Option<u64>,

    /// Invite cooldown in seconds
    #[arg(long)]
    invite_cooldown: Option<u64>,

    /// Lobby snapshot broadcast interval in seconds
    #[arg(long)]
    broadcast_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting den-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cli.shell.as_deref(),
        cli.cleanup_delay,
        cli.invite_cooldown,
        cli.broadcast_interval,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let provider = Arc::new(ProcessProvider::new(config.shell.clone()));
    let store = Arc::new(MemoryStore::new(config.lobby.history_limit));
    let server = DenServer::new(config, provider, store);

    // Run until shutdown signal
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("den-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
