//! Server configuration: TOML file + CLI overrides.

use crate::cleanup::CleanupConfig;
use crate::lobby::LobbyConfig;
use den_core::{DenError, DenResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub lobby: LobbySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shell command for locally backed resources.
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shell: None,
        }
    }
}

/// `[cleanup]` section: delayed-eviction tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSection {
    #[serde(default = "default_cleanup_delay")]
    pub delay_secs: u64,
    #[serde(default = "default_stop_backoff")]
    pub stop_backoff_secs: u64,
    #[serde(default = "default_remove_backoff")]
    pub remove_backoff_secs: u64,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            delay_secs: default_cleanup_delay(),
            stop_backoff_secs: default_stop_backoff(),
            remove_backoff_secs: default_remove_backoff(),
        }
    }
}

/// `[lobby]` section: fan-out and invite tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct LobbySection {
    #[serde(default = "default_invite_cooldown")]
    pub invite_cooldown_secs: u64,
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_history_limit")]
    pub chat_history_limit: usize,
}

impl Default for LobbySection {
    fn default() -> Self {
        Self {
            invite_cooldown_secs: default_invite_cooldown(),
            broadcast_interval_secs: default_broadcast_interval(),
            chat_history_limit: default_history_limit(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4500
}
fn default_cleanup_delay() -> u64 {
    20 * 60
}
fn default_stop_backoff() -> u64 {
    2
}
fn default_remove_backoff() -> u64 {
    5
}
fn default_invite_cooldown() -> u64 {
    30
}
fn default_broadcast_interval() -> u64 {
    3
}
fn default_history_limit() -> usize {
    500
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub shell: Option<String>,
    pub cleanup: CleanupConfig,
    pub lobby: LobbyConfig,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_shell: Option<&str>,
        cli_cleanup_delay: Option<u64>,
        cli_invite_cooldown: Option<u64>,
        cli_broadcast_interval: Option<u64>,
    ) -> DenResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| DenError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self::resolve(
            file_config,
            cli_port,
            cli_bind,
            cli_shell,
            cli_cleanup_delay,
            cli_invite_cooldown,
            cli_broadcast_interval,
        ))
    }

    fn resolve(
        file: ConfigFile,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_shell: Option<&str>,
        cli_cleanup_delay: Option<u64>,
        cli_invite_cooldown: Option<u64>,
        cli_broadcast_interval: Option<u64>,
    ) -> Self {
        let delay_secs = cli_cleanup_delay.unwrap_or(file.cleanup.delay_secs);
        let invite_cooldown_secs = cli_invite_cooldown.unwrap_or(file.lobby.invite_cooldown_secs);
        let broadcast_interval_secs =
            cli_broadcast_interval.unwrap_or(file.lobby.broadcast_interval_secs);

        Self {
            bind: cli_bind.map(str::to_string).unwrap_or(file.server.bind),
            port: cli_port.unwrap_or(file.server.port),
            shell: cli_shell.map(str::to_string).or(file.server.shell),
            cleanup: CleanupConfig {
                delay: Duration::from_secs(delay_secs),
                stop_backoff: Duration::from_secs(file.cleanup.stop_backoff_secs),
                remove_backoff: Duration::from_secs(file.cleanup.remove_backoff_secs),
            },
            lobby: LobbyConfig {
                invite_cooldown: Duration::from_secs(invite_cooldown_secs),
                broadcast_interval: Duration::from_secs(broadcast_interval_secs),
                history_limit: file.lobby.chat_history_limit,
            },
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
