//! Local process-backed session provider.
//!
//! Backs each attachment with a PTY running a shell, keyed by resource id.
//! Every attach gets its own shell process (owner and helpers each attach
//! separately), matching how an exec-attach against a container behaves.

use super::{AttachedSession, ResourceState, SessionProvider};
use async_trait::async_trait;
use den_core::{DenError, DenResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Channel depth for each direction of an attachment.
const PUMP_BUFFER: usize = 64;

struct Attachment {
    resource_id: String,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
}

/// PTY-backed [`SessionProvider`].
pub struct ProcessProvider {
    attachments: Mutex<HashMap<String, Attachment>>,
    shell: String,
}

impl ProcessProvider {
    /// `shell` overrides the command run in each attachment; defaults to
    /// `$SHELL` or `/bin/sh`.
    pub fn new(shell: Option<String>) -> Self {
        let shell = shell.unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        });
        Self {
            attachments: Mutex::new(HashMap::new()),
            shell,
        }
    }

    fn with_attachments<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Attachment>) -> R,
    ) -> DenResult<R> {
        let mut map = self
            .attachments
            .lock()
            .map_err(|_| DenError::Provider("attachment table lock poisoned".into()))?;
        Ok(f(&mut map))
    }

    fn kill_attachment(att: &Attachment) {
        if let Ok(mut child) = att.child.lock() {
            if let Err(e) = child.kill() {
                debug!(resource_id = %att.resource_id, error = %e, "kill failed (already gone?)");
            }
        }
    }
}

#[async_trait]
impl SessionProvider for ProcessProvider {
    async fn stop(&self, resource_id: &str) -> DenResult<()> {
        self.with_attachments(|map| {
            let mut stopped = 0;
            for att in map.values().filter(|a| a.resource_id == resource_id) {
                Self::kill_attachment(att);
                stopped += 1;
            }
            if stopped > 0 {
                info!(resource_id, attachments = stopped, "resource stopped");
            }
        })
    }

    async fn remove(&self, resource_id: &str) -> DenResult<()> {
        self.with_attachments(|map| {
            map.retain(|_, att| {
                if att.resource_id == resource_id {
                    Self::kill_attachment(att);
                    false
                } else {
                    true
                }
            });
            info!(resource_id, "resource removed");
        })
    }

    async fn attach(&self, resource_id: &str) -> DenResult<AttachedSession> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DenError::Provider(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DenError::Provider(format!("failed to spawn shell: {e}")))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DenError::Provider(format!("failed to clone PTY reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| DenError::Provider(format!("failed to take PTY writer: {e}")))?;

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(PUMP_BUFFER);
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(PUMP_BUFFER);

        // PTY I/O is blocking; each direction gets a blocking pump that dies
        // with its channel.
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            while let Some(data) = in_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let token = generate_token();
        let attachment = Attachment {
            resource_id: resource_id.to_string(),
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
        };
        self.with_attachments(|map| {
            map.insert(token.clone(), attachment);
        })?;

        info!(resource_id, shell = %self.shell, "attachment created");

        Ok(AttachedSession {
            output: out_rx,
            input: in_tx,
            token,
        })
    }

    async fn resize(&self, token: &str, cols: u16, rows: u16) -> DenResult<()> {
        let master = self.with_attachments(|map| map.get(token).map(|a| a.master.clone()))?;
        let Some(master) = master else {
            return Err(DenError::SessionNotFound(token.to_string()));
        };
        let master = master
            .lock()
            .map_err(|_| DenError::Provider("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| DenError::Provider(format!("PTY resize failed: {e}")))?;
        debug!(token, cols, rows, "attachment resized");
        Ok(())
    }

    async fn status(&self, resource_id: &str) -> DenResult<ResourceState> {
        self.with_attachments(|map| {
            let mut seen = false;
            for att in map.values().filter(|a| a.resource_id == resource_id) {
                seen = true;
                if let Ok(mut child) = att.child.lock() {
                    match child.try_wait() {
                        Ok(None) => return Ok(ResourceState::Running),
                        Ok(Some(_)) => {}
                        Err(e) => {
                            warn!(resource_id, error = %e, "status probe failed");
                        }
                    }
                }
            }
            if seen {
                Ok(ResourceState::Stopped)
            } else {
                Err(DenError::SessionNotFound(resource_id.to_string()))
            }
        })?
    }
}

/// Random attachment token (hex-encoded, 16 bytes = 32 hex chars).
fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
