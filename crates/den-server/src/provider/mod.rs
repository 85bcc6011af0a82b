//! Remote session provider interface.
//!
//! The provider owns the actual shell resources; the server only ever talks
//! to it through this trait so the runtime stays swappable. The in-tree
//! [`ProcessProvider`] backs resources with local PTY shells; a container
//! runtime slots in behind the same trait.

use async_trait::async_trait;
use den_core::DenResult;
use tokio::sync::mpsc;

pub mod process;

pub use process::ProcessProvider;

/// Byte stream attached to a running resource.
///
/// Output is what the shell writes; input is what gets typed into it. Both
/// ends close when the attachment dies.
pub struct AttachedSession {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    /// Opaque per-attachment token used for resize calls.
    pub token: String,
}

/// Coarse resource state reported by [`SessionProvider::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Running,
    Stopped,
}

/// Operations the server needs from whatever runs the shells.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Stop the resource. Stopping an already-stopped resource succeeds.
    async fn stop(&self, resource_id: &str) -> DenResult<()>;

    /// Remove the resource entirely.
    async fn remove(&self, resource_id: &str) -> DenResult<()>;

    /// Attach a new interactive stream to the resource.
    async fn attach(&self, resource_id: &str) -> DenResult<AttachedSession>;

    /// Propagate a terminal geometry change to one attachment.
    async fn resize(&self, token: &str, cols: u16, rows: u16) -> DenResult<()>;

    /// Report the resource's current state.
    async fn status(&self, resource_id: &str) -> DenResult<ResourceState>;
}
