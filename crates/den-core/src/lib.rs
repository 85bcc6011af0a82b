//! den-core: shared protocol library for the den shared-terminal lobby.
//!
//! Provides the JSON wire messages for the terminal and lobby WebSocket
//! protocols, the rolling snapshot buffer, and control-sequence stripping.

pub mod error;
pub mod messages;
pub mod snapshot;
pub mod strip;

// Re-export commonly used items at crate root.
pub use error::{DenError, DenResult};
pub use messages::{ChatRecord, LobbyMessage, SessionEntry, TerminalMessage};
pub use snapshot::RollingBuffer;
pub use strip::strip_controls;
