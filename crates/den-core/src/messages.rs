//! Wire messages for the terminal and lobby WebSocket protocols.
//!
//! Both protocols speak JSON text frames tagged by a `type` field, one enum
//! variant per message type. Fields that only appear in one direction carry
//! `#[serde(default)]` so the inbound subset still decodes.

use serde::{Deserialize, Serialize};

/// Messages on a terminal connection, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalMessage {
    /// Keystrokes from the client toward the shell.
    Input { data: String },
    /// Terminal geometry change.
    Resize { cols: u16, rows: u16 },
    /// Shell output toward the client.
    Output { data: String },
    /// Out-of-band connection state ("error: ...", "revoked", "forbidden").
    Status { data: String },
}

impl TerminalMessage {
    /// Decode an inbound frame. Anything that does not parse as a tagged
    /// message is raw input.
    pub fn decode(raw: &str) -> TerminalMessage {
        serde_json::from_str(raw).unwrap_or_else(|_| TerminalMessage::Input {
            data: raw.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One session row in a `snapshots` broadcast, ranked for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub rank: usize,
    pub resource_id: String,
    pub username: String,
    pub name: String,
    pub os: String,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_snapshot: String,
    pub pin_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helpers: Vec<String>,
}

/// A persisted chat message replayed to newly joined observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub user: String,
    pub content: String,
    pub ts: String,
}

/// Messages on a lobby connection, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyMessage {
    Users {
        count: usize,
    },
    Chat {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "userName", default, skip_serializing_if = "String::is_empty")]
        user_name: String,
        content: String,
        #[serde(default)]
        ts: i64,
    },
    Join {
        user: String,
        count: usize,
    },
    Leave {
        user: String,
        count: usize,
    },
    Snapshots {
        count: usize,
        sessions: Vec<SessionEntry>,
    },
    Like {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(rename = "targetUsername", default, skip_serializing_if = "String::is_empty")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    Pin {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(rename = "targetUsername", default, skip_serializing_if = "String::is_empty")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    Unpin {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(default)]
        ts: i64,
    },
    History {
        messages: Vec<ChatRecord>,
    },
    Invite {
        #[serde(rename = "inviteFrom", default, skip_serializing_if = "String::is_empty")]
        invite_from: String,
        #[serde(rename = "inviteTo")]
        invite_to: String,
        #[serde(rename = "targetResourceId", default, skip_serializing_if = "String::is_empty")]
        target_resource_id: String,
        #[serde(default)]
        ts: i64,
    },
    InviteAccept {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(rename = "targetUsername", default, skip_serializing_if = "String::is_empty")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    InviteReject {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(rename = "targetUsername", default, skip_serializing_if = "String::is_empty")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    InviteSent {
        user: String,
        #[serde(rename = "inviteTo")]
        invite_to: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        content: String,
        ts: i64,
    },
    InviteRejectedNotify {
        user: String,
        #[serde(rename = "targetUsername")]
        target_username: String,
        content: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        ts: i64,
    },
    InviteError {
        user: String,
        content: String,
        #[serde(rename = "cooldownRemaining")]
        cooldown_remaining: u64,
        ts: i64,
    },
    ControlRevoke {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId", default, skip_serializing_if = "String::is_empty")]
        target_resource_id: String,
        #[serde(rename = "targetUsername")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    HelperLeave {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId")]
        target_resource_id: String,
        #[serde(rename = "targetUsername", default, skip_serializing_if = "String::is_empty")]
        target_username: String,
        #[serde(default)]
        ts: i64,
    },
    OwnerCancel {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        user: String,
        #[serde(rename = "targetResourceId", default, skip_serializing_if = "String::is_empty")]
        target_resource_id: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        content: String,
        #[serde(default)]
        ts: i64,
    },
}

impl LobbyMessage {
    /// Decode an inbound frame; malformed frames are dropped by the caller.
    pub fn decode(raw: &str) -> Option<LobbyMessage> {
        serde_json::from_str(raw).ok()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_input_round_trip() {
        let msg = TerminalMessage::Input {
            data: "ls -la\n".into(),
        };
        let json = msg.encode();
        assert!(json.contains("\"type\":\"input\""));
        assert_eq!(TerminalMessage::decode(&json), msg);
    }

    #[test]
    fn undecodable_terminal_frame_is_raw_input() {
        let msg = TerminalMessage::decode("not json at all");
        assert_eq!(
            msg,
            TerminalMessage::Input {
                data: "not json at all".into()
            }
        );
    }

    #[test]
    fn resize_decodes_with_geometry() {
        let msg = TerminalMessage::decode(r#"{"type":"resize","cols":120,"rows":40}"#);
        assert_eq!(msg, TerminalMessage::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn lobby_invite_decodes_inbound_subset() {
        // A client-sent invite carries only the invitee.
        let msg = LobbyMessage::decode(r#"{"type":"invite","inviteTo":"bob"}"#).unwrap();
        match msg {
            LobbyMessage::Invite {
                invite_to,
                invite_from,
                ..
            } => {
                assert_eq!(invite_to, "bob");
                assert!(invite_from.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn lobby_snapshot_uses_camel_case_fields() {
        let msg = LobbyMessage::Snapshots {
            count: 1,
            sessions: vec![SessionEntry {
                rank: 1,
                resource_id: "r1".into(),
                username: "alice".into(),
                name: "Alice".into(),
                os: "alpine".into(),
                avatar: "http://a/".into(),
                snapshot: "hi".into(),
                raw_snapshot: "\u{1b}[31mhi".into(),
                pin_count: 2,
                helpers: vec!["bob".into()],
            }],
        };
        let json = msg.encode();
        assert!(json.contains("\"resourceId\":\"r1\""));
        assert!(json.contains("\"pinCount\":2"));
        assert!(json.contains("\"rawSnapshot\""));
    }

    #[test]
    fn malformed_lobby_frame_is_dropped() {
        assert!(LobbyMessage::decode("{\"type\":\"nope\"}").is_none());
        assert!(LobbyMessage::decode("garbage").is_none());
    }

    #[test]
    fn cooldown_error_round_trip() {
        let msg = LobbyMessage::InviteError {
            user: "alice".into(),
            content: "invite cooldown active".into(),
            cooldown_remaining: 12,
            ts: 1000,
        };
        let json = msg.encode();
        assert!(json.contains("\"cooldownRemaining\":12"));
        assert_eq!(LobbyMessage::decode(&json), Some(msg));
    }
}
