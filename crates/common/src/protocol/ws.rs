// WebSocket message types for the easel collaboration protocol.
//
// Every frame is a JSON object with a `type` tag. The set of variants is
// closed: unknown types fail to decode and are reported to the sender only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Action, LockInfo, LockOwner, MemberInfo, Operation};

/// Lock denial reason sent when another user holds the element.
pub const LOCK_COLLISION: &str = "collision";
/// Unlock denial reason sent when the caller does not own the lock.
pub const UNLOCK_NOT_OWNER: &str = "not_owner";

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room. `user_id`/`username` are informational; the relay uses
    /// the identity proven by the connection credential.
    JoinRoom {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    LeaveRoom {
        room: String,
    },

    CursorMove {
        room: String,
        x: f64,
        y: f64,
    },

    LockElement {
        room: String,
        element_id: String,
    },

    UnlockElement {
        room: String,
        element_id: String,
    },

    ActionPerformed {
        room: String,
        action: Action,
    },

    UndoAction {
        room: String,
    },

    RedoAction {
        room: String,
    },

    /// Application-level liveness check for clients without ping frames.
    Ping,
}

impl ClientMessage {
    /// Short label used for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::CursorMove { .. } => "cursor_move",
            Self::LockElement { .. } => "lock_element",
            Self::UnlockElement { .. } => "unlock_element",
            Self::ActionPerformed { .. } => "action_performed",
            Self::UndoAction { .. } => "undo_action",
            Self::RedoAction { .. } => "redo_action",
            Self::Ping => "ping",
        }
    }

    /// Room addressed by this message, if any.
    pub fn room(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { room, .. }
            | Self::LeaveRoom { room }
            | Self::CursorMove { room, .. }
            | Self::LockElement { room, .. }
            | Self::UnlockElement { room, .. }
            | Self::ActionPerformed { room, .. }
            | Self::UndoAction { room }
            | Self::RedoAction { room } => Some(room),
            Self::Ping => None,
        }
    }
}

/// Server -> Client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `join_room`: the full room snapshot.
    RoomJoined {
        room: String,
        success: bool,
        members: Vec<MemberInfo>,
        locks: Vec<LockInfo>,
    },

    /// Another member joined (or rejoined) the room.
    UserJoined {
        room: String,
        member: MemberInfo,
    },

    UserLeft {
        room: String,
        user_id: String,
    },

    CursorUpdate {
        room: String,
        user_id: String,
        username: String,
        color: String,
        x: f64,
        y: f64,
        /// Server time in unix milliseconds, for receiver-side latency.
        timestamp: i64,
    },

    /// Reply to `lock_element`.
    LockResult {
        room: String,
        element_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<LockOwner>,
    },

    /// Reply to `unlock_element`.
    UnlockResult {
        room: String,
        element_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ElementLocked {
        room: String,
        lock: LockInfo,
    },

    ElementUnlocked {
        room: String,
        element_id: String,
        user_id: String,
    },

    ActionApplied {
        room: String,
        action: Operation,
    },

    ActionConflictResolved {
        room: String,
        element_id: String,
        winning_action: Operation,
    },

    ActionUndone {
        room: String,
        action: Operation,
    },

    ActionRedone {
        room: String,
        action: Operation,
    },

    Pong {
        server_time: i64,
    },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
}

impl ServerMessage {
    /// Cursor updates are superseded by the next one and may be dropped under
    /// backpressure; every other message must be delivered.
    pub const fn is_lossy(&self) -> bool {
        matches!(self, Self::CursorUpdate { .. })
    }

    pub fn error(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.to_string(), message: message.into(), retryable, room: None }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

pub fn decode_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str::<ClientMessage>(raw)?)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_join_room_without_optional_fields() {
        let message = decode_client_message(r#"{"type":"join_room","room":"doc-1"}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::JoinRoom { room: "doc-1".into(), user_id: None, username: None }
        );
        assert_eq!(message.kind(), "join_room");
        assert_eq!(message.room(), Some("doc-1"));
    }

    #[test]
    fn decodes_ping_without_room() {
        let message = decode_client_message(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(message, ClientMessage::Ping);
        assert_eq!(message.room(), None);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let error = decode_client_message(r#"{"type":"format_disk"}"#).unwrap_err();
        assert!(error.to_string().starts_with("invalid message payload"));
    }

    #[test]
    fn decodes_action_performed() {
        let raw = json!({
            "type": "action_performed",
            "room": "doc-1",
            "action": {
                "op_id": "6f0c1c3e-1a8f-4b8e-9a55-2c0d1f6f8b01",
                "element_id": "shape-1",
                "op_type": "move",
                "after_state": {"x": 100, "y": 100}
            }
        })
        .to_string();

        match decode_client_message(&raw).unwrap() {
            ClientMessage::ActionPerformed { room, action } => {
                assert_eq!(room, "doc-1");
                assert_eq!(action.element_id, "shape-1");
                assert!(action.before_state.is_none());
                assert_eq!(action.after_state, Some(json!({"x": 100, "y": 100})));
            }
            other => panic!("expected action_performed, got {other:?}"),
        }
    }

    #[test]
    fn lock_collision_reply_carries_owner() {
        let encoded = encode_server_message(&ServerMessage::LockResult {
            room: "doc-1".into(),
            element_id: "shape-123".into(),
            success: false,
            error: Some(LOCK_COLLISION.into()),
            owner: Some(LockOwner { user_id: "A".into(), username: "Alice".into() }),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "lock_result");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "collision");
        assert_eq!(value["owner"]["user_id"], "A");
    }

    #[test]
    fn only_cursor_updates_are_lossy() {
        let cursor = ServerMessage::CursorUpdate {
            room: "doc-1".into(),
            user_id: "A".into(),
            username: "Alice".into(),
            color: "#e06c75".into(),
            x: 1.0,
            y: 2.0,
            timestamp: 0,
        };
        assert!(cursor.is_lossy());
        assert!(!ServerMessage::Pong { server_time: 0 }.is_lossy());
        assert!(!ServerMessage::error("INTERNAL_ERROR", "boom", true).is_lossy());
    }
}
