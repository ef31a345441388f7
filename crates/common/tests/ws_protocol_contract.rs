use chrono::{TimeZone, Utc};
use easel_common::protocol::ws::{ClientMessage, ServerMessage, LOCK_COLLISION};
use easel_common::types::{Action, LockInfo, LockOwner, MemberInfo, OpType, Operation};
use serde_json::{json, Value};
use uuid::Uuid;

fn member() -> MemberInfo {
    MemberInfo {
        user_id: "A".to_string(),
        username: "Alice".to_string(),
        color: "#e06c75".to_string(),
        cursor_x: 10.0,
        cursor_y: 20.0,
        last_active_at: Utc.timestamp_millis_opt(1_000).unwrap(),
        is_current: true,
    }
}

fn lock() -> LockInfo {
    LockInfo {
        element_id: "shape-123".to_string(),
        owner_user_id: "A".to_string(),
        owner_username: "Alice".to_string(),
        acquired_at: Utc.timestamp_millis_opt(2_000).unwrap(),
    }
}

fn operation() -> Operation {
    Operation {
        op_id: Uuid::new_v4(),
        room_id: "doc-1".to_string(),
        user_id: "B".to_string(),
        element_id: "shape-1".to_string(),
        op_type: OpType::Move,
        before_state: Some(json!({"x": 0, "y": 0})),
        after_state: Some(json!({"x": 200, "y": 200})),
        server_timestamp: 101,
    }
}

fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> =
        value.as_object().expect("message should be an object").keys().cloned().collect();
    keys.sort();
    keys
}

fn expected(fields: &[&str]) -> Vec<String> {
    let mut fields: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
    fields.sort();
    fields
}

#[test]
fn client_message_shapes_match_contract() {
    let samples = [
        (
            ClientMessage::JoinRoom {
                room: "doc-1".to_string(),
                user_id: Some("A".to_string()),
                username: Some("Alice".to_string()),
            },
            "join_room",
            &["type", "room", "user_id", "username"][..],
        ),
        (
            ClientMessage::CursorMove { room: "doc-1".to_string(), x: 1.5, y: 2.5 },
            "cursor_move",
            &["type", "room", "x", "y"][..],
        ),
        (
            ClientMessage::LockElement {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
            },
            "lock_element",
            &["type", "room", "element_id"][..],
        ),
        (
            ClientMessage::UnlockElement {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
            },
            "unlock_element",
            &["type", "room", "element_id"][..],
        ),
        (
            ClientMessage::ActionPerformed {
                room: "doc-1".to_string(),
                action: Action {
                    op_id: Uuid::new_v4(),
                    element_id: "shape-1".to_string(),
                    op_type: OpType::Update,
                    before_state: None,
                    after_state: Some(json!({"fill": "red"})),
                },
            },
            "action_performed",
            &["type", "room", "action"][..],
        ),
        (ClientMessage::UndoAction { room: "doc-1".to_string() }, "undo_action", &["type", "room"][..]),
        (ClientMessage::RedoAction { room: "doc-1".to_string() }, "redo_action", &["type", "room"][..]),
        (ClientMessage::LeaveRoom { room: "doc-1".to_string() }, "leave_room", &["type", "room"][..]),
        (ClientMessage::Ping, "ping", &["type"][..]),
    ];

    for (message, type_name, fields) in samples {
        let value = serde_json::to_value(&message).expect("client message should serialize");
        assert_eq!(value["type"], type_name);
        assert_eq!(keys(&value), expected(fields), "field set mismatch for {type_name}");
        let decoded: ClientMessage =
            serde_json::from_value(value).expect("client message should decode");
        assert_eq!(decoded, message);
    }
}

#[test]
fn server_message_shapes_match_contract() {
    let samples = [
        (
            ServerMessage::RoomJoined {
                room: "doc-1".to_string(),
                success: true,
                members: vec![member()],
                locks: vec![lock()],
            },
            "room_joined",
            &["type", "room", "success", "members", "locks"][..],
        ),
        (
            ServerMessage::CursorUpdate {
                room: "doc-1".to_string(),
                user_id: "A".to_string(),
                username: "Alice".to_string(),
                color: "#e06c75".to_string(),
                x: 1.0,
                y: 2.0,
                timestamp: 1_700_000_000_000,
            },
            "cursor_update",
            &["type", "room", "user_id", "username", "color", "x", "y", "timestamp"][..],
        ),
        (
            ServerMessage::LockResult {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
                success: false,
                error: Some(LOCK_COLLISION.to_string()),
                owner: Some(LockOwner { user_id: "A".to_string(), username: "Alice".to_string() }),
            },
            "lock_result",
            &["type", "room", "element_id", "success", "error", "owner"][..],
        ),
        (
            ServerMessage::LockResult {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
                success: true,
                error: None,
                owner: None,
            },
            "lock_result",
            &["type", "room", "element_id", "success"][..],
        ),
        (
            ServerMessage::UnlockResult {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
                success: true,
                error: None,
            },
            "unlock_result",
            &["type", "room", "element_id", "success"][..],
        ),
        (
            ServerMessage::ElementLocked { room: "doc-1".to_string(), lock: lock() },
            "element_locked",
            &["type", "room", "lock"][..],
        ),
        (
            ServerMessage::ElementUnlocked {
                room: "doc-1".to_string(),
                element_id: "shape-123".to_string(),
                user_id: "A".to_string(),
            },
            "element_unlocked",
            &["type", "room", "element_id", "user_id"][..],
        ),
        (
            ServerMessage::ActionApplied { room: "doc-1".to_string(), action: operation() },
            "action_applied",
            &["type", "room", "action"][..],
        ),
        (
            ServerMessage::ActionConflictResolved {
                room: "doc-1".to_string(),
                element_id: "shape-1".to_string(),
                winning_action: operation(),
            },
            "action_conflict_resolved",
            &["type", "room", "element_id", "winning_action"][..],
        ),
        (
            ServerMessage::ActionUndone { room: "doc-1".to_string(), action: operation() },
            "action_undone",
            &["type", "room", "action"][..],
        ),
        (
            ServerMessage::ActionRedone { room: "doc-1".to_string(), action: operation() },
            "action_redone",
            &["type", "room", "action"][..],
        ),
        (
            ServerMessage::UserJoined { room: "doc-1".to_string(), member: member() },
            "user_joined",
            &["type", "room", "member"][..],
        ),
        (
            ServerMessage::UserLeft { room: "doc-1".to_string(), user_id: "A".to_string() },
            "user_left",
            &["type", "room", "user_id"][..],
        ),
        (ServerMessage::Pong { server_time: 5 }, "pong", &["type", "server_time"][..]),
        (
            ServerMessage::error("INVALID_MESSAGE", "bad frame", false),
            "error",
            &["type", "code", "message", "retryable"][..],
        ),
    ];

    for (message, type_name, fields) in samples {
        let value = serde_json::to_value(&message).expect("server message should serialize");
        assert_eq!(value["type"], type_name);
        assert_eq!(keys(&value), expected(fields), "field set mismatch for {type_name}");
    }
}

#[test]
fn operation_payload_fields_match_contract() {
    let value = serde_json::to_value(operation()).expect("operation should serialize");
    assert_eq!(
        keys(&value),
        expected(&[
            "op_id",
            "room_id",
            "user_id",
            "element_id",
            "op_type",
            "before_state",
            "after_state",
            "server_timestamp",
        ])
    );
    assert_eq!(value["op_type"], "move");
}
