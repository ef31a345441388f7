// Core collaboration types shared between the relay and its clients.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Colours handed out to users whose credential carries none.
pub const PRESENCE_PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#d19a66", "#56b6c2", "#e5c07b", "#be5046",
];

/// Authenticated identity of a connected user.
///
/// Issued externally (by the token service) and cached per connection; never
/// mutated while the connection lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        color: Option<String>,
    ) -> Self {
        let user_id = user_id.into();
        let color = color
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| palette_color(&user_id).to_string());
        Self { user_id, display_name: display_name.into(), color }
    }
}

/// Deterministic palette colour for a user id (FNV-1a over the bytes).
pub fn palette_color(user_id: &str) -> &'static str {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    PRESENCE_PALETTE[(hash % PRESENCE_PALETTE.len() as u64) as usize]
}

/// A room member as rendered by clients (cursor + identity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberInfo {
    pub user_id: String,
    pub username: String,
    pub color: String,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub last_active_at: DateTime<Utc>,
    /// True on the requesting user's own entry in a join snapshot.
    #[serde(default)]
    pub is_current: bool,
}

/// An advisory lock on one element of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub element_id: String,
    pub owner_user_id: String,
    pub owner_username: String,
    pub acquired_at: DateTime<Utc>,
}

/// The owner reported back on a lock collision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Move,
    Delete,
}

impl OpType {
    /// The operation type that reverses this one.
    pub const fn inverse(self) -> Self {
        match self {
            Self::Create => Self::Delete,
            Self::Delete => Self::Create,
            Self::Update => Self::Update,
            Self::Move => Self::Move,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Move => "move",
            Self::Delete => "delete",
        }
    }
}

/// An action as submitted by a client, before the server stamps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub op_id: Uuid,
    pub element_id: String,
    pub op_type: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_state: Option<Value>,
}

/// A server-stamped edit operation. Immutable once logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub op_id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub element_id: String,
    pub op_type: OpType,
    #[serde(default)]
    pub before_state: Option<Value>,
    #[serde(default)]
    pub after_state: Option<Value>,
    /// Server receive time in unix milliseconds.
    pub server_timestamp: i64,
}

impl Operation {
    /// Strict total order used for conflict resolution: later server receive
    /// time wins, ties go to the lexicographically greater user id.
    pub fn order_key(&self) -> (i64, &str) {
        (self.server_timestamp, self.user_id.as_str())
    }

    pub fn wins_over(&self, other: &Operation) -> bool {
        self.order_key() > other.order_key()
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert unix milliseconds to a UTC timestamp, clamping out-of-range values
/// to the epoch.
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}
