// Cross-instance pub/sub.
//
// The broker is the only integration point between relay instances. Room
// events are published to a channel derived from the room id and every
// instance pattern-subscribes to all room channels once at startup.

mod broadcaster;
mod memory;
mod postgres;

pub use broadcaster::{Broadcaster, PublishConfig, RemoteEvents, RoomEnvelope, RoomEvent};
pub use memory::MemoryBroker;
pub use postgres::PgBroker;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub const ROOM_CHANNEL_PREFIX: &str = "easel:room:";
pub const ROOM_PATTERN: &str = "easel:room:*";
/// Longest room id accepted from clients, in bytes.
pub const MAX_ROOM_ID_BYTES: usize = 128;

/// Buffer between a broker's receive loop and its subscriber.
const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("payload of {size} bytes exceeds broker limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Fire-and-forget pub/sub transport. Delivery is at-least-once at best.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to every channel matching a `*` glob pattern.
    async fn psubscribe(&self, pattern: &str)
        -> Result<mpsc::Receiver<BrokerMessage>, BrokerError>;

    /// Upper bound on channel plus payload bytes per message, if any.
    fn max_payload_bytes(&self) -> Option<usize> {
        None
    }
}

pub fn room_channel(room_id: &str) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Glob match where `*` matches any run of characters (including none).
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return channel.is_empty();
    };
    let Some(mut rest) = channel.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard: exact match.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_channels_share_a_prefix() {
        assert_eq!(room_channel("doc-1"), "easel:room:doc-1");
        assert!(channel_matches(ROOM_PATTERN, &room_channel("doc-1")));
        assert!(channel_matches(ROOM_PATTERN, &room_channel("")));
    }

    #[test]
    fn glob_matching() {
        assert!(channel_matches("a", "a"));
        assert!(!channel_matches("a", "ab"));
        assert!(channel_matches("*", "anything"));
        assert!(channel_matches("a*c", "abbbc"));
        assert!(!channel_matches("a*c", "abbb"));
        assert!(channel_matches("a*b*c", "a-b-c"));
        assert!(!channel_matches("a*b*c", "a-c"));
        assert!(!channel_matches(ROOM_PATTERN, "easel:user:1"));
    }
}
