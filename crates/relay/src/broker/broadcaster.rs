// Cross-Instance Broadcaster.
//
// Publishing never blocks room operations: events go into a bounded queue
// drained by a worker that retries with capped exponential backoff. On the
// receiving side, envelopes from this instance are skipped (no echo) and a
// bounded set of recent event ids suppresses broker redeliveries.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use easel_common::types::{LockInfo, MemberInfo, Operation};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{room_channel, Broker, BrokerError, BrokerMessage, MAX_ROOM_ID_BYTES, ROOM_PATTERN};
use crate::engine::SubmitKind;
use crate::metrics;
use crate::room::LiveMember;

const RECENT_EVENT_IDS: usize = 4096;
/// Envelope keys, event id, event tag and submit kind around an operation.
const ENVELOPE_RESERVE: usize = 512;
/// Worst-case JSON escaping of a string, per input byte (`\u00XX`).
const MAX_ESCAPE_FACTOR: usize = 6;

/// Room events replicated between instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    MemberJoined { member: MemberInfo, connection_id: Uuid },
    MemberLeft { user_id: String, connection_id: Uuid },
    CursorMoved { user_id: String, x: f64, y: f64, timestamp: i64 },
    ElementLocked { lock: LockInfo },
    ElementUnlocked { element_id: String, user_id: String },
    OperationSubmitted { operation: Operation, kind: SubmitKind },
    /// Locally owned presences of the origin instance, refreshing their TTL.
    Heartbeat { members: Vec<LiveMember> },
}

impl RoomEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::ElementLocked { .. } => "element_locked",
            Self::ElementUnlocked { .. } => "element_unlocked",
            Self::OperationSubmitted { .. } => "operation_submitted",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEnvelope {
    pub origin_instance: String,
    pub event_id: Uuid,
    pub room_id: String,
    pub event: RoomEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl PublishConfig {
    /// Exponential backoff for a 0-based retry attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16); // cap exponent to avoid overflow
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

struct Inner {
    instance_id: String,
    broker: Arc<dyn Broker>,
    queue: mpsc::Sender<RoomEnvelope>,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create the broadcaster and spawn its publish worker.
    pub fn start(
        instance_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        config: PublishConfig,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let worker = tokio::spawn(publish_worker(Arc::clone(&broker), rx, config));
        let broadcaster =
            Self { inner: Arc::new(Inner { instance_id: instance_id.into(), broker, queue }) };
        (broadcaster, worker)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Largest encoded operation that still fits one broker message once
    /// wrapped in an envelope for any valid room id. `None` when the broker
    /// has no limit.
    pub fn max_operation_bytes(&self) -> Option<usize> {
        let limit = self.inner.broker.max_payload_bytes()?;
        // The room id travels raw in the channel and escaped in the envelope.
        let room_id = MAX_ROOM_ID_BYTES * (1 + MAX_ESCAPE_FACTOR);
        let origin = self.inner.instance_id.len() * MAX_ESCAPE_FACTOR;
        Some(limit.saturating_sub(ENVELOPE_RESERVE + room_id + origin))
    }

    /// Enqueue an event for other instances. Returns false when the event was
    /// dropped because the publish queue is full or the worker has stopped.
    pub fn publish(&self, room_id: &str, event: RoomEvent) -> bool {
        let envelope = RoomEnvelope {
            origin_instance: self.inner.instance_id.clone(),
            event_id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            event,
        };
        let kind = envelope.event.kind();
        match self.inner.queue.try_send(envelope) {
            Ok(()) => true,
            Err(error) => {
                metrics::increment_broker_publish_dropped();
                warn!(room_id, event = kind, error = %error, "dropping room event for remote peers");
                false
            }
        }
    }

    /// Subscribe to every room channel. Call once at startup.
    pub async fn subscribe(&self) -> Result<RemoteEvents, BrokerError> {
        let receiver = self.inner.broker.psubscribe(ROOM_PATTERN).await?;
        Ok(RemoteEvents {
            receiver,
            instance_id: self.inner.instance_id.clone(),
            recent: RecentIds::new(RECENT_EVENT_IDS),
        })
    }
}

async fn publish_worker(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::Receiver<RoomEnvelope>,
    config: PublishConfig,
) {
    while let Some(envelope) = rx.recv().await {
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(error = %error, room_id = %envelope.room_id, "failed to encode room event");
                continue;
            }
        };
        let channel = room_channel(&envelope.room_id);

        let mut attempt = 0;
        loop {
            match broker.publish(&channel, &payload).await {
                Ok(()) => break,
                Err(error @ BrokerError::PayloadTooLarge { .. }) => {
                    metrics::increment_broker_publish_failures();
                    metrics::increment_broker_publish_dropped();
                    warn!(error = %error, room_id = %envelope.room_id, "room event not publishable");
                    break;
                }
                Err(error) => {
                    metrics::increment_broker_publish_failures();
                    attempt += 1;
                    if attempt >= config.max_attempts {
                        metrics::increment_broker_publish_dropped();
                        warn!(
                            error = %error,
                            room_id = %envelope.room_id,
                            event_id = %envelope.event_id,
                            attempts = attempt,
                            "giving up publishing room event"
                        );
                        break;
                    }
                    let delay = config.backoff_delay(attempt - 1);
                    debug!(error = %error, attempt, delay_ms = delay.as_millis() as u64, "retrying publish");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Stream of envelopes published by other instances.
pub struct RemoteEvents {
    receiver: mpsc::Receiver<BrokerMessage>,
    instance_id: String,
    recent: RecentIds,
}

impl RemoteEvents {
    /// Next foreign, not-yet-seen envelope. `None` once the broker
    /// subscription ends.
    pub async fn next(&mut self) -> Option<RoomEnvelope> {
        while let Some(message) = self.receiver.recv().await {
            let envelope = match serde_json::from_str::<RoomEnvelope>(&message.payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(channel = %message.channel, error = %error, "ignoring malformed room event");
                    continue;
                }
            };
            if envelope.origin_instance == self.instance_id {
                continue;
            }
            if !self.recent.insert(envelope.event_id) {
                debug!(event_id = %envelope.event_id, "ignoring redelivered room event");
                continue;
            }
            return Some(envelope);
        }
        None
    }
}

struct RecentIds {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self { ids: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Returns false if `id` was already seen.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}
