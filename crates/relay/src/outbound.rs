// Per-connection outbound buffer.
//
// Fan-out never awaits a socket write: producers push into this queue and the
// connection task drains it. The queue has a soft capacity. Once full, the
// oldest queued cursor update is evicted to make room; if none is queued an
// incoming cursor update is discarded instead. Every other message is always
// accepted, so lock and operation events are never lost to backpressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use easel_common::protocol::ws::ServerMessage;
use tokio::sync::Notify;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldestCursor,
    DroppedIncoming,
    Closed,
}

struct Inner {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Cloneable handle; all clones share one queue with a single consumer.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn push(&self, message: ServerMessage) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.inner.queue.lock().expect("outbound queue lock poisoned");
            if queue.len() < self.inner.capacity {
                queue.push_back(message);
                PushOutcome::Queued
            } else if let Some(position) = queue.iter().position(ServerMessage::is_lossy) {
                queue.remove(position);
                queue.push_back(message);
                PushOutcome::DroppedOldestCursor
            } else if message.is_lossy() {
                PushOutcome::DroppedIncoming
            } else {
                queue.push_back(message);
                PushOutcome::Queued
            }
        };

        match outcome {
            PushOutcome::DroppedOldestCursor | PushOutcome::DroppedIncoming => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cursor_updates_dropped();
            }
            _ => {}
        }
        if outcome != PushOutcome::DroppedIncoming {
            self.inner.notify.notify_one();
        }
        outcome
    }

    /// Next message in FIFO order. Returns `None` once the queue is closed
    /// and drained.
    pub async fn next(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("outbound queue lock poisoned");
                if let Some(message) = queue.pop_front() {
                    return Some(message);
                }
            }
            if self.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&self) -> Option<ServerMessage> {
        self.inner.queue.lock().expect("outbound queue lock poisoned").pop_front()
    }

    /// Stop accepting messages. Already queued messages can still be drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("outbound queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Drain everything currently queued; used by tests and diagnostics.
    pub fn drain(&self) -> Vec<ServerMessage> {
        self.inner.queue.lock().expect("outbound queue lock poisoned").drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cursor(x: f64) -> ServerMessage {
        ServerMessage::CursorUpdate {
            room: "doc-1".into(),
            user_id: "A".into(),
            username: "Alice".into(),
            color: "#e06c75".into(),
            x,
            y: 0.0,
            timestamp: 0,
        }
    }

    fn unlocked(element_id: &str) -> ServerMessage {
        ServerMessage::ElementUnlocked {
            room: "doc-1".into(),
            element_id: element_id.into(),
            user_id: "A".into(),
        }
    }

    #[test]
    fn full_queue_evicts_oldest_cursor_update() {
        let queue = OutboundQueue::new(2);
        assert_eq!(queue.push(cursor(1.0)), PushOutcome::Queued);
        assert_eq!(queue.push(unlocked("e1")), PushOutcome::Queued);
        assert_eq!(queue.push(cursor(2.0)), PushOutcome::DroppedOldestCursor);

        assert_eq!(queue.drain(), vec![unlocked("e1"), cursor(2.0)]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn non_lossy_messages_are_never_dropped() {
        let queue = OutboundQueue::new(1);
        assert_eq!(queue.push(unlocked("e1")), PushOutcome::Queued);
        assert_eq!(queue.push(unlocked("e2")), PushOutcome::Queued);
        assert_eq!(queue.push(cursor(1.0)), PushOutcome::DroppedIncoming);
        assert_eq!(queue.push(unlocked("e3")), PushOutcome::Queued);

        assert_eq!(queue.drain(), vec![unlocked("e1"), unlocked("e2"), unlocked("e3")]);
    }

    #[test]
    fn operation_event_evicts_a_cursor_when_full() {
        let queue = OutboundQueue::new(2);
        queue.push(cursor(1.0));
        queue.push(cursor(2.0));
        assert_eq!(queue.push(unlocked("e1")), PushOutcome::DroppedOldestCursor);
        assert_eq!(queue.drain(), vec![cursor(2.0), unlocked("e1")]);
    }

    #[test]
    fn closed_queue_rejects_pushes() {
        let queue = OutboundQueue::new(4);
        queue.close();
        assert_eq!(queue.push(unlocked("e1")), PushOutcome::Closed);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn next_wakes_on_push_and_ends_after_close() {
        let queue = OutboundQueue::new(4);
        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(message) = consumer.next().await {
                received.push(message);
            }
            received
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(unlocked("e1"));
        queue.push(unlocked("e2"));
        queue.close();

        let received = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer should finish")
            .expect("consumer task should not panic");
        assert_eq!(received, vec![unlocked("e1"), unlocked("e2")]);
    }
}
