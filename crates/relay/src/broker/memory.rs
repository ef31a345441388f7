use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{channel_matches, Broker, BrokerError, BrokerMessage, SUBSCRIBER_BUFFER};

const DEFAULT_CAPACITY: usize = 4096;

/// In-process broker over `tokio::sync::broadcast`.
///
/// Clones share one bus, so several hubs in one process (tests, single-node
/// deployments) see each other's events exactly as separate instances would.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    available: Arc<AtomicBool>,
    payload_limit: Option<usize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, available: Arc::new(AtomicBool::new(true)), payload_limit: None }
    }

    /// Reject messages whose channel plus payload exceed `limit` bytes, the
    /// way a size-capped transport would.
    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = Some(limit);
        self
    }

    /// Simulate an outage: publishes fail until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker disabled".into()));
        }
        if let Some(limit) = self.payload_limit {
            let size = channel.len() + payload.len();
            if size > limit {
                return Err(BrokerError::PayloadTooLarge { size, limit });
            }
        }

        let message = BrokerMessage { channel: channel.to_string(), payload: payload.to_string() };
        if let Err(error) = self.sender.send(message) {
            // No subscribers; the event is simply not observed by anyone.
            debug!(channel, error = %error, "memory broker has no subscribers");
        }
        Ok(())
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if !channel_matches(&pattern, &message.channel) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, pattern = %pattern, "memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        self.payload_limit
    }
}
