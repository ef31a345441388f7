// Postgres LISTEN/NOTIFY broker.
//
// NOTIFY channels are plain identifiers, so every room shares one physical
// channel and the logical room channel travels inside the payload, framed as
// `<channel length>:<channel><payload>` so the payload is never re-escaped.
// Pattern filtering happens on the subscriber side.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{channel_matches, Broker, BrokerError, BrokerMessage, SUBSCRIBER_BUFFER};

pub const PG_NOTIFY_CHANNEL: &str = "easel_room_events";
/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
pub const PG_NOTIFY_MAX_PAYLOAD: usize = 7999;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let connect_options = database_url
            .parse::<PgConnectOptions>()
            .context("failed to parse relay PostgreSQL connection options")?;
        warn_without_tls(&connect_options);

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
            .connect_with(connect_options)
            .await
            .context("failed to connect to relay PostgreSQL")?;

        Ok(Self::new(pool))
    }

    pub async fn check_health(&self) -> anyhow::Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("relay PostgreSQL health check failed")?;
        Ok(())
    }
}

fn warn_without_tls(options: &PgConnectOptions) {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {}
        mode => warn!(
            ?mode,
            "relay PostgreSQL connection does not require TLS; room events travel in cleartext"
        ),
    }
}

fn encode_notification(channel: &str, payload: &str) -> Result<String, BrokerError> {
    let body = format!("{}:{channel}{payload}", channel.len());
    if body.len() > PG_NOTIFY_MAX_PAYLOAD {
        return Err(BrokerError::PayloadTooLarge { size: body.len(), limit: PG_NOTIFY_MAX_PAYLOAD });
    }
    Ok(body)
}

fn decode_notification(body: &str) -> Option<BrokerMessage> {
    let (length, rest) = body.split_once(':')?;
    let length: usize = length.parse().ok()?;
    if !rest.is_char_boundary(length) {
        return None;
    }
    let (channel, payload) = rest.split_at(length);
    Some(BrokerMessage { channel: channel.to_string(), payload: payload.to_string() })
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let body = encode_notification(channel, payload)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(PG_NOTIFY_CHANNEL)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<BrokerMessage>, BrokerError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(PG_NOTIFY_CHANNEL).await?;
        info!(channel = PG_NOTIFY_CHANNEL, pattern, "listening for room events");

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                // `recv` reconnects on its own after a lost connection.
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(message) = decode_notification(notification.payload()) else {
                            warn!("ignoring undecodable room notification");
                            continue;
                        };
                        if !channel_matches(&pattern, &message.channel) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(recv_error) => {
                        error!(error = %recv_error, "room event listener failed; retrying");
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn max_payload_bytes(&self) -> Option<usize> {
        Some(PG_NOTIFY_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_carries_logical_channel() {
        let body = encode_notification("easel:room:doc-1", "{\"x\":1}").expect("encodes");
        let message = decode_notification(&body).expect("decodes");
        assert_eq!(message.channel, "easel:room:doc-1");
        assert_eq!(message.payload, "{\"x\":1}");
    }

    #[test]
    fn oversized_notifications_are_rejected() {
        let payload = "x".repeat(PG_NOTIFY_MAX_PAYLOAD);
        assert!(matches!(
            encode_notification("easel:room:doc-1", &payload),
            Err(BrokerError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn payloads_are_carried_verbatim() {
        let payload = r#"{"room_id":"a:b","quote":"\""}"#;
        let body = encode_notification("easel:room:a:b", payload).expect("encodes");
        assert_eq!(body.len(), "14:".len() + "easel:room:a:b".len() + payload.len());

        let message = decode_notification(&body).expect("decodes");
        assert_eq!(message.channel, "easel:room:a:b");
        assert_eq!(message.payload, payload);
    }

    #[test]
    fn garbage_notifications_are_ignored() {
        assert!(decode_notification("not framed").is_none());
        assert!(decode_notification("x:easel").is_none());
        assert!(decode_notification("40:too short").is_none());
    }
}
