//! Redis-backed [`EphemeralStore`].
//!
//! Commands run over one multiplexed connection shared by every clone of the
//! store. Each pattern subscription opens a dedicated pub/sub connection whose
//! messages a background task forwards into the [`PatternSubscription`].

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use super::EphemeralStore;
use super::EphemeralStoreError;
use super::PatternSubscription;
use super::PubSubMessage;
use super::SUBSCRIPTION_BUFFER;

impl From<redis::RedisError> for EphemeralStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            EphemeralStoreError::Timeout { duration_ms: 0 }
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            EphemeralStoreError::Unavailable { reason: err.to_string() }
        } else {
            EphemeralStoreError::Failed { reason: err.to_string() }
        }
    }
}

#[derive(Clone)]
pub struct RedisEphemeralStore {
    client: redis::Client,
    connection: redis::aio::MultiplexedConnection,
}

impl RedisEphemeralStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, EphemeralStoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        debug!(url, "connected to redis");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EphemeralStoreError> {
        let mut conn = self.connection.clone();
        // EX 0 is rejected by the server.
        let ttl_secs = ttl_secs.max(1);
        let _: () = redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs).query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, EphemeralStoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, EphemeralStoreError> {
        let mut conn = self.connection.clone();
        let receivers: u64 = redis::cmd("PUBLISH").arg(channel).arg(message).query_async(&mut conn).await?;
        Ok(receivers)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PatternSubscription, EphemeralStoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let owned_pattern = pattern.to_string();
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            tokio::pin!(messages);
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(
                            pattern = %owned_pattern,
                            channel = %channel,
                            error = %err,
                            "dropping non-text pub/sub payload"
                        );
                        continue;
                    }
                };
                if sender.send(PubSubMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            debug!(pattern = %owned_pattern, "redis pattern subscription closed");
        });

        Ok(PatternSubscription::new(pattern, receiver))
    }
}
