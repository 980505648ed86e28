//! Redis-backed message bus.
//!
//! Publishes and hash commands go through a shared `ConnectionManager`
//! (reconnects on its own). Each subscription owns a dedicated pub/sub
//! connection and a forwarding task; if that stream ends while the
//! subscriber is still alive, the task re-subscribes with unbounded backoff.
//!
//! Presence hashes may be namespaced with a key prefix when the Redis
//! instance is shared with other applications:
//!
//! ```rust,no_run
//! # use payload_mesh::bus::RedisBus;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Hash keys become "mesh:profiles", "mesh:lobby-1-profiles", ...
//! let bus = RedisBus::with_prefix("redis://localhost", 0, Some("mesh:")).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, IntoConnectionInfo, Script};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{BusError, BusMessage, MessageBus, Subscription};
use crate::resilience::retry::{retry, RetryConfig};

/// HSET guarded by the field's current value. ARGV: field, has-expected
/// flag, expected value, new value.
const HSET_IF: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
    if current ~= ARGV[3] then
        return 0
    end
elseif current then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

pub struct RedisBus {
    client: Client,
    connection: ConnectionManager,
    hset_if: Script,
    db_index: i64,
    prefix: String,
}

fn command_err(e: redis::RedisError) -> BusError {
    BusError::Command(e.to_string())
}

impl RedisBus {
    pub async fn new(connection_string: &str, db_index: i64) -> Result<Self, BusError> {
        Self::with_prefix(connection_string, db_index, None).await
    }

    pub async fn with_prefix(
        connection_string: &str,
        db_index: i64,
        prefix: Option<&str>,
    ) -> Result<Self, BusError> {
        let mut info = connection_string
            .into_connection_info()
            .map_err(|e| BusError::Connection(e.to_string()))?;
        info.redis.db = db_index;
        let client = Client::open(info).map_err(|e| BusError::Connection(e.to_string()))?;

        // Startup config: fail fast instead of hanging on a bad URL
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| BusError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            connection,
            hset_if: Script::new(HSET_IF),
            db_index,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

async fn open_pubsub(client: &Client, channels: &[String]) -> Result<PubSub, BusError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;
    for channel in channels {
        pubsub.subscribe(channel).await.map_err(command_err)?;
    }
    Ok(pubsub)
}

/// Forward messages until the subscriber goes away, re-subscribing on stream loss.
async fn forward(
    client: Client,
    channels: Vec<String>,
    mut pubsub: PubSub,
    tx: mpsc::UnboundedSender<BusMessage>,
) {
    loop {
        {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = msg.get_channel_name(), error = %e, "Dropping non-text bus message");
                        continue;
                    }
                };
                let message = BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).is_err() {
                    return;
                }
            }
        }

        if tx.is_closed() {
            return;
        }
        warn!(channels = ?channels, "Pub/sub stream ended, resubscribing");
        pubsub = match retry("redis_resubscribe", &RetryConfig::reconnect(), || {
            open_pubsub(&client, &channels)
        })
        .await
        {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Giving up on pub/sub resubscription");
                return;
            }
        };
        debug!(channels = ?channels, "Resubscribed");
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _receivers: i64 = conn.publish(channel, message).await.map_err(command_err)?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        let pubsub = open_pubsub(&self.client, channels).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(self.client.clone(), channels.to_vec(), pubsub, tx));
        Ok(Subscription::new(rx, Some(task)))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.connection.clone();
        conn.hget(self.prefixed_key(key), field).await.map_err(command_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hset(self.prefixed_key(key), field, value)
            .await
            .map_err(command_err)?;
        Ok(())
    }

    async fn hset_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, BusError> {
        let mut conn = self.connection.clone();
        let written: i64 = self
            .hset_if
            .key(self.prefixed_key(key))
            .arg(field)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(written == 1)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BusError> {
        let mut conn = self.connection.clone();
        conn.hgetall(self.prefixed_key(key)).await.map_err(command_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BusError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.hdel(self.prefixed_key(key), field).await.map_err(command_err)?;
        Ok(removed > 0)
    }

    fn db_index(&self) -> i64 {
        self.db_index
    }
}
