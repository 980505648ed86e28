//! Message bus: pub/sub channels plus the shared hash store used for presence.
//!
//! - [`redis`]: production bus over a Redis `ConnectionManager`
//! - [`memory`]: in-process bus shared by several nodes in one test
//!
//! Delivery is best-effort. Subscribers receive messages through an unbounded
//! channel owned by a [`Subscription`]; dropping it ends the subscription.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection error: {0}")]
    Connection(String),
    #[error("Bus command failed: {0}")]
    Command(String),
    #[error("Bus unavailable")]
    Unavailable,
    #[error("Bus message codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Codec(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription to one or more channels.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<BusMessage>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { rx, forwarder }
    }

    /// Next message, or `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError>;
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError>;

    /// Set `field` only if its current value is exactly `expected` (`None`:
    /// only if absent). Returns whether the write happened.
    async fn hset_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, BusError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BusError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BusError>;

    /// Logical database index, second segment of channel names.
    fn db_index(&self) -> i64;
}

/// `{database}#{index}#{name}`
pub fn format_channel(database: &str, db_index: i64, name: &str) -> String {
    format!("{}#{}#{}", database, db_index, name)
}
