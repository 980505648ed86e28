//! In-process bus.
//!
//! One `MemoryBus` is shared (behind an `Arc`) by every node in a test, so
//! publishes on one node reach subscribers on the others. Delivery is
//! synchronous into each subscriber's queue, in publish order.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{BusError, BusMessage, MessageBus, Subscription};

struct Subscriber {
    channels: Vec<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

pub struct MemoryBus {
    subscribers: Mutex<Vec<Subscriber>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    available: AtomicBool,
    drop_messages: AtomicBool,
    published: AtomicUsize,
    races: Mutex<Vec<(String, String, String)>>,
    db_index: i64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            hashes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            drop_messages: AtomicBool::new(false),
            published: AtomicUsize::new(0),
            races: Mutex::new(Vec::new()),
            db_index: 0,
        }
    }

    /// While off, every call fails with [`BusError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Accept publishes but deliver nothing (lost messages).
    pub fn set_drop_messages(&self, drop: bool) {
        self.drop_messages.store(drop, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|s| !s.tx.is_closed()).count()
    }

    /// Land `value` in `key`/`field` right before the next conditional write
    /// to that field compares, as if another node wrote first.
    pub fn race_next_conditional_write(&self, key: &str, field: &str, value: &str) {
        self.races
            .lock()
            .push((key.to_string(), field.to_string(), value.to_string()));
    }

    /// Raw hash value, bypassing availability.
    pub fn hash_value(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.lock().get(key).and_then(|h| h.get(field).cloned())
    }

    fn check(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable)
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        self.check()?;
        self.published.fetch_add(1, Ordering::SeqCst);
        if self.drop_messages.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for sub in subscribers.iter().filter(|s| s.channels.iter().any(|c| c == channel)) {
            let _ = sub.tx.send(BusMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BusError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            channels: channels.to_vec(),
            tx,
        });
        Ok(Subscription::new(rx, None))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        self.check()?;
        Ok(self.hash_value(key, field))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        self.check()?;
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, BusError> {
        self.check()?;
        let raced = {
            let mut races = self.races.lock();
            races
                .iter()
                .position(|(k, f, _)| k == key && f == field)
                .map(|i| races.remove(i).2)
        };
        let mut hashes = self.hashes.lock();
        let hash = hashes.entry(key.to_string()).or_default();
        if let Some(foreign) = raced {
            hash.insert(field.to_string(), foreign);
        }
        if hash.get(field).map(String::as_str) != expected {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BusError> {
        self.check()?;
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, BusError> {
        self.check()?;
        Ok(self
            .hashes
            .lock()
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    fn db_index(&self) -> i64 {
        self.db_index
    }
}
