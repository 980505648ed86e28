//! Fleet-wide presence for mobile payloads.
//!
//! One bus hash per cache (key = the cache's optionally node-scoped name,
//! field = string-encoded identifier, value = JSON [`PresenceRecord`]).
//! The stored `online` flag is never trusted on its own: a record is live
//! only while it has been seen within the liveness window.
//!
//! Claiming a record (activation) is a plain write. Every other change goes
//! through [`PresenceRegistry::update_if_owned_by`], a compare-and-set on the
//! raw record, so a node never writes over a record another node has claimed
//! since it was read.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::error::ErrorSink;
use crate::payload::{now_millis, PayloadKey};

const UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identifier: String,
    #[serde(default)]
    pub last_seen_server: Option<String>,
    #[serde(default)]
    pub last_known_name: String,
    pub last_seen: i64,
    pub online: bool,
    #[serde(default)]
    pub last_cached: i64,
    #[serde(default)]
    pub last_saved: i64,
}

impl PresenceRecord {
    pub fn new(identifier: &str, name: &str) -> Self {
        let now = now_millis();
        Self {
            identifier: identifier.to_string(),
            last_seen_server: None,
            last_known_name: name.to_string(),
            last_seen: now,
            online: false,
            last_cached: now,
            last_saved: 0,
        }
    }

    pub fn is_online_at(&self, now: i64, window: Duration) -> bool {
        self.online && now - self.last_seen < window.as_millis() as i64
    }

    pub fn is_online(&self, window: Duration) -> bool {
        self.is_online_at(now_millis(), window)
    }

    pub fn last_seen_on(&self, node: &str) -> bool {
        self.last_seen_server
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case(node))
            .unwrap_or(false)
    }

    pub fn is_online_on(&self, node: &str, window: Duration) -> bool {
        self.is_online(window) && self.last_seen_on(node)
    }

    pub fn is_online_elsewhere(&self, node: &str, window: Duration) -> bool {
        self.is_online(window) && self.last_seen_server.is_some() && !self.last_seen_on(node)
    }

    pub fn mark_loaded(&mut self, online: bool, node: &str) {
        self.online = online;
        if online {
            self.last_seen_server = Some(node.to_string());
            self.last_seen = now_millis();
        }
    }

    /// `switching_nodes` keeps the record online while a handoff is in flight.
    pub fn mark_unloaded(&mut self, switching_nodes: bool) {
        self.online = switching_nodes;
        self.last_seen = now_millis();
    }

    pub fn heartbeat(&mut self) {
        let now = now_millis();
        self.last_cached = now;
        self.last_seen = now;
        self.online = true;
    }

    pub fn mark_saved(&mut self, node: &str, window: Duration) {
        let now = now_millis();
        self.last_saved = now;
        if self.is_online_on(node, window) {
            self.last_seen = now;
        }
    }
}

pub struct PresenceRegistry<K: PayloadKey> {
    hash_key: String,
    bus: Arc<dyn MessageBus>,
    liveness: Duration,
    errors: ErrorSink,
    _key: PhantomData<fn() -> K>,
}

impl<K: PayloadKey> PresenceRegistry<K> {
    pub fn new(hash_key: &str, bus: Arc<dyn MessageBus>, liveness: Duration, errors: ErrorSink) -> Self {
        Self {
            hash_key: hash_key.to_string(),
            bus,
            liveness,
            errors,
            _key: PhantomData,
        }
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    pub async fn get(&self, key: &K) -> Option<PresenceRecord> {
        self.get_versioned(key).await.map(|(record, _)| record)
    }

    /// The record together with the raw value it was decoded from, for use
    /// with [`save_if_unchanged`](Self::save_if_unchanged).
    pub async fn get_versioned(&self, key: &K) -> Option<(PresenceRecord, String)> {
        let raw = match self.bus.hget(&self.hash_key, &key.to_string()).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.errors.capture_err(&e, &format!("failed to read presence for '{}'", key));
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some((record, raw)),
            Err(e) => {
                self.errors.capture_err(&e, &format!("undecodable presence record for '{}'", key));
                None
            }
        }
    }

    /// Existing record, or a fresh offline one that is saved immediately.
    pub async fn get_or_create(&self, key: &K, name: &str) -> PresenceRecord {
        if let Some(mut record) = self.get(key).await {
            if record.last_known_name != name && !name.is_empty() {
                record.last_known_name = name.to_string();
            }
            return record;
        }
        let record = PresenceRecord::new(&key.to_string(), name);
        self.save(&record).await;
        record
    }

    pub async fn save(&self, record: &PresenceRecord) -> bool {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(e) => {
                self.errors.capture_err(&e, "failed to encode presence record");
                return false;
            }
        };
        match self.bus.hset(&self.hash_key, &record.identifier, &body).await {
            Ok(()) => true,
            Err(e) => {
                self.errors.capture_err(&e, &format!("failed to save presence for '{}'", record.identifier));
                false
            }
        }
    }

    /// Write `record` only if the stored value is still `previous`.
    ///
    /// `Some(false)` means someone else wrote in between; `None` means the
    /// write could not be attempted.
    pub async fn save_if_unchanged(&self, record: &PresenceRecord, previous: &str) -> Option<bool> {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(e) => {
                self.errors.capture_err(&e, "failed to encode presence record");
                return None;
            }
        };
        match self
            .bus
            .hset_if(&self.hash_key, &record.identifier, Some(previous), &body)
            .await
        {
            Ok(written) => Some(written),
            Err(e) => {
                self.errors.capture_err(&e, &format!("failed to save presence for '{}'", record.identifier));
                None
            }
        }
    }

    /// Apply `change` to `key`'s record while `node` is its recorded owner.
    ///
    /// Re-reads and re-checks ownership whenever a concurrent write wins the
    /// compare-and-set. Returns whether a write landed.
    pub async fn update_if_owned_by<F>(&self, key: &K, node: &str, change: F) -> bool
    where
        F: Fn(&mut PresenceRecord),
    {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some((mut record, raw)) = self.get_versioned(key).await else {
                return false;
            };
            if !record.last_seen_on(node) {
                return false;
            }
            change(&mut record);
            match self.save_if_unchanged(&record, &raw).await {
                Some(true) => return true,
                Some(false) => {
                    self.errors.debug(&format!("presence for '{}' changed underneath; re-reading", key));
                }
                None => return false,
            }
        }
        self.errors.capture(&format!(
            "gave up updating presence for '{}' after {} conflicting writes",
            key, UPDATE_ATTEMPTS
        ));
        false
    }

    pub async fn remove(&self, key: &K) -> bool {
        match self.bus.hdel(&self.hash_key, &key.to_string()).await {
            Ok(removed) => removed,
            Err(e) => {
                self.errors.capture_err(&e, &format!("failed to remove presence for '{}'", key));
                false
            }
        }
    }

    /// Records currently live anywhere in the fleet.
    pub async fn online(&self) -> Vec<PresenceRecord> {
        let all = match self.bus.hgetall(&self.hash_key).await {
            Ok(all) => all,
            Err(e) => {
                self.errors.capture_err(&e, "failed to list presence records");
                return Vec::new();
            }
        };
        let now = now_millis();
        all.values()
            .filter_map(|raw| serde_json::from_str::<PresenceRecord>(raw).ok())
            .filter(|r| r.is_online_at(now, self.liveness))
            .collect()
    }
}
