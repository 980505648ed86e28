// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-node update notifications.
//!
//! After a durable write, a node publishes a small message on the cache's
//! updater channel. Receivers decide what to do with [`UpdatePropagator::interpret`]:
//!
//! 1. messages from this node are ignored
//! 2. deletes drop the key, but only if it is resident
//! 3. updates refresh the key if it is resident, or unconditionally when forced
//!
//! The refresh itself (durable read + field merge) is carried out by the
//! owning cache. Delivery is best-effort; a lost message only leaves a
//! sibling stale until its next read or update.
//!
//! Wire format:
//!
//! ```json
//! {"sourceServer": "lobby-1", "identifier": "3f2a...", "forceLoad": false, "isDelete": false}
//! ```

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bus::{BusError, MessageBus, Subscription};
use crate::database::Database;
use crate::error::ErrorSink;
use crate::metrics;
use crate::node::NodeRegistry;
use crate::payload::{parse_key, PayloadKey};

pub const UPDATER_CHANNEL_PREFIX: &str = "payload-updater-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "sourceServer")]
    pub source_node: String,
    pub identifier: String,
    #[serde(rename = "forceLoad", default)]
    pub force_load: bool,
    #[serde(rename = "isDelete", default)]
    pub is_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    SelfOrigin,
    Malformed,
    UnknownKey,
    NotCached,
}

impl IgnoreReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SelfOrigin => "self_origin",
            Self::Malformed => "malformed",
            Self::UnknownKey => "unknown_key",
            Self::NotCached => "not_cached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction<K> {
    Ignore(IgnoreReason),
    Uncache(K),
    Refresh { key: K, forced: bool },
}

pub struct UpdatePropagator<K: PayloadKey> {
    cache_name: String,
    channel: String,
    enabled: bool,
    bus: Arc<dyn MessageBus>,
    nodes: Arc<NodeRegistry>,
    errors: ErrorSink,
    _key: PhantomData<fn() -> K>,
}

impl<K: PayloadKey> UpdatePropagator<K> {
    pub fn new(cache_name: &str, database: &Database, enabled: bool, errors: ErrorSink) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            channel: database.channel_name(&format!("{}{}", UPDATER_CHANNEL_PREFIX, cache_name)),
            enabled,
            bus: Arc::clone(database.bus()),
            nodes: Arc::clone(database.nodes()),
            errors,
            _key: PhantomData,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Announce a changed key. A disabled propagator succeeds without sending.
    pub async fn push_update(&self, key: &K, force: bool) -> bool {
        self.publish(key, force, false).await
    }

    /// Announce a deleted key.
    pub async fn push_delete(&self, key: &K) -> bool {
        self.publish(key, true, true).await
    }

    async fn publish(&self, key: &K, force_load: bool, is_delete: bool) -> bool {
        if !self.enabled {
            self.errors.debug("updater disabled; skipping publish");
            return true;
        }
        let message = UpdateMessage {
            source_node: self.nodes.this_node(),
            identifier: key.to_string(),
            force_load,
            is_delete,
        };
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                self.errors.capture_err(&e, "failed to encode update message");
                return false;
            }
        };
        match self.bus.publish(&self.channel, &body).await {
            Ok(()) => {
                metrics::record_update_message(&self.cache_name, "outbound", if is_delete { "delete" } else { "update" });
                true
            }
            Err(e) => {
                metrics::record_update_message(&self.cache_name, "outbound", "error");
                self.errors.capture_err(&e, &format!("failed to publish update for '{}'", key));
                false
            }
        }
    }

    pub async fn subscribe(&self) -> Result<Subscription, BusError> {
        self.bus.subscribe(&[self.channel.clone()]).await
    }

    /// Decide what an inbound message means for this node.
    pub fn interpret(&self, raw: &str, is_cached: impl Fn(&K) -> bool) -> UpdateAction<K> {
        let action = self.decide(raw, is_cached);
        let outcome = match &action {
            UpdateAction::Ignore(reason) => reason.as_str(),
            UpdateAction::Uncache(_) => "uncache",
            UpdateAction::Refresh { .. } => "refresh",
        };
        metrics::record_update_message(&self.cache_name, "inbound", outcome);
        action
    }

    fn decide(&self, raw: &str, is_cached: impl Fn(&K) -> bool) -> UpdateAction<K> {
        let message = match serde_json::from_str::<UpdateMessage>(raw) {
            Ok(m) => m,
            Err(e) => {
                self.errors.capture_err(&e, "dropping malformed update message");
                return UpdateAction::Ignore(IgnoreReason::Malformed);
            }
        };

        if self.nodes.is_this_node(&message.source_node) {
            return UpdateAction::Ignore(IgnoreReason::SelfOrigin);
        }

        let Some(key) = parse_key::<K>(&message.identifier) else {
            self.errors.capture(&format!(
                "update from '{}' names unparseable key '{}'",
                message.source_node, message.identifier
            ));
            return UpdateAction::Ignore(IgnoreReason::UnknownKey);
        };

        let cached = is_cached(&key);
        if message.is_delete {
            return if cached {
                UpdateAction::Uncache(key)
            } else {
                UpdateAction::Ignore(IgnoreReason::NotCached)
            };
        }
        if cached || message.force_load {
            UpdateAction::Refresh { key, forced: message.force_load }
        } else {
            UpdateAction::Ignore(IgnoreReason::NotCached)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::PayloadConfig;
    use crate::storage::MemoryDocumentBackend;

    fn propagator(node: &str, bus: Arc<MemoryBus>, enabled: bool) -> UpdatePropagator<u64> {
        let db = Database::with_backends(
            PayloadConfig::for_tests(node),
            Arc::new(MemoryDocumentBackend::new()),
            bus,
        );
        UpdatePropagator::new("accounts", &db, enabled, ErrorSink::new("accounts", true))
    }

    fn message(source: &str, id: &str, force: bool, delete: bool) -> String {
        serde_json::to_string(&UpdateMessage {
            source_node: source.into(),
            identifier: id.into(),
            force_load: force,
            is_delete: delete,
        })
        .unwrap()
    }

    #[test]
    fn test_wire_format() {
        let raw = message("lobby", "7", true, false);
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["sourceServer"], "lobby");
        assert_eq!(v["identifier"], "7");
        assert_eq!(v["forceLoad"], true);
        assert_eq!(v["isDelete"], false);

        // Flags default to false when absent
        let m: UpdateMessage = serde_json::from_str(r#"{"sourceServer":"a","identifier":"1"}"#).unwrap();
        assert!(!m.force_load && !m.is_delete);
    }

    #[tokio::test]
    async fn test_channel_name() {
        let p = propagator("hub", Arc::new(MemoryBus::new()), true);
        assert_eq!(p.channel(), "test#0#payload-updater-accounts");
    }

    #[tokio::test]
    async fn test_decision_table() {
        let p = propagator("hub", Arc::new(MemoryBus::new()), true);
        let cached = |k: &u64| *k == 1;

        assert_eq!(p.interpret(&message("HUB", "1", true, false), cached), UpdateAction::Ignore(IgnoreReason::SelfOrigin));
        assert_eq!(p.interpret(&message("lobby", "1", false, true), cached), UpdateAction::Uncache(1));
        assert_eq!(p.interpret(&message("lobby", "2", true, true), cached), UpdateAction::Ignore(IgnoreReason::NotCached));
        assert_eq!(p.interpret(&message("lobby", "1", false, false), cached), UpdateAction::Refresh { key: 1, forced: false });
        assert_eq!(p.interpret(&message("lobby", "2", false, false), cached), UpdateAction::Ignore(IgnoreReason::NotCached));
        assert_eq!(p.interpret(&message("lobby", "2", true, false), cached), UpdateAction::Refresh { key: 2, forced: true });
    }

    #[tokio::test]
    async fn test_protocol_anomalies_are_dropped() {
        let p = propagator("hub", Arc::new(MemoryBus::new()), true);
        let always = |_: &u64| true;
        assert_eq!(p.interpret("{not json", always), UpdateAction::Ignore(IgnoreReason::Malformed));
        assert_eq!(p.interpret(r#"{"identifier":"1"}"#, always), UpdateAction::Ignore(IgnoreReason::Malformed));
        assert_eq!(p.interpret(&message("lobby", "abc", false, false), always), UpdateAction::Ignore(IgnoreReason::UnknownKey));
    }

    #[tokio::test]
    async fn test_push_publishes_and_delete_forces() {
        let bus = Arc::new(MemoryBus::new());
        let p = propagator("hub", bus.clone(), true);
        let mut sub = p.subscribe().await.unwrap();

        assert!(p.push_delete(&9).await);
        let msg: UpdateMessage = serde_json::from_str(&sub.recv().await.unwrap().payload).unwrap();
        assert_eq!(msg.source_node, "hub");
        assert_eq!(msg.identifier, "9");
        assert!(msg.force_load && msg.is_delete);
    }

    #[tokio::test]
    async fn test_disabled_is_noop_success() {
        let bus = Arc::new(MemoryBus::new());
        let p = propagator("hub", bus.clone(), false);
        assert!(p.push_update(&1, true).await);
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_bus_outage_reports_failure() {
        let bus = Arc::new(MemoryBus::new());
        let p = propagator("hub", bus.clone(), true);
        bus.set_available(false);
        assert!(!p.push_update(&1, false).await);
    }
}
