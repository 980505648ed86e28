// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ownership handoff for mobile payloads.
//!
//! When a mobile payload becomes active on a node while its presence record
//! says another live node still holds it, the new owner asks the old one to
//! flush to the durable store and waits (bounded) for the reply before
//! re-reading. Requests and replies share one channel per cache:
//!
//! ```text
//! {db}#{index}#payload-handshake-{cache}
//! ```
//!
//! Each request carries a fresh `requestId`; the waiter is a oneshot parked in
//! a map until the matching reply arrives, the timeout fires, or the waiting
//! future is dropped.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusError, MessageBus, Subscription};
use crate::database::Database;
use crate::error::ErrorSink;
use crate::metrics;
use crate::node::NodeRegistry;
use crate::payload::{now_millis, parse_key, PayloadKey};
use crate::presence::PresenceRecord;

pub const HANDSHAKE_CHANNEL_PREFIX: &str = "payload-handshake-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Request,
    Reply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffPacket {
    pub kind: PacketKind,
    pub sender_server: String,
    pub target_server: String,
    pub identifier: String,
    pub request_id: Uuid,
    /// Sent by the requester when the handoff is part of an activation.
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub saved: bool,
}

/// How `prepare_update` resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// Not a networked mobile cache; nothing to coordinate.
    Standalone,
    /// No live owner elsewhere, or the owner no longer held the payload.
    AlreadyFresh,
    /// The previous owner flushed and the durable copy was re-read.
    Flushed,
    TimedOut,
    PresenceMissing,
    RequestFailed,
}

impl HandoffOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::AlreadyFresh => "already_fresh",
            Self::Flushed => "flushed",
            Self::TimedOut => "handoff_timeout",
            Self::PresenceMissing => "presence_missing",
            Self::RequestFailed => "request_failed",
        }
    }

    /// Whether the durable copy should be re-read before continuing.
    pub fn should_reload(&self) -> bool {
        matches!(self, Self::Flushed)
    }
}

/// What the presence record says to do before using a payload here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffPlan {
    Missing,
    Proceed,
    RequestFrom(String),
}

/// Decide from a presence record whether another node must flush first.
pub fn plan(
    record: Option<&PresenceRecord>,
    this_node: &str,
    liveness: Duration,
    node_online: impl Fn(&str) -> bool,
) -> HandoffPlan {
    let Some(record) = record else {
        return HandoffPlan::Missing;
    };
    if !record.is_online_at(now_millis(), liveness) {
        return HandoffPlan::Proceed;
    }
    match record.last_seen_server.as_deref() {
        Some(owner) if !owner.eq_ignore_ascii_case(this_node) && node_online(owner) => {
            HandoffPlan::RequestFrom(owner.to_string())
        }
        _ => HandoffPlan::Proceed,
    }
}

/// An inbound packet, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundHandoff<K> {
    /// Another node wants this node to flush `key` and reply.
    Respond { key: K, request: HandoffPacket },
    /// A reply completed one of our pending requests.
    Resolved,
    Ignored,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, oneshot::Sender<bool>>,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct OwnershipHandoff<K: PayloadKey> {
    cache_name: String,
    channel: String,
    timeout: Duration,
    bus: Arc<dyn MessageBus>,
    nodes: Arc<NodeRegistry>,
    pending: DashMap<Uuid, oneshot::Sender<bool>>,
    errors: ErrorSink,
    _key: PhantomData<fn() -> K>,
}

impl<K: PayloadKey> OwnershipHandoff<K> {
    pub fn new(cache_name: &str, database: &Database, errors: ErrorSink) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            channel: database.channel_name(&format!("{}{}", HANDSHAKE_CHANNEL_PREFIX, cache_name)),
            timeout: database.config().handshake_timeout(),
            bus: Arc::clone(database.bus()),
            nodes: Arc::clone(database.nodes()),
            pending: DashMap::new(),
            errors,
            _key: PhantomData,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn subscribe(&self) -> Result<Subscription, BusError> {
        self.bus.subscribe(&[self.channel.clone()]).await
    }

    /// Ask `target` to flush `key` and wait for its reply.
    pub async fn request_save(&self, key: &K, target: &str, login: bool) -> HandoffOutcome {
        let request = HandoffPacket {
            kind: PacketKind::Request,
            sender_server: self.nodes.this_node(),
            target_server: target.to_string(),
            identifier: key.to_string(),
            request_id: Uuid::new_v4(),
            login,
            saved: false,
        };
        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(e) => {
                self.errors.capture_err(&e, "failed to encode handoff request");
                return self.finish(HandoffOutcome::RequestFailed, None);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.request_id, tx);
        let _guard = PendingGuard { pending: &self.pending, id: request.request_id };

        let started = Instant::now();
        if let Err(e) = self.bus.publish(&self.channel, &body).await {
            self.errors.capture_err(&e, &format!("failed to request handoff of '{}' from '{}'", key, target));
            return self.finish(HandoffOutcome::RequestFailed, None);
        }

        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => HandoffOutcome::Flushed,
            Ok(Ok(false)) => HandoffOutcome::AlreadyFresh,
            Ok(Err(_)) => HandoffOutcome::RequestFailed,
            Err(_) => {
                warn!(
                    cache = %self.cache_name,
                    key = %key,
                    target,
                    reason = "handoff_timeout",
                    "Previous owner did not confirm flush in time; using durable copy as-is"
                );
                HandoffOutcome::TimedOut
            }
        };
        self.finish(outcome, Some(started.elapsed()))
    }

    fn finish(&self, outcome: HandoffOutcome, elapsed: Option<Duration>) -> HandoffOutcome {
        metrics::record_handoff(&self.cache_name, outcome.as_str());
        if let Some(elapsed) = elapsed {
            metrics::record_handoff_latency(&self.cache_name, elapsed);
        }
        outcome
    }

    /// Classify a packet from the handshake channel. Replies are delivered to
    /// their waiter here.
    pub fn handle(&self, raw: &str) -> InboundHandoff<K> {
        let packet = match serde_json::from_str::<HandoffPacket>(raw) {
            Ok(p) => p,
            Err(e) => {
                self.errors.capture_err(&e, "dropping malformed handoff packet");
                return InboundHandoff::Ignored;
            }
        };
        if !self.nodes.is_this_node(&packet.target_server) {
            return InboundHandoff::Ignored;
        }

        match packet.kind {
            PacketKind::Reply => match self.pending.remove(&packet.request_id) {
                Some((_, tx)) => {
                    let _ = tx.send(packet.saved);
                    InboundHandoff::Resolved
                }
                None => {
                    debug!(cache = %self.cache_name, request_id = %packet.request_id, "Late handoff reply");
                    InboundHandoff::Ignored
                }
            },
            PacketKind::Request => match parse_key::<K>(&packet.identifier) {
                Some(key) => InboundHandoff::Respond { key, request: packet },
                None => {
                    self.errors.capture(&format!(
                        "handoff request from '{}' names unparseable key '{}'",
                        packet.sender_server, packet.identifier
                    ));
                    InboundHandoff::Ignored
                }
            },
        }
    }

    pub async fn reply(&self, request: &HandoffPacket, saved: bool) -> bool {
        let reply = HandoffPacket {
            kind: PacketKind::Reply,
            sender_server: self.nodes.this_node(),
            target_server: request.sender_server.clone(),
            identifier: request.identifier.clone(),
            request_id: request.request_id,
            login: request.login,
            saved,
        };
        let body = match serde_json::to_string(&reply) {
            Ok(body) => body,
            Err(e) => {
                self.errors.capture_err(&e, "failed to encode handoff reply");
                return false;
            }
        };
        match self.bus.publish(&self.channel, &body).await {
            Ok(()) => true,
            Err(e) => {
                self.errors.capture_err(&e, &format!("failed to reply to handoff from '{}'", request.sender_server));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::PayloadConfig;
    use crate::storage::MemoryDocumentBackend;

    const WINDOW: Duration = Duration::from_secs(60);

    fn handoff(node: &str, bus: Arc<MemoryBus>) -> Arc<OwnershipHandoff<u64>> {
        let db = Database::with_backends(
            PayloadConfig::for_tests(node),
            Arc::new(MemoryDocumentBackend::new()),
            bus,
        );
        Arc::new(OwnershipHandoff::new("profiles", &db, ErrorSink::new("profiles", true)))
    }

    fn online_on(node: &str) -> PresenceRecord {
        let mut r = PresenceRecord::new("1", "Alice");
        r.mark_loaded(true, node);
        r
    }

    #[test]
    fn test_plan() {
        let everyone = |_: &str| true;
        assert_eq!(plan(None, "hub", WINDOW, everyone), HandoffPlan::Missing);
        assert_eq!(plan(Some(&PresenceRecord::new("1", "A")), "hub", WINDOW, everyone), HandoffPlan::Proceed);
        assert_eq!(plan(Some(&online_on("HUB")), "hub", WINDOW, everyone), HandoffPlan::Proceed);
        assert_eq!(
            plan(Some(&online_on("lobby")), "hub", WINDOW, everyone),
            HandoffPlan::RequestFrom("lobby".into())
        );
        assert_eq!(plan(Some(&online_on("lobby")), "hub", WINDOW, |_| false), HandoffPlan::Proceed);

        let mut stale = online_on("lobby");
        stale.last_seen -= 61_000;
        assert_eq!(plan(Some(&stale), "hub", WINDOW, everyone), HandoffPlan::Proceed);
    }

    #[test]
    fn test_packet_wire_format() {
        let packet = HandoffPacket {
            kind: PacketKind::Request,
            sender_server: "hub".into(),
            target_server: "lobby".into(),
            identifier: "1".into(),
            request_id: Uuid::nil(),
            login: true,
            saved: false,
        };
        let v: serde_json::Value = serde_json::to_value(&packet).unwrap();
        assert_eq!(v["kind"], "request");
        assert_eq!(v["senderServer"], "hub");
        assert_eq!(v["targetServer"], "lobby");
        assert_eq!(v["requestId"], Uuid::nil().to_string());
    }

    #[tokio::test]
    async fn test_flush_round_trip() {
        let bus = Arc::new(MemoryBus::new());
        let hub = handoff("hub", bus.clone());
        let lobby = handoff("lobby", bus.clone());

        let mut lobby_sub = lobby.subscribe().await.unwrap();
        let mut hub_sub = hub.subscribe().await.unwrap();

        let responder = {
            let lobby = lobby.clone();
            tokio::spawn(async move {
                while let Some(msg) = lobby_sub.recv().await {
                    if let InboundHandoff::Respond { key, request } = lobby.handle(&msg.payload) {
                        assert_eq!(key, 1);
                        assert!(request.login);
                        lobby.reply(&request, true).await;
                        break;
                    }
                }
            })
        };
        let dispatcher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                while let Some(msg) = hub_sub.recv().await {
                    if hub.handle(&msg.payload) == InboundHandoff::Resolved {
                        break;
                    }
                }
            })
        };

        assert_eq!(hub.request_save(&1, "lobby", true).await, HandoffOutcome::Flushed);
        assert_eq!(hub.pending_count(), 0);
        responder.await.unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_owner_times_out() {
        let bus = Arc::new(MemoryBus::new());
        let hub = handoff("hub", bus);
        assert_eq!(hub.request_save(&1, "lobby", false).await, HandoffOutcome::TimedOut);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_the_wait_cancels() {
        let bus = Arc::new(MemoryBus::new());
        let hub = handoff("hub", bus);
        {
            let fut = hub.request_save(&1, "lobby", false);
            tokio::pin!(fut);
            let _ = tokio::time::timeout(Duration::from_millis(10), &mut fut).await;
            assert_eq!(hub.pending_count(), 1);
        }
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure() {
        let bus = Arc::new(MemoryBus::new());
        let hub = handoff("hub", bus.clone());
        bus.set_available(false);
        assert_eq!(hub.request_save(&1, "lobby", false).await, HandoffOutcome::RequestFailed);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_packets_for_other_nodes_are_ignored() {
        let hub = handoff("hub", Arc::new(MemoryBus::new()));
        let packet = HandoffPacket {
            kind: PacketKind::Request,
            sender_server: "lobby".into(),
            target_server: "arena".into(),
            identifier: "1".into(),
            request_id: Uuid::new_v4(),
            login: false,
            saved: false,
        };
        let raw = serde_json::to_string(&packet).unwrap();
        assert_eq!(hub.handle(&raw), InboundHandoff::Ignored);
        assert_eq!(hub.handle("garbage"), InboundHandoff::Ignored);

        let stray = HandoffPacket { kind: PacketKind::Reply, target_server: "hub".into(), ..packet };
        assert_eq!(hub.handle(&serde_json::to_string(&stray).unwrap()), InboundHandoff::Ignored);
    }
}
