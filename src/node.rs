// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sibling node liveness.
//!
//! Every node announces itself on join, pings on a fixed interval, answers
//! pings, and announces on quit. A sibling is online only while its stored
//! flag is set *and* it has been heard from within the offline threshold;
//! silence alone is enough to consider it gone.
//!
//! Channels (each formatted as `{database}#{index}#{name}`):
//!
//! | name                         | payload                                   |
//! |------------------------------|-------------------------------------------|
//! | `payload-server-join`        | bare node name                            |
//! | `payload-server-ping`        | bare node name                            |
//! | `payload-server-ping-reply`  | `{"server", "sender"}`                    |
//! | `payload-server-quit`        | bare node name                            |
//! | `payload-server-update-name` | `{"old", "new"}`                          |
//! | `payload-server-event`       | `{"source", "destination"?, "event", "data"}` |
//! | `payload-player-event`       | `{"source", "identifier", "mustBeOnline", "event", "data"}` |

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{format_channel, BusError, BusMessage, MessageBus};
use crate::metrics;
use crate::payload::now_millis;

pub const CHANNEL_JOIN: &str = "payload-server-join";
pub const CHANNEL_PING: &str = "payload-server-ping";
pub const CHANNEL_PING_REPLY: &str = "payload-server-ping-reply";
pub const CHANNEL_QUIT: &str = "payload-server-quit";
pub const CHANNEL_UPDATE_NAME: &str = "payload-server-update-name";
pub const CHANNEL_NODE_EVENT: &str = "payload-server-event";
pub const CHANNEL_PLAYER_EVENT: &str = "payload-player-event";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub online: bool,
    pub last_ping: i64,
}

impl NodeRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            online: true,
            last_ping: now_millis(),
        }
    }

    /// Stored flag plus recency; a silent node is offline even if never marked.
    pub fn is_online_at(&self, now: i64, threshold: Duration) -> bool {
        self.online && now - self.last_ping <= threshold.as_millis() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PingReply {
    server: String,
    sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NameUpdate {
    old: String,
    new: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeEventMessage {
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerEventMessage {
    source: String,
    identifier: String,
    #[serde(default)]
    must_be_online: bool,
    event: String,
    #[serde(default)]
    data: Value,
}

/// What the registry observed, re-broadcast to local listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Joined(String),
    Quit(String),
    TimedOut(String),
    Renamed { old: String, new: String },
    Custom { source: String, event: String, data: Value },
    Player { source: String, identifier: String, must_be_online: bool, event: String, data: Value },
}

pub struct NodeRegistry {
    this_node: RwLock<String>,
    database: String,
    bus: Arc<dyn MessageBus>,
    nodes: DashMap<String, NodeRecord>,
    offline_threshold: Duration,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeRegistry {
    pub fn new(
        node_name: &str,
        database: &str,
        bus: Arc<dyn MessageBus>,
        offline_threshold: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            this_node: RwLock::new(node_name.to_string()),
            database: database.to_string(),
            bus,
            nodes: DashMap::new(),
            offline_threshold,
            events,
        }
    }

    pub fn this_node(&self) -> String {
        self.this_node.read().clone()
    }

    pub fn is_this_node(&self, name: &str) -> bool {
        self.this_node.read().eq_ignore_ascii_case(name)
    }

    pub fn channel(&self, name: &str) -> String {
        format_channel(&self.database, self.bus.db_index(), name)
    }

    pub fn channels(&self) -> Vec<String> {
        [
            CHANNEL_JOIN,
            CHANNEL_PING,
            CHANNEL_PING_REPLY,
            CHANNEL_QUIT,
            CHANNEL_UPDATE_NAME,
            CHANNEL_NODE_EVENT,
            CHANNEL_PLAYER_EVENT,
        ]
        .iter()
        .map(|c| self.channel(c))
        .collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NodeEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn record(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(&name.to_lowercase()).map(|r| r.clone())
    }

    /// This node is always online; siblings per their record.
    pub fn is_online(&self, name: &str) -> bool {
        if self.is_this_node(name) {
            return true;
        }
        self.record(name)
            .map(|r| r.is_online_at(now_millis(), self.offline_threshold))
            .unwrap_or(false)
    }

    pub fn online_nodes(&self) -> Vec<String> {
        let now = now_millis();
        self.nodes
            .iter()
            .filter(|r| r.is_online_at(now, self.offline_threshold))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Record liveness for `name`; returns true if it was unknown or offline.
    fn touch(&self, name: &str) -> bool {
        let now = now_millis();
        let mut entry = self
            .nodes
            .entry(name.to_lowercase())
            .or_insert_with(|| NodeRecord { online: false, ..NodeRecord::new(name) });
        let was_online = entry.is_online_at(now, self.offline_threshold);
        entry.online = true;
        entry.last_ping = now;
        entry.name = name.to_string();
        !was_online
    }

    pub fn handle_join(&self, name: &str) {
        if self.is_this_node(name) {
            return;
        }
        self.touch(name);
        info!(node = name, "Node joined");
        self.emit(NodeEvent::Joined(name.to_string()));
    }

    /// Unknown pingers count as a join; every ping is answered.
    pub async fn handle_ping(&self, name: &str) {
        if self.is_this_node(name) {
            return;
        }
        if self.touch(name) {
            info!(node = name, "Node discovered via ping");
            self.emit(NodeEvent::Joined(name.to_string()));
        }
        let reply = PingReply {
            server: self.this_node(),
            sender: name.to_string(),
        };
        self.publish_json(CHANNEL_PING_REPLY, &reply).await;
    }

    fn handle_ping_reply(&self, raw: &str) {
        match serde_json::from_str::<PingReply>(raw) {
            Ok(reply) if !self.is_this_node(&reply.server) => {
                if self.touch(&reply.server) {
                    self.emit(NodeEvent::Joined(reply.server.clone()));
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dropping malformed ping reply"),
        }
    }

    pub fn handle_quit(&self, name: &str) {
        if self.is_this_node(name) {
            return;
        }
        if let Some(mut record) = self.nodes.get_mut(&name.to_lowercase()) {
            record.online = false;
        }
        info!(node = name, "Node quit");
        self.emit(NodeEvent::Quit(name.to_string()));
    }

    fn handle_update_name(&self, raw: &str) {
        let update = match serde_json::from_str::<NameUpdate>(raw) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "Dropping malformed name update");
                return;
            }
        };
        if self.is_this_node(&update.new) {
            return;
        }
        let previous = self.nodes.remove(&update.old.to_lowercase()).map(|(_, r)| r);
        let mut record = previous.unwrap_or_else(|| NodeRecord::new(&update.new));
        record.name = update.new.clone();
        record.last_ping = now_millis();
        record.online = true;
        self.nodes.insert(update.new.to_lowercase(), record);
        info!(old = %update.old, new = %update.new, "Node renamed");
        self.emit(NodeEvent::Renamed { old: update.old, new: update.new });
    }

    fn handle_node_event(&self, raw: &str) {
        let msg = match serde_json::from_str::<NodeEventMessage>(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Dropping malformed node event");
                return;
            }
        };
        let for_us = msg.destination.as_deref().map(|d| self.is_this_node(d)).unwrap_or(true);
        if for_us {
            self.emit(NodeEvent::Custom { source: msg.source, event: msg.event, data: msg.data });
        }
    }

    fn handle_player_event(&self, raw: &str) {
        match serde_json::from_str::<PlayerEventMessage>(raw) {
            Ok(msg) => self.emit(NodeEvent::Player {
                source: msg.source,
                identifier: msg.identifier,
                must_be_online: msg.must_be_online,
                event: msg.event,
                data: msg.data,
            }),
            Err(e) => warn!(error = %e, "Dropping malformed player event"),
        }
    }

    /// Dispatch one inbound bus message.
    pub async fn handle_message(&self, msg: &BusMessage) {
        let Some(kind) = msg.channel.rsplit('#').next() else {
            return;
        };
        metrics::record_node_message(kind);
        match kind {
            CHANNEL_JOIN => self.handle_join(&msg.payload),
            CHANNEL_PING => self.handle_ping(&msg.payload).await,
            CHANNEL_PING_REPLY => self.handle_ping_reply(&msg.payload),
            CHANNEL_QUIT => self.handle_quit(&msg.payload),
            CHANNEL_UPDATE_NAME => self.handle_update_name(&msg.payload),
            CHANNEL_NODE_EVENT => self.handle_node_event(&msg.payload),
            CHANNEL_PLAYER_EVENT => self.handle_player_event(&msg.payload),
            other => debug!(channel = other, "Ignoring message on unknown node channel"),
        }
    }

    /// Mark siblings silent past the threshold as offline.
    pub fn expire(&self, now: i64) -> Vec<String> {
        let cutoff = now - self.offline_threshold.as_millis() as i64;
        let mut expired = Vec::new();
        for mut record in self.nodes.iter_mut() {
            if record.online && record.last_ping <= cutoff {
                record.online = false;
                expired.push(record.name.clone());
            }
        }
        for name in &expired {
            warn!(node = %name, "Node timed out");
            self.emit(NodeEvent::TimedOut(name.clone()));
        }
        expired
    }

    async fn publish_raw(&self, channel: &str, payload: &str) -> bool {
        match self.bus.publish(&self.channel(channel), payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel, error = %e, "Failed to publish node message");
                false
            }
        }
    }

    async fn publish_json<T: Serialize>(&self, channel: &str, body: &T) -> bool {
        match serde_json::to_string(body) {
            Ok(payload) => self.publish_raw(channel, &payload).await,
            Err(e) => {
                warn!(channel, error = %e, "Failed to encode node message");
                false
            }
        }
    }

    pub async fn publish_join(&self) -> bool {
        self.publish_raw(CHANNEL_JOIN, &self.this_node()).await
    }

    pub async fn publish_ping(&self) -> bool {
        self.publish_raw(CHANNEL_PING, &self.this_node()).await
    }

    pub async fn publish_quit(&self) -> bool {
        self.publish_raw(CHANNEL_QUIT, &self.this_node()).await
    }

    /// Rename this node and tell the fleet.
    pub async fn rename(&self, new_name: &str) -> bool {
        let old = std::mem::replace(&mut *self.this_node.write(), new_name.to_string());
        self.publish_json(CHANNEL_UPDATE_NAME, &NameUpdate { old, new: new_name.to_string() })
            .await
    }

    /// Send an event to one node, or to all when `destination` is `None`.
    pub async fn publish_node_event(&self, destination: Option<&str>, event: &str, data: Value) -> bool {
        let msg = NodeEventMessage {
            source: self.this_node(),
            destination: destination.map(str::to_string),
            event: event.to_string(),
            data,
        };
        self.publish_json(CHANNEL_NODE_EVENT, &msg).await
    }

    pub async fn publish_player_event(
        &self,
        identifier: &str,
        must_be_online: bool,
        event: &str,
        data: Value,
    ) -> bool {
        let msg = PlayerEventMessage {
            source: self.this_node(),
            identifier: identifier.to_string(),
            must_be_online,
            event: event.to_string(),
            data,
        };
        self.publish_json(CHANNEL_PLAYER_EVENT, &msg).await
    }

    /// One ping round: announce, then expire silent siblings.
    pub async fn tick(&self) {
        self.publish_ping().await;
        self.expire(now_millis());
        metrics::set_nodes_online(self.online_nodes().len());
    }

    /// Subscribe, announce, and run the ping loop until `shutdown` flips.
    pub async fn start(
        self: &Arc<Self>,
        ping_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe(&self.channels()).await?;
        self.publish_join().await;
        info!(node = %self.this_node(), "Node registry started");

        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    msg = subscription.recv() => match msg {
                        Some(msg) => registry.handle_message(&msg).await,
                        None => {
                            warn!("Node channel subscription closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => registry.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Node registry loop stopped");
        }))
    }
}
