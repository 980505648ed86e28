// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cached entity contract.
//!
//! A [`Payload`] is any serde-serializable struct with a stable key. Persisted
//! state is whatever serde writes; transient bookkeeping (timestamps, the
//! save-failed flag, where the instance was loaded from) lives in a
//! [`PayloadMeta`] that the implementor marks `#[serde(skip)]`.
//!
//! ```
//! use payload_mesh::{Payload, PayloadMeta};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Guild {
//!     id: String,
//!     tag: String,
//!     #[serde(skip)]
//!     meta: PayloadMeta,
//! }
//!
//! impl Payload for Guild {
//!     type Key = String;
//!     const ID_FIELD: &'static str = "id";
//!
//!     fn identifier(&self) -> String { self.id.clone() }
//!     fn name(&self) -> String { self.tag.clone() }
//!     fn meta(&self) -> &PayloadMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut PayloadMeta { &mut self.meta }
//! }
//!
//! assert_eq!(payload_mesh::payload::collection_name::<Guild>(), "Guild");
//! ```

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Keys must round-trip through their string form: that is how they travel
/// on the bus and how presence hashes are addressed.
pub trait PayloadKey: Clone + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static {}

impl<T> PayloadKey for T where T: Clone + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static {}

/// Parse a string-encoded key, `None` if it does not resolve.
pub fn parse_key<K: PayloadKey>(raw: &str) -> Option<K> {
    raw.parse::<K>().ok()
}

/// Shared handle to the single resident instance of a payload on this node.
///
/// Never hold the guard across an `.await`.
pub type PayloadRef<P> = Arc<RwLock<P>>;

pub fn new_ref<P>(payload: P) -> PayloadRef<P> {
    Arc::new(RwLock::new(payload))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Where an instance was last resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingSource {
    Local,
    Remote,
    Created,
}

impl std::fmt::Display for LoadingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Remote => write!(f, "Remote"),
            Self::Created => write!(f, "Created"),
        }
    }
}

/// Transient, never-persisted bookkeeping carried by every payload.
#[derive(Debug, Clone)]
pub struct PayloadMeta {
    pub cached_at: i64,
    pub last_interaction: i64,
    /// 0 until the first successful durable save
    pub last_save: i64,
    pub save_failed: bool,
    pub loading_source: Option<LoadingSource>,
    /// Set on the source node when it flushes for a handoff; 0 otherwise
    pub handshake_started_at: i64,
}

impl Default for PayloadMeta {
    fn default() -> Self {
        let now = now_millis();
        Self {
            cached_at: now,
            last_interaction: now,
            last_save: 0,
            save_failed: false,
            loading_source: None,
            handshake_started_at: 0,
        }
    }
}

impl PayloadMeta {
    pub fn interact(&mut self) {
        self.last_interaction = now_millis();
    }

    pub fn start_handshake(&mut self) {
        self.handshake_started_at = now_millis();
    }

    /// True while a handoff started on this node is still within its validity window.
    pub fn has_valid_handshake(&self, validity: Duration) -> bool {
        self.handshake_started_at > 0
            && now_millis() - self.handshake_started_at <= validity.as_millis() as i64
    }
}

/// A cacheable, persistable entity.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: PayloadKey;

    /// Document field holding the identifier.
    const ID_FIELD: &'static str;

    /// Collection override; defaults to the type's simple name.
    const COLLECTION: Option<&'static str> = None;

    /// Document field holding the owning node, used by node-scoped queries.
    const NODE_FIELD: &'static str = "payloadNode";

    /// Document field holding [`name`](Self::name), if lookups by name
    /// should reach the durable store.
    const NAME_FIELD: Option<&'static str> = None;

    fn identifier(&self) -> Self::Key;

    /// Human-readable name (display name for mobile payloads).
    fn name(&self) -> String;

    fn meta(&self) -> &PayloadMeta;
    fn meta_mut(&mut self) -> &mut PayloadMeta;

    fn owning_node(&self) -> Option<String> {
        None
    }

    fn set_owning_node(&mut self, _node: &str) {}

    /// Called after a sibling's update has been merged into this instance.
    fn on_receive_update(&mut self) {}

    /// Replace persisted state with `newer` while keeping this instance's
    /// transient metadata, so outstanding references see the new fields.
    fn merge_from(&mut self, newer: Self) {
        let meta = self.meta().clone();
        *self = newer;
        *self.meta_mut() = meta;
    }
}

/// Durable collection name for `P`.
pub fn collection_name<P: Payload>() -> String {
    if let Some(name) = P::COLLECTION {
        return name.to_string();
    }
    simple_type_name(std::any::type_name::<P>())
}

fn simple_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
