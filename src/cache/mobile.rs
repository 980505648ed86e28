//! Mobile payloads: presence tracking and ownership handoff.
//!
//! The host calls [`Cache::activate`] when an entity arrives on this node and
//! [`Cache::deactivate`] when it leaves. On simple caches (or standalone
//! mode) the presence side is skipped and handoff reports
//! [`HandoffOutcome::Standalone`].

use tracing::{debug, warn};

use super::{Cache, CacheKind};
use crate::handoff::{plan, HandoffOutcome, HandoffPlan};
use crate::metrics;
use crate::payload::{parse_key, Payload, PayloadRef};
use crate::presence::PresenceRecord;

impl<P: Payload> Cache<P> {
    pub fn is_mobile(&self) -> bool {
        self.inner.kind == CacheKind::Mobile
    }

    /// Keys activated on this node and not yet deactivated.
    pub fn active_keys(&self) -> Vec<P::Key> {
        self.inner.active.iter().map(|k| k.key().clone()).collect()
    }

    pub fn is_active(&self, key: &P::Key) -> bool {
        self.inner.active.contains(key)
    }

    pub async fn presence(&self, key: &P::Key) -> Option<PresenceRecord> {
        if !self.coordinates_handoff() {
            return None;
        }
        self.inner.presence.get(key).await
    }

    /// Live presence records across the fleet.
    pub async fn online_records(&self) -> Vec<PresenceRecord> {
        if !self.coordinates_handoff() {
            return Vec::new();
        }
        self.inner.presence.online().await
    }

    pub async fn online_keys(&self) -> Vec<P::Key> {
        self.online_records()
            .await
            .iter()
            .filter_map(|r| parse_key::<P::Key>(&r.identifier))
            .collect()
    }

    pub async fn online_names(&self) -> Vec<String> {
        self.online_records()
            .await
            .into_iter()
            .map(|r| r.last_known_name)
            .collect()
    }

    /// Make sure the durable copy of `key` is at least as fresh as any copy
    /// another live node holds, flushing it over the handshake channel if needed.
    pub async fn prepare_update(&self, key: &P::Key) -> HandoffOutcome {
        if !self.coordinates_handoff() {
            return HandoffOutcome::Standalone;
        }
        let record = self.inner.presence.get(key).await;
        self.prepare_with(key, record.as_ref()).await
    }

    async fn prepare_with(&self, key: &P::Key, record: Option<&PresenceRecord>) -> HandoffOutcome {
        let nodes = self.inner.database.nodes();
        let decision = plan(
            record,
            &nodes.this_node(),
            self.inner.presence.liveness(),
            |node| nodes.is_online(node),
        );
        match decision {
            HandoffPlan::Missing => {
                warn!(
                    cache = %self.inner.name,
                    key = %key,
                    reason = "presence_missing",
                    "No presence record; proceeding with local copy"
                );
                metrics::record_handoff(&self.inner.name, HandoffOutcome::PresenceMissing.as_str());
                HandoffOutcome::PresenceMissing
            }
            HandoffPlan::Proceed => {
                metrics::record_handoff(&self.inner.name, HandoffOutcome::AlreadyFresh.as_str());
                HandoffOutcome::AlreadyFresh
            }
            HandoffPlan::RequestFrom(owner) => {
                debug!(cache = %self.inner.name, key = %key, owner = %owner, "Requesting handoff");
                let outcome = self.inner.handoff.request_save(key, &owner, true).await;
                if outcome.should_reload() {
                    self.refresh_from_database(key, false).await;
                }
                outcome
            }
        }
    }

    /// The entity identified by `key` arrived on this node.
    ///
    /// Creates the presence record if needed, flushes the previous owner,
    /// loads (or creates) the payload and marks it online here. Returns
    /// `None` on simple caches.
    pub async fn activate(&self, key: &P::Key, name: &str) -> Option<PayloadRef<P>> {
        if !self.is_mobile() {
            self.inner.errors.debug("activate called on a simple cache");
            return None;
        }
        let node = self.inner.database.node_name();

        let record = if self.is_network() {
            let record = self.inner.presence.get_or_create(key, name).await;
            self.prepare_with(key, Some(&record)).await;
            Some(record)
        } else {
            None
        };

        let handle = self.get_or_create(key).await;
        {
            let mut guard = handle.write();
            guard.set_owning_node(&node);
            let meta = guard.meta_mut();
            meta.handshake_started_at = 0;
            meta.interact();
        }

        if let Some(mut record) = record {
            record.last_known_name = name.to_string();
            record.mark_loaded(true, &node);
            self.inner.presence.save(&record).await;
        }
        self.inner.active.insert(key.clone());
        Some(handle)
    }

    /// The entity left this node. Saves unless `switching_nodes` (or a
    /// handoff from this node is still valid), updates presence if this node
    /// is the recorded owner, and uncaches.
    pub async fn deactivate(&self, key: &P::Key, switching_nodes: bool) -> bool {
        if !self.is_mobile() {
            return false;
        }
        self.inner.active.remove(key);
        let Some(handle) = self.inner.local.peek(key) else {
            return false;
        };

        let validity = self.inner.database.config().handshake_validity();
        let switching = switching_nodes || handle.read().meta().has_valid_handshake(validity);
        let saved = if switching { true } else { self.save_no_cache(&handle).await };

        if self.is_network() {
            let node = self.inner.database.node_name();
            self.inner
                .presence
                .update_if_owned_by(key, &node, |record| record.mark_unloaded(switching))
                .await;
        }

        self.controller(key).uncache(switching);
        metrics::set_cached_items(&self.inner.name, self.inner.local.len());
        debug!(cache = %self.inner.name, key = %key, switching, saved, "Deactivated");
        saved
    }

    /// Refresh presence for every active payload this node still owns.
    pub async fn heartbeat_all(&self) -> usize {
        if !self.coordinates_handoff() {
            return 0;
        }
        let node = self.inner.database.node_name();
        let mut beats = 0;
        for key in self.active_keys() {
            if !self.inner.local.contains(&key) {
                continue;
            }
            if self
                .inner
                .presence
                .update_if_owned_by(&key, &node, PresenceRecord::heartbeat)
                .await
            {
                beats += 1;
            }
        }
        beats
    }

    pub(super) async fn mark_all_offline(&self) {
        let node = self.inner.database.node_name();
        for key in self.active_keys() {
            self.inner
                .presence
                .update_if_owned_by(&key, &node, |record| record.mark_unloaded(false))
                .await;
        }
    }

    pub(super) async fn record_saved(&self, key: &P::Key) {
        if !self.coordinates_handoff() || !self.inner.active.contains(key) {
            return;
        }
        let node = self.inner.database.node_name();
        let liveness = self.inner.presence.liveness();
        self.inner
            .presence
            .update_if_owned_by(key, &node, |record| record.mark_saved(&node, liveness))
            .await;
    }
}
