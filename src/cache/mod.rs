// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cache façade.
//!
//! A [`Cache`] ties one payload type to the two storage layers, the per-key
//! controllers and, in network mode, the update, presence and handoff
//! channels. Handles are cheap clones of one shared inner state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Cache<P>                        │
//! │                                                      │
//! │  get(key) ──► Controller ──► LocalStore (DashMap)    │
//! │                   │                                  │
//! │                   └─ miss ─► RemoteStore ──► backend │
//! │                                                      │
//! │  save(h) ──► LocalStore ──► RemoteStore ──► notify   │
//! │                                                      │
//! │  listeners (hold Weak<inner>):                       │
//! │    updater · handoff · heartbeat · auto-save         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! # use payload_mesh::{Cache, CacheBuilder, CacheSettings, Database, Payload, PayloadMeta};
//! # use serde::{Deserialize, Serialize};
//! # use std::sync::Arc;
//! # #[derive(Debug, Clone, Serialize, Deserialize)]
//! # struct Guild { id: String, tag: String, #[serde(skip)] meta: PayloadMeta }
//! # impl Payload for Guild {
//! #     type Key = String;
//! #     const ID_FIELD: &'static str = "id";
//! #     fn identifier(&self) -> String { self.id.clone() }
//! #     fn name(&self) -> String { self.tag.clone() }
//! #     fn meta(&self) -> &PayloadMeta { &self.meta }
//! #     fn meta_mut(&mut self) -> &mut PayloadMeta { &mut self.meta }
//! # }
//! # async fn example(database: Arc<Database>) -> Result<(), payload_mesh::CacheError> {
//! let guilds: Cache<Guild> = CacheBuilder::new("guilds", database)
//!     .settings(CacheSettings::default())
//!     .instantiator(|id: &String| Guild { id: id.clone(), tag: String::new(), meta: PayloadMeta::default() })
//!     .build()?;
//! guilds.start().await?;
//!
//! let guild = guilds.get_or_create(&"g1".to_string()).await;
//! guild.write().tag = "ABC".into();
//! guilds.save_and_update(&guild).await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod mobile;
pub mod singleton;
mod types;

pub use singleton::{SingletonCache, Slot};
pub use types::{CacheKind, CacheMode, CacheState};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CacheSettings;
use crate::controller::Controller;
use crate::database::Database;
use crate::error::{CacheError, ErrorSink};
use crate::handoff::OwnershipHandoff;
use crate::metrics;
use crate::names::NameIndex;
use crate::payload::{new_ref, now_millis, LoadingSource, Payload, PayloadRef};
use crate::presence::PresenceRegistry;
use crate::storage::{Filter, LocalStore, QueryModifier, RemoteStore, Store};
use crate::update::UpdatePropagator;

/// Factory for payloads that do not exist yet.
pub type Instantiator<P> = Arc<dyn Fn(&<P as Payload>::Key) -> P + Send + Sync>;

pub struct CacheBuilder<P: Payload> {
    name: String,
    database: Arc<Database>,
    settings: CacheSettings,
    kind: CacheKind,
    dependencies: Vec<String>,
    instantiator: Option<Instantiator<P>>,
    modifiers: Vec<QueryModifier>,
    collection: Option<String>,
}

impl<P: Payload> CacheBuilder<P> {
    pub fn new(name: impl Into<String>, database: Arc<Database>) -> Self {
        Self {
            name: name.into(),
            database,
            settings: CacheSettings::default(),
            kind: CacheKind::Simple,
            dependencies: Vec::new(),
            instantiator: None,
            modifiers: Vec::new(),
            collection: None,
        }
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Payloads follow an entity between nodes (presence + handoff).
    pub fn mobile(mut self) -> Self {
        self.kind = CacheKind::Mobile;
        self
    }

    /// Start after, and shut down before, the named cache.
    pub fn depends_on(mut self, cache: impl Into<String>) -> Self {
        let cache = cache.into();
        if !self.dependencies.contains(&cache) {
            self.dependencies.push(cache);
        }
        self
    }

    pub fn instantiator<F>(mut self, factory: F) -> Self
    where
        F: Fn(&P::Key) -> P + Send + Sync + 'static,
    {
        self.instantiator = Some(Arc::new(factory));
        self
    }

    pub fn query_modifier(mut self, modifier: QueryModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Durable collection override; defaults to the payload type's name.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub(crate) fn singleton(mut self) -> Self {
        self.kind = CacheKind::Singleton;
        self
    }

    pub fn build(self) -> Result<Cache<P>, CacheError> {
        let instantiator = self
            .instantiator
            .ok_or_else(|| CacheError::MissingInstantiator(self.name.clone()))?;

        let database = self.database;
        let settings = self.settings;
        let name = self.name;
        let node = database.node_name();
        let scoped_name = if settings.node_scoped {
            format!("{}-{}", node, name)
        } else {
            name.clone()
        };

        let errors = ErrorSink::new(name.clone(), settings.debug);
        let mut remote = RemoteStore::new(
            Arc::clone(database.backend()),
            &name,
            database.development_mode(),
            errors.clone(),
        );
        if let Some(collection) = self.collection {
            remote = remote.with_collection(collection);
        }
        let remote = Arc::new(remote);
        if settings.node_scoped {
            remote.scope_to_node(&node);
        }
        for modifier in self.modifiers {
            remote.add_modifier(modifier);
        }

        let network = settings.mode == CacheMode::NetworkNode;
        let updater = UpdatePropagator::new(&name, &database, network && settings.enable_updater, errors.clone());
        let presence = PresenceRegistry::new(
            &scoped_name,
            Arc::clone(database.bus()),
            database.config().presence_liveness(),
            errors.clone(),
        );
        let handoff = OwnershipHandoff::new(&name, &database, errors.clone());
        let (state, _) = watch::channel(CacheState::Created);
        let (stop, _) = watch::channel(false);

        Ok(Cache {
            inner: Arc::new(CacheInner {
                label: Arc::from(name.as_str()),
                name,
                scoped_name,
                kind: self.kind,
                dependencies: self.dependencies,
                local: Arc::new(LocalStore::new(database.development_mode())),
                remote,
                controllers: DashMap::new(),
                instantiator,
                updater,
                presence,
                handoff,
                names: NameIndex::new(),
                active: DashSet::new(),
                errors,
                state,
                stop,
                tasks: Mutex::new(Vec::new()),
                settings,
                database,
            }),
        })
    }
}

pub(crate) struct CacheInner<P: Payload> {
    name: String,
    label: Arc<str>,
    scoped_name: String,
    kind: CacheKind,
    settings: CacheSettings,
    dependencies: Vec<String>,
    database: Arc<Database>,
    local: Arc<LocalStore<P>>,
    remote: Arc<RemoteStore<P>>,
    controllers: DashMap<P::Key, Arc<Controller<P>>>,
    instantiator: Instantiator<P>,
    updater: UpdatePropagator<P::Key>,
    presence: PresenceRegistry<P::Key>,
    handoff: OwnershipHandoff<P::Key>,
    names: NameIndex<P::Key>,
    active: DashSet<P::Key>,
    errors: ErrorSink,
    state: watch::Sender<CacheState>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Cache<P: Payload> {
    inner: Arc<CacheInner<P>>,
}

impl<P: Payload> Clone for Cache<P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<P: Payload> Cache<P> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> CacheKind {
        self.inner.kind
    }

    pub fn mode(&self) -> CacheMode {
        self.inner.settings.mode
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn dependencies(&self) -> &[String] {
        &self.inner.dependencies
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.database
    }

    /// `"{node}-{cache}"` when node-scoped, otherwise the plain name.
    pub fn node_scoped_name(&self) -> &str {
        &self.inner.scoped_name
    }

    pub fn is_network(&self) -> bool {
        self.inner.settings.mode == CacheMode::NetworkNode
    }

    pub fn local_store(&self) -> &Arc<LocalStore<P>> {
        &self.inner.local
    }

    pub fn remote_store(&self) -> &Arc<RemoteStore<P>> {
        &self.inner.remote
    }

    /// The per-key controller, created on first use.
    pub fn controller(&self, key: &P::Key) -> Arc<Controller<P>> {
        let entry = self.inner.controllers.entry(key.clone()).or_insert_with(|| {
            Arc::new(Controller::new(
                key.clone(),
                Arc::clone(&self.inner.label),
                Arc::clone(&self.inner.local),
                Arc::clone(&self.inner.remote),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn controller_count(&self) -> usize {
        self.inner.controllers.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Resident instance, loading from the durable store and caching on a miss.
    pub async fn get(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        let _timer = metrics::LatencyTimer::new(&self.inner.name, "cache", "get");
        let handle = self.controller(key).cache().await;
        if let Some(handle) = &handle {
            self.remember_name(handle);
        }
        metrics::set_cached_items(&self.inner.name, self.inner.local.len());
        handle
    }

    /// Like [`get`](Self::get), but creates (and saves) through the
    /// instantiator when the key exists nowhere.
    pub async fn get_or_create(&self, key: &P::Key) -> PayloadRef<P> {
        if let Some(handle) = self.get(key).await {
            return handle;
        }
        let mut payload = (self.inner.instantiator)(key);
        payload.meta_mut().loading_source = Some(LoadingSource::Created);
        if self.inner.settings.node_scoped {
            payload.set_owning_node(&self.inner.database.node_name());
        }
        let handle = self.cache(&new_ref(payload));
        self.persist(&handle).await;
        handle
    }

    /// Resolve without making the instance resident.
    pub async fn get_no_cache(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.controller(key).get().await
    }

    pub fn get_from_cache(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.inner.local.peek(key)
    }

    /// Fresh copy from the durable store; never touches the local layer.
    pub async fn get_from_database(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.inner.remote.fetch(key).await.map(new_ref)
    }

    /// Durable query. Keys already resident come back as the resident handle.
    pub async fn get_where(&self, filter: Filter) -> Vec<PayloadRef<P>> {
        self.inner
            .remote
            .query_owned(filter)
            .await
            .into_iter()
            .map(|p| self.inner.local.peek(&p.identifier()).unwrap_or_else(|| new_ref(p)))
            .collect()
    }

    /// First durable document whose `field` equals `value`, ignoring case.
    /// A resident instance is returned in place of its durable copy.
    pub async fn get_by_field(&self, field: &str, value: &str) -> Option<PayloadRef<P>> {
        self.get_where(Filter::eq_ignore_case(field, value))
            .await
            .into_iter()
            .next()
    }

    /// Resolve by display name, ignoring case.
    ///
    /// Resident payloads are found through the name index. Otherwise the
    /// durable store is queried on [`Payload::NAME_FIELD`] when the payload
    /// type declares one. The result is not made resident.
    pub async fn get_by_name(&self, name: &str) -> Option<PayloadRef<P>> {
        let resident = self
            .inner
            .names
            .key_for(name)
            .and_then(|key| self.inner.local.peek(&key))
            .filter(|handle| handle.read().name().eq_ignore_ascii_case(name));
        if resident.is_some() {
            return resident;
        }
        let field = P::NAME_FIELD?;
        let handle = self.get_by_field(field, name).await?;
        self.remember_name(&handle);
        Some(handle)
    }

    /// Key last seen under `name`, ignoring case.
    pub fn key_for_name(&self, name: &str) -> Option<P::Key> {
        self.inner.names.key_for(name)
    }

    pub fn is_name_cached(&self, name: &str) -> bool {
        self.key_for_name(name)
            .map(|key| self.inner.local.contains(&key))
            .unwrap_or(false)
    }

    /// Local ∪ durable, deduplicated by key; resident handles win.
    pub async fn get_all(&self) -> Vec<PayloadRef<P>> {
        let mut all = self.inner.local.handles();
        let mut seen: HashSet<P::Key> = all.iter().map(|h| h.read().identifier()).collect();
        for payload in self.inner.remote.query_owned(Filter::All).await {
            if seen.insert(payload.identifier()) {
                all.push(new_ref(payload));
            }
        }
        all
    }

    pub fn get_cached(&self) -> Vec<PayloadRef<P>> {
        self.inner.local.handles()
    }

    pub fn is_cached(&self, key: &P::Key) -> bool {
        self.inner.local.contains(key)
    }

    pub fn cached_count(&self) -> usize {
        self.inner.local.len()
    }

    /// Documents in the durable collection (after query modifiers).
    pub async fn size(&self) -> u64 {
        self.inner.remote.size().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Make `handle` resident, or merge it into the resident instance.
    /// Returns the resident handle.
    pub fn cache(&self, handle: &PayloadRef<P>) -> PayloadRef<P> {
        let resident = self.inner.local.cache(handle);
        let key = resident.read().identifier();
        self.controller(&key).attach(&resident);
        self.remember_name(&resident);
        metrics::set_cached_items(&self.inner.name, self.inner.local.len());
        resident
    }

    pub fn uncache(&self, key: &P::Key) -> bool {
        let removed = self.controller(key).uncache(false);
        metrics::set_cached_items(&self.inner.name, self.inner.local.len());
        removed
    }

    /// Cache, then write through to the durable store.
    pub async fn save(&self, handle: &PayloadRef<P>) -> bool {
        let resident = self.cache(handle);
        self.persist(&resident).await
    }

    pub async fn save_no_cache(&self, handle: &PayloadRef<P>) -> bool {
        self.persist(handle).await
    }

    /// Queue a save on the worker pool. False if the pool is shut down.
    pub fn save_async(&self, handle: &PayloadRef<P>) -> bool {
        let cache = self.clone();
        let handle = Arc::clone(handle);
        self.inner.database.pool().spawn(async move {
            cache.save(&handle).await;
        })
    }

    /// Save, then tell siblings to reload even if they do not hold the key.
    pub async fn save_and_update(&self, handle: &PayloadRef<P>) -> bool {
        if !self.save(handle).await {
            return false;
        }
        self.push_update(handle, true).await
    }

    pub async fn push_update(&self, handle: &PayloadRef<P>, force: bool) -> bool {
        let key = handle.read().identifier();
        self.inner.updater.push_update(&key, force).await
    }

    /// Remove everywhere. Siblings are told first in network mode.
    ///
    /// The durable delete matches identifiers ignoring case, so deleting
    /// `"a"` also removes a document stored under `"A"`.
    pub async fn delete(&self, key: &P::Key) -> bool {
        if self.is_network() {
            self.inner.updater.push_delete(key).await;
        }
        if let Some((_, controller)) = self.inner.controllers.remove(key) {
            controller.forget();
        }
        self.inner.active.remove(key);
        self.inner.names.forget(key);
        self.inner.local.take(key);
        metrics::set_cached_items(&self.inner.name, self.inner.local.len());
        self.inner.remote.remove(key).await
    }

    /// Clear both layers. Development mode only.
    pub async fn purge(&self) -> Result<u64, CacheError> {
        if !self.inner.database.development_mode() {
            return Err(CacheError::Forbidden);
        }
        self.inner.local.clear().await?;
        self.inner.controllers.clear();
        self.inner.active.clear();
        self.inner.names.clear();
        let deleted = self.inner.remote.clear().await?;
        metrics::set_cached_items(&self.inner.name, 0);
        tracing::warn!(cache = %self.inner.name, deleted, "Purged cache");
        Ok(deleted)
    }

    /// Load every durable document into the local layer.
    pub async fn cache_all(&self) -> usize {
        let all = self.inner.remote.get_all().await;
        let count = all.len();
        for handle in all {
            self.cache(&handle);
        }
        count
    }

    /// Persist every resident payload; returns the number of failures.
    pub async fn save_all(&self) -> usize {
        let mut failures = 0;
        for handle in self.inner.local.handles() {
            if !self.persist(&handle).await {
                failures += 1;
            }
        }
        if failures > 0 {
            metrics::record_save_failures(&self.inner.name, failures);
        }
        failures
    }

    pub async fn delete_invalids(&self) -> u64 {
        self.inner.local.delete_invalids().await + self.inner.remote.delete_invalids().await
    }

    /// Drop controllers whose payload is neither resident nor referenced.
    pub fn prune_controllers(&self) -> usize {
        let before = self.inner.controllers.len();
        self.inner.controllers.retain(|_, c| !c.is_reclaimable());
        let pruned = before - self.inner.controllers.len();
        metrics::set_controllers(&self.inner.name, self.inner.controllers.len());
        pruned
    }

    fn remember_name(&self, handle: &PayloadRef<P>) {
        let (key, name) = {
            let guard = handle.read();
            (guard.identifier(), guard.name())
        };
        self.inner.names.record(&key, &name);
    }

    async fn persist(&self, handle: &PayloadRef<P>) -> bool {
        let _timer = metrics::LatencyTimer::new(&self.inner.name, "cache", "save");
        let key = handle.read().identifier();
        if self.inner.settings.node_scoped {
            handle.write().set_owning_node(&self.inner.database.node_name());
        }

        let saved = self.inner.remote.save(handle).await;
        {
            let mut guard = handle.write();
            let meta = guard.meta_mut();
            meta.save_failed = !saved;
            if saved {
                meta.last_save = now_millis();
            }
        }

        if saved {
            self.record_saved(&key).await;
        } else {
            self.inner.errors.capture(&format!("failed to save payload '{}'", key));
        }
        saved
    }

    /// Re-read `key` and merge it into the resident instance so outstanding
    /// handles see the new fields. With `insert_if_absent` a non-resident key
    /// is cached.
    async fn refresh_from_database(&self, key: &P::Key, insert_if_absent: bool) -> Option<PayloadRef<P>> {
        let fresh = self.inner.remote.fetch(key).await?;
        let handle = match self.inner.local.peek(key) {
            Some(resident) => {
                resident.write().merge_from(fresh);
                resident
            }
            None if insert_if_absent => self.inner.local.cache(&new_ref(fresh)),
            None => return None,
        };
        self.controller(key).attach(&handle);
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::PayloadConfig;
    use crate::payload::test_support::Account;
    use crate::storage::MemoryDocumentBackend;

    struct Fixture {
        backend: Arc<MemoryDocumentBackend>,
        database: Arc<Database>,
    }

    impl Fixture {
        async fn new(dev: bool) -> Self {
            let backend = Arc::new(MemoryDocumentBackend::new());
            let mut config = PayloadConfig::for_tests("hub");
            config.development_mode = dev;
            let database = Database::with_backends(config, backend.clone(), Arc::new(MemoryBus::new()));
            database.start().await.unwrap();
            Self { backend, database }
        }

        fn builder(&self) -> CacheBuilder<Account> {
            CacheBuilder::new("accounts", self.database.clone())
                .instantiator(|id: &String| Account::new(id, 100))
        }

        fn cache(&self) -> Cache<Account> {
            self.builder().build().unwrap()
        }
    }

    fn key(id: &str) -> String {
        id.to_string()
    }

    #[tokio::test]
    async fn test_missing_instantiator_is_a_build_error() {
        let fx = Fixture::new(true).await;
        let result = CacheBuilder::<Account>::new("accounts", fx.database.clone()).build();
        assert!(matches!(result, Err(CacheError::MissingInstantiator(name)) if name == "accounts"));
    }

    #[tokio::test]
    async fn test_save_then_get_round_trip() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();

        let handle = new_ref(Account::new("a", 7));
        assert!(cache.save(&handle).await);
        assert!(cache.is_cached(&key("a")));
        assert!(handle.read().meta.last_save > 0);
        assert_eq!(fx.backend.document("Account", "a").unwrap()["balance"], 7);

        let got = cache.get(&key("a")).await.unwrap();
        assert!(Arc::ptr_eq(&got, &handle));

        // A fresh cache over the same backend loads the durable copy
        let other = fx.cache();
        assert_eq!(other.get(&key("a")).await.unwrap().read().balance, 7);
    }

    #[tokio::test]
    async fn test_get_or_create_uses_instantiator() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();

        let created = cache.get_or_create(&key("new")).await;
        assert_eq!(created.read().balance, 100);
        assert_eq!(created.read().meta.loading_source, Some(LoadingSource::Created));
        assert!(fx.backend.document("Account", "new").is_some());

        let again = cache.get_or_create(&key("new")).await;
        assert!(Arc::ptr_eq(&created, &again));
    }

    #[tokio::test]
    async fn test_failed_save_sets_flag() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        fx.backend.set_available(false);

        let handle = new_ref(Account::new("a", 1));
        assert!(!cache.save(&handle).await);
        assert!(handle.read().meta.save_failed);
        assert!(cache.is_cached(&key("a")));

        fx.backend.set_available(true);
        assert!(cache.save(&handle).await);
        assert!(!handle.read().meta.save_failed);
    }

    #[tokio::test]
    async fn test_cache_merges_into_resident() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();

        let resident = cache.cache(&new_ref(Account::new("a", 1)));
        let returned = cache.cache(&new_ref(Account::new("a", 2)));
        assert!(Arc::ptr_eq(&resident, &returned));
        assert_eq!(resident.read().balance, 2);
        assert_eq!(cache.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("a", 1))).await;

        assert!(cache.delete(&key("a")).await);
        assert!(!cache.is_cached(&key("a")));
        assert!(fx.backend.document("Account", "a").is_none());

        assert!(!cache.delete(&key("a")).await);
        assert!(cache.get(&key("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_get_no_cache_and_from_database() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        fx.backend.insert_raw("Account", "a", r#"{"uniqueId":"a","username":"u","balance":3}"#);

        assert!(cache.get_from_cache(&key("a")).is_none());
        assert_eq!(cache.get_no_cache(&key("a")).await.unwrap().read().balance, 3);
        assert!(!cache.is_cached(&key("a")));

        let copy = cache.get_from_database(&key("a")).await.unwrap();
        assert_eq!(copy.read().meta.loading_source, Some(LoadingSource::Remote));
        assert!(!cache.is_cached(&key("a")));
    }

    #[tokio::test]
    async fn test_get_all_deduplicates() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("a", 1))).await;
        cache.save(&new_ref(Account::new("b", 2))).await;
        cache.uncache(&key("b"));
        cache.cache(&new_ref(Account::new("local-only", 3)));

        let all = cache.get_all().await;
        assert_eq!(all.len(), 3);
        assert_eq!(cache.get_cached().len(), 2);
    }

    #[tokio::test]
    async fn test_get_where_prefers_resident() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        let resident = new_ref(Account::new("a", 5));
        cache.save(&resident).await;
        cache.save(&new_ref(Account::new("b", 5))).await;
        cache.save(&new_ref(Account::new("c", 6))).await;

        let hits = cache.get_where(Filter::eq("balance", 5i64)).await;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| Arc::ptr_eq(h, &resident)));
    }

    #[tokio::test]
    async fn test_save_all_counts_failures() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.cache(&new_ref(Account::new("a", 1)));
        cache.cache(&new_ref(Account::new("b", 1)));
        assert_eq!(cache.save_all().await, 0);

        fx.backend.set_available(false);
        assert_eq!(cache.save_all().await, 2);
    }

    #[tokio::test]
    async fn test_cache_all_and_size() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        for id in ["a", "b", "c"] {
            cache.save_no_cache(&new_ref(Account::new(id, 1))).await;
        }
        assert_eq!(cache.cached_count(), 0);
        assert_eq!(cache.size().await, 3);
        assert_eq!(cache.cache_all().await, 3);
        assert_eq!(cache.cached_count(), 3);
    }

    #[tokio::test]
    async fn test_purge_requires_development_mode() {
        let fx = Fixture::new(false).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("a", 1))).await;
        assert!(matches!(cache.purge().await, Err(CacheError::Forbidden)));
        assert!(cache.is_cached(&key("a")));

        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("a", 1))).await;
        cache.save(&new_ref(Account::new("b", 1))).await;
        assert_eq!(cache.purge().await.unwrap(), 2);
        assert_eq!(cache.cached_count(), 0);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_delete_invalids_spans_layers() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("good", 1))).await;
        fx.backend.insert_raw("Account", "broken", r#"{"uniqueId":"broken"}"#);
        fx.backend.insert_raw("Account", "noid", r#"{"username":"x","balance":1}"#);

        assert_eq!(cache.delete_invalids().await, 2);
        assert_eq!(cache.size().await, 1);
    }

    #[tokio::test]
    async fn test_prune_controllers() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        cache.save(&new_ref(Account::new("a", 1))).await;
        let _ = cache.get_no_cache(&key("ghost")).await;
        assert_eq!(cache.controller_count(), 2);

        assert_eq!(cache.prune_controllers(), 1);
        cache.uncache(&key("a"));
        assert_eq!(cache.prune_controllers(), 1);
        assert_eq!(cache.controller_count(), 0);
    }

    #[tokio::test]
    async fn test_node_scoping() {
        let fx = Fixture::new(true).await;
        let settings = CacheSettings { node_scoped: true, ..Default::default() };
        let cache = fx.builder().settings(settings).build().unwrap();
        assert_eq!(cache.node_scoped_name(), "hub-accounts");

        let handle = cache.get_or_create(&key("a")).await;
        assert_eq!(handle.read().payload_node.as_deref(), Some("hub"));

        fx.backend.insert_raw("Account", "foreign", r#"{"uniqueId":"foreign","username":"f","balance":1,"payloadNode":"lobby"}"#);
        assert_eq!(cache.size().await, 1);
        assert!(cache.get(&key("foreign")).await.is_none());
    }

    #[tokio::test]
    async fn test_save_async_runs_on_pool() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        assert!(cache.save_async(&new_ref(Account::new("a", 9))));

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while fx.backend.document("Account", "a").is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();

        let resident = new_ref(Account::new("a", 1));
        assert!(cache.save(&resident).await);
        let finds = fx.backend.find_calls();
        let found = cache.get_by_name("USER-A").await.unwrap();
        assert!(Arc::ptr_eq(&found, &resident));
        assert_eq!(fx.backend.find_calls(), finds);
        assert!(cache.is_name_cached("user-a"));

        fx.backend.insert_raw("Account", "b", r#"{"uniqueId":"b","username":"Bob","balance":4}"#);
        let bob = cache.get_by_name("bOB").await.unwrap();
        assert_eq!(bob.read().balance, 4);
        assert!(!cache.is_cached(&key("b")));
        assert_eq!(cache.key_for_name("BOB"), Some(key("b")));
        assert!(!cache.is_name_cached("bob"));

        assert!(cache.get_by_name("nobody").await.is_none());
        assert_eq!(cache.get_by_field("username", "BOB").await.unwrap().read().unique_id, "b");
    }

    #[tokio::test]
    async fn test_renamed_resident_is_not_returned_under_old_name() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        let handle = cache.get_or_create(&key("a")).await;
        handle.write().username = "renamed".into();
        assert!(cache.save_no_cache(&handle).await);

        assert!(cache.get_by_name("user-a").await.is_none());
        let found = cache.get_by_name("Renamed").await.unwrap();
        assert!(Arc::ptr_eq(&found, &handle));
        assert_eq!(cache.key_for_name("renamed"), Some(key("a")));
    }

    #[tokio::test]
    async fn test_delete_matches_identifier_ignoring_case() {
        let fx = Fixture::new(true).await;
        let cache = fx.cache();
        fx.backend.insert_raw("Account", "A", r#"{"uniqueId":"A","username":"upper","balance":1}"#);
        fx.backend.insert_raw("Account", "b", r#"{"uniqueId":"b","username":"other","balance":1}"#);

        cache.delete(&key("a")).await;
        assert!(fx.backend.document("Account", "A").is_none());
        assert!(fx.backend.document("Account", "b").is_some());
    }
}
