//! Durable layer: the shared document store as seen by one cache.
//!
//! Wraps a [`DocumentBackend`] with the payload type's collection and
//! identifier field, plus any query modifiers the cache installs (e.g. node
//! scoping). Every failure is reported through the cache's [`ErrorSink`] and
//! flattened to `false`/`None`/`0`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use super::filter::Filter;
use super::traits::{DocumentBackend, StorageError, Store};
use crate::error::ErrorSink;
use crate::metrics;
use crate::payload::{collection_name, new_ref, parse_key, LoadingSource, Payload, PayloadRef};

/// Rewrites every outgoing criteria tree.
pub type QueryModifier = Arc<dyn Fn(Filter) -> Filter + Send + Sync>;

pub struct RemoteStore<P: Payload> {
    backend: Arc<dyn DocumentBackend>,
    collection: String,
    cache_name: String,
    development_mode: bool,
    errors: ErrorSink,
    modifiers: RwLock<Vec<QueryModifier>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> RemoteStore<P> {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        cache_name: &str,
        development_mode: bool,
        errors: ErrorSink,
    ) -> Self {
        Self {
            backend,
            collection: collection_name::<P>(),
            cache_name: cache_name.to_string(),
            development_mode,
            errors,
            modifiers: RwLock::new(Vec::new()),
            _payload: PhantomData,
        }
    }

    /// Store documents under `collection` instead of the payload type's name.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn add_modifier(&self, modifier: QueryModifier) {
        self.modifiers.write().push(modifier);
    }

    /// Restrict every query to documents owned by `node`.
    pub fn scope_to_node(&self, node: &str) {
        let node = node.to_string();
        self.add_modifier(Arc::new(move |f: Filter| {
            f.and(Filter::eq_ignore_case(P::NODE_FIELD, node.clone()))
        }));
    }

    fn scoped(&self, base: Filter) -> Filter {
        self.modifiers.read().iter().fold(base, |f, m| m(f))
    }

    fn key_filter(key: &P::Key) -> Filter {
        Filter::eq_ignore_case(P::ID_FIELD, key.to_string())
    }

    fn record(&self, op: &str, started: Instant, ok: bool) {
        metrics::record_operation(&self.cache_name, "remote", op, if ok { "success" } else { "error" });
        metrics::record_latency(&self.cache_name, "remote", op, started.elapsed());
    }

    fn decode(&self, doc: Value) -> Option<P> {
        match serde_json::from_value::<P>(doc) {
            Ok(mut payload) => {
                payload.meta_mut().loading_source = Some(LoadingSource::Remote);
                Some(payload)
            }
            Err(e) => {
                self.errors.capture_err(&e, &format!("undecodable document in '{}'", self.collection));
                None
            }
        }
    }

    /// Owned copy of the durable document for `key`.
    pub async fn fetch(&self, key: &P::Key) -> Option<P> {
        let started = Instant::now();
        let filter = self.scoped(Self::key_filter(key));
        match self.backend.find(&self.collection, &filter).await {
            Ok(docs) => {
                self.record("get", started, true);
                docs.into_iter().next().and_then(|doc| self.decode(doc))
            }
            Err(e) => {
                self.record("get", started, false);
                self.errors.capture_err(&e, &format!("failed to load '{}' from '{}'", key, self.collection));
                None
            }
        }
    }

    pub async fn query_by_filter(&self, filter: Filter) -> Vec<PayloadRef<P>> {
        self.query_owned(filter).await.into_iter().map(new_ref).collect()
    }

    pub async fn query_owned(&self, filter: Filter) -> Vec<P> {
        let started = Instant::now();
        let filter = self.scoped(filter);
        match self.backend.find(&self.collection, &filter).await {
            Ok(docs) => {
                self.record("query", started, true);
                docs.into_iter().filter_map(|d| self.decode(d)).collect()
            }
            Err(e) => {
                self.record("query", started, false);
                self.errors.capture_err(&e, &format!("query on '{}' failed", self.collection));
                Vec::new()
            }
        }
    }

    pub async fn delete_where(&self, filter: Filter) -> u64 {
        let started = Instant::now();
        let filter = self.scoped(filter);
        match self.backend.delete_many(&self.collection, &filter).await {
            Ok(n) => {
                self.record("delete_where", started, true);
                n
            }
            Err(e) => {
                self.record("delete_where", started, false);
                self.errors.capture_err(&e, &format!("delete on '{}' failed", self.collection));
                0
            }
        }
    }

    /// Serialize under a short read lock so no guard is held across the write.
    fn snapshot(payload: &PayloadRef<P>) -> Result<(String, Value), StorageError> {
        let guard = payload.read();
        let doc = serde_json::to_value(&*guard)?;
        Ok((guard.identifier().to_string(), doc))
    }

    fn is_valid_document(&self, body: &str) -> bool {
        let Ok(doc) = serde_json::from_str::<Value>(body) else {
            return false;
        };
        let id_resolves = match doc.get(P::ID_FIELD) {
            Some(Value::String(s)) => parse_key::<P::Key>(s).is_some(),
            Some(Value::Number(n)) => parse_key::<P::Key>(&n.to_string()).is_some(),
            _ => false,
        };
        id_resolves && serde_json::from_value::<P>(doc).is_ok()
    }
}

#[async_trait]
impl<P: Payload> Store<P> for RemoteStore<P> {
    async fn get(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.fetch(key).await.map(new_ref)
    }

    async fn has(&self, key: &P::Key) -> bool {
        let filter = self.scoped(Self::key_filter(key));
        match self.backend.count(&self.collection, &filter).await {
            Ok(n) => n > 0,
            Err(e) => {
                self.errors.capture_err(&e, &format!("existence check for '{}' failed", key));
                false
            }
        }
    }

    async fn remove(&self, key: &P::Key) -> bool {
        let started = Instant::now();
        let filter = self.scoped(Self::key_filter(key));
        match self.backend.delete_many(&self.collection, &filter).await {
            Ok(n) => {
                self.record("remove", started, true);
                n > 0
            }
            Err(e) => {
                self.record("remove", started, false);
                self.errors.capture_err(&e, &format!("failed to remove '{}'", key));
                false
            }
        }
    }

    async fn save(&self, payload: &PayloadRef<P>) -> bool {
        let started = Instant::now();
        let (id, doc) = match Self::snapshot(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.errors.capture_err(&e, "failed to serialize payload");
                return false;
            }
        };
        match self.backend.upsert(&self.collection, &id, &doc).await {
            Ok(()) => {
                self.record("save", started, true);
                true
            }
            Err(e) => {
                self.record("save", started, false);
                self.errors.capture_err(&e, &format!("failed to save '{}'", id));
                false
            }
        }
    }

    async fn get_all(&self) -> Vec<PayloadRef<P>> {
        self.query_by_filter(Filter::All).await
    }

    async fn size(&self) -> u64 {
        match self.backend.count(&self.collection, &self.scoped(Filter::All)).await {
            Ok(n) => n,
            Err(e) => {
                self.errors.capture_err(&e, "count failed");
                0
            }
        }
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        if !self.development_mode {
            return Err(StorageError::Forbidden);
        }
        self.backend
            .delete_many(&self.collection, &self.scoped(Filter::All))
            .await
    }

    async fn delete_invalids(&self) -> u64 {
        let raw = match self.backend.scan_raw(&self.collection).await {
            Ok(raw) => raw,
            Err(e) => {
                self.errors.capture_err(&e, "scan for invalid documents failed");
                return 0;
            }
        };
        let mut deleted = 0;
        for doc in raw.iter().filter(|d| !self.is_valid_document(&d.body)) {
            match self.backend.delete_by_id(&self.collection, &doc.id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => self.errors.capture_err(&e, &format!("failed to delete invalid '{}'", doc.id)),
            }
        }
        deleted
    }

    fn layer_name(&self) -> &'static str {
        "remote"
    }
}
