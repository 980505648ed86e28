//! In-memory layer: what this node currently holds.
//!
//! A `DashMap` from key to the single resident handle. Inserting a second,
//! distinct instance for a resident key merges it into the first so every
//! outstanding reference keeps seeing current fields.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::traits::{StorageError, Store};
use crate::payload::{LoadingSource, Payload, PayloadRef};

pub struct LocalStore<P: Payload> {
    items: DashMap<P::Key, PayloadRef<P>>,
    development_mode: bool,
    inserts: AtomicUsize,
}

impl<P: Payload> LocalStore<P> {
    pub fn new(development_mode: bool) -> Self {
        Self {
            items: DashMap::new(),
            development_mode,
            inserts: AtomicUsize::new(0),
        }
    }

    /// Resident handle, if any. Never touches the durable store.
    pub fn peek(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.items.get(key).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, key: &P::Key) -> bool {
        self.items.contains_key(key)
    }

    /// Insert `handle`, or merge it into the resident instance.
    ///
    /// Returns the handle that is resident afterwards.
    pub fn cache(&self, handle: &PayloadRef<P>) -> PayloadRef<P> {
        let key = handle.read().identifier();
        match self.items.entry(key) {
            Entry::Occupied(existing) => {
                let resident = Arc::clone(existing.get());
                if !Arc::ptr_eq(&resident, handle) {
                    let newer = handle.read().clone();
                    resident.write().merge_from(newer);
                }
                resident
            }
            Entry::Vacant(slot) => {
                handle.write().meta_mut().loading_source.get_or_insert(LoadingSource::Local);
                self.inserts.fetch_add(1, Ordering::SeqCst);
                slot.insert(Arc::clone(handle));
                Arc::clone(handle)
            }
        }
    }

    /// Drop a key; returns the handle that was resident.
    pub fn take(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.items.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<P::Key> {
        self.items.iter().map(|e| e.key().clone()).collect()
    }

    pub fn handles(&self) -> Vec<PayloadRef<P>> {
        self.items.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total fresh inserts since creation.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: Payload> Store<P> for LocalStore<P> {
    async fn get(&self, key: &P::Key) -> Option<PayloadRef<P>> {
        self.peek(key)
    }

    async fn has(&self, key: &P::Key) -> bool {
        self.contains(key)
    }

    async fn remove(&self, key: &P::Key) -> bool {
        self.take(key).is_some()
    }

    async fn save(&self, payload: &PayloadRef<P>) -> bool {
        self.cache(payload);
        true
    }

    async fn get_all(&self) -> Vec<PayloadRef<P>> {
        self.handles()
    }

    async fn size(&self) -> u64 {
        self.items.len() as u64
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        if !self.development_mode {
            return Err(StorageError::Forbidden);
        }
        let count = self.items.len() as u64;
        self.items.clear();
        Ok(count)
    }

    /// Entries filed under a key that no longer matches the payload's identifier.
    async fn delete_invalids(&self) -> u64 {
        let stale: Vec<P::Key> = self
            .items
            .iter()
            .filter(|e| e.value().read().identifier() != *e.key())
            .map(|e| e.key().clone())
            .collect();
        stale.iter().filter(|k| self.items.remove(*k).is_some()).count() as u64
    }

    fn layer_name(&self) -> &'static str {
        "local"
    }
}
