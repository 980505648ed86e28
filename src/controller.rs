// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key entry point.
//!
//! One `Controller` exists per (cache, key). It holds a weak handle to the
//! resident instance and serializes loads through an async mutex, so N
//! concurrent callers for a cold key cause exactly one durable read. Unrelated
//! keys never contend.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::metrics;
use crate::payload::{new_ref, Payload, PayloadRef};
use crate::storage::{LocalStore, RemoteStore};

pub struct Controller<P: Payload> {
    key: P::Key,
    cache_name: Arc<str>,
    local: Arc<LocalStore<P>>,
    remote: Arc<RemoteStore<P>>,
    handle: Mutex<Weak<parking_lot::RwLock<P>>>,
    loaded_from_local: AtomicBool,
    load_lock: tokio::sync::Mutex<()>,
    remote_loads: AtomicUsize,
}

impl<P: Payload> Controller<P> {
    pub fn new(
        key: P::Key,
        cache_name: Arc<str>,
        local: Arc<LocalStore<P>>,
        remote: Arc<RemoteStore<P>>,
    ) -> Self {
        Self {
            key,
            cache_name,
            local,
            remote,
            handle: Mutex::new(Weak::new()),
            loaded_from_local: AtomicBool::new(false),
            load_lock: tokio::sync::Mutex::new(()),
            remote_loads: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &P::Key {
        &self.key
    }

    /// Resolve and make resident: inserts into the local store if the
    /// instance came from the durable store.
    pub async fn cache(&self) -> Option<PayloadRef<P>> {
        self.resolve(true).await
    }

    /// Resolve without making resident.
    pub async fn get(&self) -> Option<PayloadRef<P>> {
        self.resolve(false).await
    }

    /// Live handle if one exists here, without any I/O.
    pub fn peek(&self) -> Option<PayloadRef<P>> {
        self.upgrade().or_else(|| self.local.peek(&self.key))
    }

    /// Drop the weak handle; stores are untouched.
    pub fn forget(&self) {
        *self.handle.lock() = Weak::new();
        self.loaded_from_local.store(false, Ordering::SeqCst);
    }

    /// Remove from the local store. With `switching_nodes` the caller must
    /// not persist: the destination node is about to load the durable copy.
    pub fn uncache(&self, switching_nodes: bool) -> bool {
        let removed = self.local.take(&self.key).is_some();
        if removed {
            debug!(cache = %self.cache_name, key = %self.key, switching_nodes, "Uncached");
        }
        removed
    }

    /// Attach an already-resident handle (e.g. after `Cache::cache`).
    pub fn attach(&self, handle: &PayloadRef<P>) {
        *self.handle.lock() = Arc::downgrade(handle);
    }

    pub fn loaded_from_local(&self) -> bool {
        self.loaded_from_local.load(Ordering::SeqCst)
    }

    /// Number of durable reads this controller has performed.
    pub fn remote_loads(&self) -> usize {
        self.remote_loads.load(Ordering::SeqCst)
    }

    /// Nothing references the instance and it is not resident.
    pub fn is_reclaimable(&self) -> bool {
        self.handle.lock().strong_count() == 0 && !self.local.contains(&self.key)
    }

    fn upgrade(&self) -> Option<PayloadRef<P>> {
        self.handle.lock().upgrade()
    }

    fn retain(&self, handle: PayloadRef<P>) -> PayloadRef<P> {
        let resident = self.local.cache(&handle);
        if !Arc::ptr_eq(&resident, &handle) {
            self.attach(&resident);
        }
        resident
    }

    async fn resolve(&self, retain: bool) -> Option<PayloadRef<P>> {
        let finish = |h: PayloadRef<P>| if retain { self.retain(h) } else { h };

        if let Some(h) = self.upgrade() {
            return Some(finish(h));
        }

        let _guard = self.load_lock.lock().await;
        if let Some(h) = self.upgrade() {
            return Some(finish(h));
        }

        if let Some(h) = self.local.peek(&self.key) {
            self.attach(&h);
            self.loaded_from_local.store(true, Ordering::SeqCst);
            metrics::record_load(&self.cache_name, "local");
            return Some(h);
        }

        self.loaded_from_local.store(false, Ordering::SeqCst);
        self.remote_loads.fetch_add(1, Ordering::SeqCst);
        metrics::record_load(&self.cache_name, "remote");
        let payload = self.remote.fetch(&self.key).await?;

        let handle = finish(new_ref(payload));
        self.attach(&handle);
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorSink;
    use crate::payload::test_support::Account;
    use crate::storage::{MemoryDocumentBackend, Store};

    struct Fixture {
        backend: Arc<MemoryDocumentBackend>,
        local: Arc<LocalStore<Account>>,
        remote: Arc<RemoteStore<Account>>,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(MemoryDocumentBackend::new());
            let remote = Arc::new(RemoteStore::new(
                backend.clone(),
                "accounts",
                true,
                ErrorSink::new("accounts", true),
            ));
            Self { backend, local: Arc::new(LocalStore::new(true)), remote }
        }

        fn controller(&self, key: &str) -> Arc<Controller<Account>> {
            Arc::new(Controller::new(
                key.to_string(),
                Arc::from("accounts"),
                self.local.clone(),
                self.remote.clone(),
            ))
        }
    }

    #[tokio::test]
    async fn test_cache_loads_remote_and_inserts_once() {
        let fx = Fixture::new();
        fx.remote.save(&new_ref(Account::new("a", 5))).await;
        let controller = fx.controller("a");

        let first = controller.cache().await.unwrap();
        let second = controller.cache().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(controller.remote_loads(), 1);
        assert_eq!(fx.local.insert_count(), 1);
        assert!(!controller.loaded_from_local());
    }

    #[tokio::test]
    async fn test_get_does_not_retain() {
        let fx = Fixture::new();
        fx.remote.save(&new_ref(Account::new("a", 5))).await;
        let controller = fx.controller("a");

        let peeked = controller.get().await.unwrap();
        assert_eq!(peeked.read().balance, 5);
        assert!(fx.local.is_empty());

        // Still referenced: cache() reuses it instead of reloading
        let cached = controller.cache().await.unwrap();
        assert!(Arc::ptr_eq(&peeked, &cached));
        assert_eq!(controller.remote_loads(), 1);
        assert_eq!(fx.local.len(), 1);
    }

    #[tokio::test]
    async fn test_local_hit_sets_flag() {
        let fx = Fixture::new();
        let handle = new_ref(Account::new("a", 1));
        fx.local.cache(&handle);
        let controller = fx.controller("a");

        let resolved = controller.cache().await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &handle));
        assert!(controller.loaded_from_local());
        assert_eq!(fx.backend.find_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_none() {
        let fx = Fixture::new();
        let controller = fx.controller("ghost");
        assert!(controller.cache().await.is_none());
        assert!(fx.local.is_empty());
    }

    #[tokio::test]
    async fn test_forget_and_reclaim() {
        let fx = Fixture::new();
        fx.remote.save(&new_ref(Account::new("a", 1))).await;
        let controller = fx.controller("a");

        let handle = controller.cache().await.unwrap();
        assert!(!controller.is_reclaimable());

        assert!(controller.uncache(false));
        assert!(!controller.uncache(false));
        drop(handle);
        assert!(controller.is_reclaimable());

        controller.forget();
        assert!(controller.peek().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_load_happens_once() {
        let fx = Fixture::new();
        fx.remote.save(&new_ref(Account::new("hot", 1))).await;
        let controller = fx.controller("hot");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let controller = controller.clone();
            tasks.push(tokio::spawn(async move { controller.cache().await }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(fx.backend.find_calls(), 1);
        assert_eq!(fx.local.insert_count(), 1);
    }
}
