//! In-process document backend.
//!
//! Stands in for the durable store in standalone setups and tests. Documents
//! are kept as JSON text so decode failures surface the same way they do
//! against a real database. An availability switch lets tests simulate an
//! outage, and call counters let them assert how often the store was hit.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::filter::Filter;
use super::traits::{DocumentBackend, RawDocument, StorageError};

pub struct MemoryDocumentBackend {
    collections: DashMap<String, DashMap<String, String>>,
    available: AtomicBool,
    find_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl MemoryDocumentBackend {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            available: AtomicBool::new(true),
            find_calls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    /// Toggle simulated availability; while off every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Store a raw body as-is, bypassing serialization.
    pub fn insert_raw(&self, collection: &str, id: &str, body: &str) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body.to_string());
    }

    /// Decoded copy of one document, for assertions.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        let docs = self.collections.get(collection)?;
        let body = docs.get(id)?;
        serde_json::from_str(body.value()).ok()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }

    /// Ids of documents in `collection` matching `filter`.
    fn matching_ids(&self, collection: &str, filter: &Filter) -> Vec<String> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|entry| {
                serde_json::from_str::<Value>(entry.value())
                    .map(|doc| filter.matches(&doc))
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for MemoryDocumentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentBackend for MemoryDocumentBackend {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        self.check()?;
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let Some(docs) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for entry in docs.iter() {
            if let Ok(doc) = serde_json::from_str::<Value>(entry.value()) {
                if filter.matches(&doc) {
                    out.push(doc);
                }
            }
        }
        Ok(out)
    }

    async fn upsert(&self, collection: &str, id: &str, doc: &Value) -> Result<(), StorageError> {
        self.check()?;
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(doc)?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body);
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        self.check()?;
        let ids = self.matching_ids(collection, filter);
        let Some(docs) = self.collections.get(collection) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| docs.remove(*id).is_some()).count() as u64)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        self.check()?;
        Ok(self.matching_ids(collection, filter).len() as u64)
    }

    async fn scan_raw(&self, collection: &str) -> Result<Vec<RawDocument>, StorageError> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|e| RawDocument { id: e.key().clone(), body: e.value().clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        self.check()?;
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
