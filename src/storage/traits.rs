use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::filter::Filter;
use crate::payload::{Payload, PayloadRef};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage backend unavailable")]
    Unavailable,
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Operation refused outside development mode")]
    Forbidden,
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A raw stored document, as returned by [`DocumentBackend::scan_raw`].
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub id: String,
    pub body: String,
}

/// The durable document store driver.
///
/// One implementation is shared by every cache on a node; collections keep
/// payload types apart.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>, StorageError>;
    async fn upsert(&self, collection: &str, id: &str, doc: &Value) -> Result<(), StorageError>;
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError>;
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError>;

    /// Every document in a collection without decoding, for hygiene passes.
    async fn scan_raw(&self, collection: &str) -> Result<Vec<RawDocument>, StorageError>;

    async fn delete_by_id(&self, collection: &str, id: &str) -> Result<bool, StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// Uniform contract for one storage layer of a cache.
///
/// Failures are reported and flattened to `false`/`None`/`0`; callers treat
/// those as "did not happen".
#[async_trait]
pub trait Store<P: Payload>: Send + Sync {
    async fn get(&self, key: &P::Key) -> Option<PayloadRef<P>>;
    async fn has(&self, key: &P::Key) -> bool;
    async fn remove(&self, key: &P::Key) -> bool;

    async fn remove_payload(&self, payload: &PayloadRef<P>) -> bool {
        let key = payload.read().identifier();
        self.remove(&key).await
    }

    async fn save(&self, payload: &PayloadRef<P>) -> bool;
    async fn get_all(&self) -> Vec<PayloadRef<P>>;
    async fn size(&self) -> u64;

    /// Remove everything; refused unless development mode is on.
    async fn clear(&self) -> Result<u64, StorageError>;

    /// Remove entries whose identifier does not resolve.
    async fn delete_invalids(&self) -> u64;

    fn layer_name(&self) -> &'static str;
}
