//! A cache holding exactly one value.
//!
//! The value lives in a single document with identifier [`SINGLETON_ID`],
//! stored in a collection named after the cache so that two singleton caches
//! of the same value type never share a document.
//!
//! ```rust,no_run
//! # use payload_mesh::{CacheSettings, Database, SingletonCache};
//! # use std::sync::Arc;
//! # async fn example(database: Arc<Database>) -> Result<(), payload_mesh::CacheError> {
//! let motd: SingletonCache<String> =
//!     SingletonCache::new("motd", database, CacheSettings::default())?;
//! motd.cache().start().await?;
//!
//! motd.set(Some("Welcome!".to_string())).await;
//! assert_eq!(motd.get().await.as_deref(), Some("Welcome!"));
//! # Ok(())
//! # }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{Cache, CacheBuilder};
use crate::config::CacheSettings;
use crate::database::Database;
use crate::error::CacheError;
use crate::payload::{new_ref, Payload, PayloadMeta};

pub const SINGLETON_ID: &str = "0";

/// The stored document wrapping a singleton value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct Slot<T> {
    identifier: String,
    #[serde(default)]
    value: Option<T>,
    #[serde(skip)]
    meta: PayloadMeta,
}

impl<T> Slot<T> {
    fn holding(value: Option<T>) -> Self {
        Self {
            identifier: SINGLETON_ID.to_string(),
            value,
            meta: PayloadMeta::default(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T> Payload for Slot<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Key = String;
    const ID_FIELD: &'static str = "identifier";

    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn name(&self) -> String {
        String::new()
    }

    fn meta(&self) -> &PayloadMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut PayloadMeta {
        &mut self.meta
    }
}

pub struct SingletonCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    cache: Cache<Slot<T>>,
}

impl<T> Clone for SingletonCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone() }
    }
}

impl<T> SingletonCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        database: Arc<Database>,
        settings: CacheSettings,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        let cache = CacheBuilder::new(name.clone(), database)
            .settings(settings)
            .collection(name)
            .singleton()
            .instantiator(|_: &String| Slot::holding(None))
            .build()?;
        Ok(Self { cache })
    }

    /// The underlying cache, for lifecycle calls and registry membership.
    pub fn cache(&self) -> &Cache<Slot<T>> {
        &self.cache
    }

    /// Current value, loading the durable copy on a miss.
    pub async fn get(&self) -> Option<T> {
        let handle = self.cache.get(&key()).await?;
        let value = handle.read().value.clone();
        value
    }

    /// Replace the value and write it through. `None` deletes it everywhere.
    pub async fn set(&self, value: Option<T>) -> bool {
        match value {
            Some(value) => self.cache.save(&new_ref(Slot::holding(Some(value)))).await,
            None => self.cache.delete(&key()).await,
        }
    }

    /// Like [`set`](Self::set), without making the value resident.
    pub async fn set_no_cache(&self, value: Option<T>) -> bool {
        match value {
            Some(value) => self.cache.save_no_cache(&new_ref(Slot::holding(Some(value)))).await,
            None => self.cache.delete(&key()).await,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_cached(&key())
    }
}

fn key() -> String {
    SINGLETON_ID.to_string()
}
