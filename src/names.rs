//! Case-insensitive name to key index.
//!
//! Remembers the display name last seen for each key, so lookups by name can
//! be answered from resident payloads before falling back to a durable query.
//! A name belongs to one key at a time: recording it for a new key releases
//! it from the old one.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::payload::PayloadKey;

struct Maps<K> {
    by_key: HashMap<K, String>,
    by_name: HashMap<String, K>,
}

pub struct NameIndex<K: PayloadKey> {
    maps: Mutex<Maps<K>>,
}

impl<K: PayloadKey> Default for NameIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PayloadKey> NameIndex<K> {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps {
                by_key: HashMap::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    /// Remember `name` for `key`. Empty names are ignored.
    pub fn record(&self, key: &K, name: &str) {
        if name.is_empty() {
            return;
        }
        let name = name.to_lowercase();
        let mut maps = self.maps.lock();
        if maps.by_key.get(key) == Some(&name) {
            return;
        }
        if let Some(old) = maps.by_key.insert(key.clone(), name.clone()) {
            maps.by_name.remove(&old);
        }
        if let Some(previous) = maps.by_name.insert(name, key.clone()) {
            if previous != *key {
                maps.by_key.remove(&previous);
            }
        }
    }

    pub fn key_for(&self, name: &str) -> Option<K> {
        self.maps.lock().by_name.get(&name.to_lowercase()).cloned()
    }

    /// Lower-cased name last recorded for `key`.
    pub fn name_for(&self, key: &K) -> Option<String> {
        self.maps.lock().by_key.get(key).cloned()
    }

    pub fn forget(&self, key: &K) -> bool {
        let mut maps = self.maps.lock();
        match maps.by_key.remove(key) {
            Some(name) => {
                maps.by_name.remove(&name);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        maps.by_key.clear();
        maps.by_name.clear();
    }

    pub fn len(&self) -> usize {
        self.maps.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
