//! Secret vault — named opaque byte values, write-through to the store.
//!
//! Values leave this module on exactly one path: the environment map built
//! for the sandbox subprocess. Listings enumerate names only, and nothing
//! here ever logs a value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::store::{RequestStore, StoreError};

pub struct SecretVault {
    store: Arc<RequestStore>,
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl SecretVault {
    /// Opens the vault, warming the in-memory map from the store's secret
    /// table.
    pub fn open(store: Arc<RequestStore>) -> Result<Self, StoreError> {
        let mut cache = HashMap::new();
        for name in store.list_secret_names()? {
            if let Some(value) = store.get_secret(&name)? {
                cache.insert(name, value);
            }
        }
        info!("Secret vault loaded ({} entries)", cache.len());
        Ok(Self {
            store,
            cache: RwLock::new(cache),
        })
    }

    /// Inserts or replaces a value in one operation. Empty names are refused.
    pub fn put(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        self.store.put_secret(name, value)?;
        self.cache
            .write()
            .expect("vault lock poisoned")
            .insert(name.to_string(), value.to_vec());
        info!("Secret '{name}' stored");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.cache
            .read()
            .expect("vault lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cache
            .read()
            .expect("vault lock poisoned")
            .contains_key(name)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete_secret(name)?;
        self.cache
            .write()
            .expect("vault lock poisoned")
            .remove(name);
        Ok(())
    }

    /// Sorted names only — never values.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .read()
            .expect("vault lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Of `declared`, the names the vault does not yet hold, declaration
    /// order preserved.
    pub fn missing_of(&self, declared: &[String]) -> Vec<String> {
        let cache = self.cache.read().expect("vault lock poisoned");
        declared
            .iter()
            .filter(|name| !cache.contains_key(*name))
            .cloned()
            .collect()
    }
}
