//! Key/value credential store interface
//!
//! The persistent backend lives with the embedder; this crate only
//! consumes the capability. `MemStore` is the in-process implementation
//! used by the auth service and tests.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("key should not be empty")]
    EmptyKey,

    #[error("not found")]
    NotFound,

    #[error("store is closed")]
    Closed,
}

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<String, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
}

/// In-memory store implementation.
#[derive(Default)]
pub struct MemStore {
    entries: DashMap<String, String>,
    closed: AtomicBool,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> Result<String, StoreError> {
        self.check_open()?;
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.entries
            .get(key)
            .map(|v| v.clone())
            .ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_open()?;
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        self.entries.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemStore::new();

        assert_eq!(store.get("k"), Err(StoreError::NotFound));

        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), "v");

        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap(), "v2");

        store.delete("k").unwrap();
        assert_eq!(store.get("k"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = MemStore::new();
        assert_eq!(store.get(""), Err(StoreError::EmptyKey));
        assert_eq!(store.set("", "v"), Err(StoreError::EmptyKey));
        assert_eq!(store.delete(""), Err(StoreError::EmptyKey));
    }

    #[test]
    fn test_closed_store() {
        let store = MemStore::new();
        store.set("k", "v").unwrap();
        store.close().unwrap();
        assert_eq!(store.get("k"), Err(StoreError::Closed));
        assert_eq!(store.set("k", "v"), Err(StoreError::Closed));
    }
}
