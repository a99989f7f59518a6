//! In-memory store backend.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{PersistentStore, StoreError};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, Vec<u8>>,
    writes: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw writes performed, including directory creation.
    pub fn write_count(&self) -> usize {
        self.lock().map(|inner| inner.writes.len()).unwrap_or(0)
    }

    /// Keys written, in write order.
    pub fn write_log(&self) -> Vec<String> {
        self.lock()
            .map(|inner| inner.writes.clone())
            .unwrap_or_default()
    }

    /// Overwrite a raw value without touching ancestors or the write log.
    ///
    /// Used to simulate foreign or damaged data.
    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock()?.nodes.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl PersistentStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.nodes.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.nodes.insert(key.to_string(), value.to_vec());
        inner.writes.push(key.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.nodes.remove(key).is_some())
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.nodes.contains_key(key))
    }
}
