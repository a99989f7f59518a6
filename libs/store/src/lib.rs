//! Hierarchical key/value persistence.
//!
//! The scheduler keeps its durable state (framework instance id and the
//! cluster task registry) in a coordination-service style store: values
//! live under `/`-separated keys, and every key's ancestors exist as
//! (empty) directory nodes.
//!
//! ## Contract
//!
//! - `get` returns `None` for a key that was never written, and for a
//!   directory node that holds no value
//! - `set("a/b/c", ..)` creates `a` and `a/b` first if they are missing
//! - A key ending in `/` (other than the root) is rejected before any write
//! - `mkdir` is idempotent
//! - No retries inside the store; a backend that cannot answer within its
//!   timeout returns [`StoreError::Timeout`]
//!
//! ## Backends
//!
//! - [`MemoryStore`]: process-local, for tests and dev mode
//! - [`SqliteStore`]: single-file durable store

mod error;
mod key;
mod memory;
mod sqlite;

pub use error::StoreError;
pub use key::{ancestors, normalize_key};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use tracing::debug;

/// A hierarchical key/value store.
///
/// Backends implement the four raw primitives; the provided methods layer
/// key validation and directory semantics on top of them. Callers should
/// use the provided methods.
pub trait PersistentStore: Send + Sync {
    /// Read the raw value at an already-normalized key.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write the raw value at an already-normalized key, creating the node
    /// if needed.
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove the node at an already-normalized key. Returns true if a node
    /// was removed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns true if a node exists at an already-normalized key.
    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read(key)?.is_some())
    }

    /// Get the value stored at `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = normalize_key(key)?;
        let value = self.read(&key)?;
        debug!(key = %key, found = value.is_some(), "Store get");
        Ok(value.filter(|bytes| !bytes.is_empty()))
    }

    /// Store `value` at `key`, creating missing ancestors first.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = normalize_key(key)?;
        for parent in ancestors(&key) {
            self.ensure_node(parent)?;
        }
        self.write(&key, value)?;
        debug!(key = %key, bytes = value.len(), "Store set");
        Ok(())
    }

    /// Delete the node at `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize_key(key)?;
        let removed = self.remove(&key)?;
        debug!(key = %key, removed, "Store delete");
        Ok(())
    }

    /// Returns true if a node (value or directory) exists at `key`.
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = normalize_key(key)?;
        self.contains(&key)
    }

    /// Create `key` and every missing ancestor as empty directory nodes.
    ///
    /// Existing nodes are left untouched, so calling this twice with the
    /// same path writes nothing the second time.
    fn mkdir(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize_key(key)?;
        for parent in ancestors(&key) {
            self.ensure_node(parent)?;
        }
        self.ensure_node(&key)
    }

    #[doc(hidden)]
    fn ensure_node(&self, key: &str) -> Result<(), StoreError> {
        if !self.contains(key)? {
            debug!(key = %key, "Creating directory node");
            self.write(key, &[])?;
        }
        Ok(())
    }
}

impl<S: PersistentStore + ?Sized> PersistentStore for std::sync::Arc<S> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).write(key, value)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        (**self).remove(key)
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        (**self).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_creates_ancestors_in_order() {
        let store = MemoryStore::new();
        store.set("a/b", b"data").unwrap();

        assert_eq!(store.write_log(), vec!["a".to_string(), "a/b".to_string()]);
        assert!(store.exists("a").unwrap());
        assert_eq!(store.get("a/b").unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn test_set_trailing_slash_rejected_without_writes() {
        let store = MemoryStore::new();
        let err = store.set("a/", b"data").unwrap_err();

        assert!(err.is_invalid_key());
        assert_eq!(store.write_count(), 0);
        assert!(!store.exists("a").unwrap());
    }

    #[test]
    fn test_mkdir_twice_is_noop() {
        let store = MemoryStore::new();
        store.mkdir("x/y/z").unwrap();
        let writes = store.write_count();
        assert_eq!(writes, 3);

        store.mkdir("x/y/z").unwrap();
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_mkdir_keeps_existing_value() {
        let store = MemoryStore::new();
        store.set("a/b", b"keep").unwrap();
        store.mkdir("a/b").unwrap();

        assert_eq!(store.get("a/b").unwrap(), Some(b"keep".to_vec()));
    }

    #[test]
    fn test_directory_node_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("a/b", b"x").unwrap();

        assert!(store.exists("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let store = MemoryStore::new();
        store.delete("nothing/here").unwrap();
    }

    #[test]
    fn test_arc_store_delegates() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let shared: std::sync::Arc<dyn PersistentStore> = store.clone();
        shared.set("k", b"v").unwrap();

        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
