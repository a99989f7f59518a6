//! SQLite-backed store.
//!
//! One table of `(key, value)` rows in a single database file. Directory
//! nodes are rows with an empty value. The connection's busy timeout is the
//! caller-supplied store timeout, so a store locked by another process
//! surfaces as [`StoreError::Timeout`] instead of blocking the caller.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use crate::{PersistentStore, StoreError};

/// Durable single-file store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    timeout: Duration,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(timeout)?;

        // WAL keeps readers from blocking the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            timeout,
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            timeout: Duration::from_secs(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))
    }

    fn map_err(&self, key: &str, e: rusqlite::Error) -> StoreError {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Timeout {
                    key: key.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                }
            }
            _ => StoreError::from(e),
        }
    }
}

impl PersistentStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn()?
            .query_row(
                "SELECT value FROM nodes WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.map_err(key, e))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO nodes (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
                params![key, value],
            )
            .map_err(|e| self.map_err(key, e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM nodes WHERE key = ?1", params![key])
            .map_err(|e| self.map_err(key, e))?;
        Ok(removed > 0)
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let count: i64 = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM nodes WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| self.map_err(key, e))?;
        Ok(count > 0)
    }
}
