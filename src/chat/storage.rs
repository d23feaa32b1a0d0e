//! Key/value persistence backends for conversation state.
//!
//! State is written as whole JSON documents under fixed keys, so the
//! backends only need string get/set.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

/// Storage backend error type.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Convenience result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Synchronous string key/value store.
pub trait LocalStorage: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove `key`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn remove_item(&self, key: &str) -> StorageResult<()>;
}

/// `SQLite` implementation of [`LocalStorage`].
pub struct SqliteLocalStorage {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteLocalStorage {
    /// Table name for stored items.
    pub const DEFAULT_TABLE: &'static str = "local_storage";

    /// Open (or create) the database file at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        let table = Self::DEFAULT_TABLE.to_string();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );"
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
            table,
        })
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> StorageResult<R>) -> StorageResult<R> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}

impl LocalStorage for SqliteLocalStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    self.table
                ),
                rusqlite::params![key, value, now_ms],
            )?;
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table),
                rusqlite::params![key],
            )?;
            Ok(())
        })
    }
}

/// Volatile in-process implementation of [`LocalStorage`].
#[derive(Debug, Default)]
pub struct MemoryLocalStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryLocalStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn LocalStorage) {
        assert_eq!(storage.get_item("k").ok().flatten(), None);
        assert!(storage.set_item("k", "v1").is_ok());
        assert!(storage.set_item("k", "v2").is_ok());
        assert_eq!(storage.get_item("k").ok().flatten().as_deref(), Some("v2"));
        assert!(storage.remove_item("k").is_ok());
        assert_eq!(storage.get_item("k").ok().flatten(), None);
    }

    #[test]
    fn test_sqlite_storage() {
        let storage = SqliteLocalStorage::open_in_memory();
        assert!(storage.is_ok());
        if let Ok(storage) = storage {
            exercise(&storage);
        }
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryLocalStorage::new());
    }
}
