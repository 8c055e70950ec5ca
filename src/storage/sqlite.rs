//! SQLite-backed key/value storage.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::PersistentStorage;

/// Metadata about one persisted record.
#[derive(Debug, Clone)]
pub struct StoredRecord {
  pub key: String,
  /// Size of the serialized value in bytes
  pub size: usize,
  /// When the record was last written
  pub updated_at: DateTime<Utc>,
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage database at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the storage database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("netquery").join("storage.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  /// List every record, most recently written first.
  pub fn records(&self) -> Result<Vec<StoredRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT key, length(value), updated_at FROM kv_store
         ORDER BY updated_at DESC, key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, i64, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list records: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(key, size, updated_at)| {
        Ok(StoredRecord {
          key,
          size: usize::try_from(size).unwrap_or_default(),
          updated_at: parse_datetime(&updated_at)?,
        })
      })
      .collect()
  }
}

const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl PersistentStorage for SqliteStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read '{}': {}", key, e))
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write '{}': {}", key, e))?;

    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove '{}': {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::adapter::{get_sync, purge_namespace_sync, set_sync};
  use serde_json::json;

  #[test]
  fn test_set_get_remove() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_item("a").unwrap(), None);

    storage.set_item("a", "1").unwrap();
    storage.set_item("a", "2").unwrap();
    assert_eq!(storage.get_item("a").unwrap(), Some("2".to_string()));

    storage.remove_item("a").unwrap();
    assert_eq!(storage.get_item("a").unwrap(), None);
  }

  #[test]
  fn test_records_have_timestamps() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    set_sync(&storage, "ns:", "/todos", &json!([1, 2, 3]));

    let records = storage.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "ns:/todos");
    assert_eq!(records[0].size, "[1,2,3]".len());
    assert!(Utc::now() - records[0].updated_at < chrono::Duration::minutes(1));
  }

  #[test]
  fn test_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("netquery-test-{}", std::process::id()));
    let path = dir.join("storage.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      set_sync(&storage, "ns:", "/todos/1", &json!({"title": "write tests"}));
    }

    let reopened = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(
      get_sync(&reopened, "ns:", "/todos/1"),
      Some(json!({"title": "write tests"}))
    );
    assert_eq!(purge_namespace_sync(&reopened, "ns:"), 1);

    drop(reopened);
    let _ = std::fs::remove_dir_all(dir);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-03-01 12:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
