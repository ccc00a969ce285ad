//! Cache storage trait and its in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use super::traits::{CacheEntry, Cacheable};
use crate::resource::ResourceKey;

/// Trait for cache storage backends.
///
/// A simple get/set-by-key contract. Writes overwrite whatever is stored
/// under the key.
pub trait CacheStorage: Send + Sync + 'static {
  /// Get the entry stored under `key`.
  fn get_entry<T: Cacheable>(&self, key: &ResourceKey) -> Result<Option<CacheEntry<T>>>;

  /// Store an entry under `key`, replacing any previous one.
  fn put_entry<T: Cacheable>(&self, key: &ResourceKey, entry: &CacheEntry<T>) -> Result<()>;

  /// Remove the entry stored under `key`.
  fn remove_entry(&self, key: &ResourceKey) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get_entry<T: Cacheable>(&self, _key: &ResourceKey) -> Result<Option<CacheEntry<T>>> {
    Ok(None) // Always miss
  }

  fn put_entry<T: Cacheable>(&self, _key: &ResourceKey, _entry: &CacheEntry<T>) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove_entry(&self, _key: &ResourceKey) -> Result<()> {
    Ok(())
  }
}

/// Serialized form shared by the in-process backends.
#[derive(Debug, Clone)]
struct StoredEntry {
  data: Vec<u8>,
  fetched_at: DateTime<Utc>,
  stale_after: Duration,
}

impl StoredEntry {
  fn encode<T: Cacheable>(entry: &CacheEntry<T>) -> Result<Self> {
    let data =
      serde_json::to_vec(&entry.data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    Ok(Self {
      data,
      fetched_at: entry.fetched_at,
      stale_after: entry.stale_after,
    })
  }

  fn decode<T: Cacheable>(&self) -> Result<CacheEntry<T>> {
    let data: T =
      serde_json::from_slice(&self.data).map_err(|e| eyre!("Failed to deserialize entry: {}", e))?;
    Ok(CacheEntry::new(data, self.fetched_at, self.stale_after))
  }
}

/// Process-local storage. Entries live as long as the storage does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.read().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl CacheStorage for MemoryStorage {
  fn get_entry<T: Cacheable>(&self, key: &ResourceKey) -> Result<Option<CacheEntry<T>>> {
    let entries = self
      .entries
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    entries
      .get(&key.cache_hash())
      .map(|stored| stored.decode())
      .transpose()
  }

  fn put_entry<T: Cacheable>(&self, key: &ResourceKey, entry: &CacheEntry<T>) -> Result<()> {
    let stored = StoredEntry::encode(entry)?;
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.cache_hash(), stored);
    Ok(())
  }

  fn remove_entry(&self, key: &ResourceKey) -> Result<()> {
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(&key.cache_hash());
    Ok(())
  }
}

/// SQLite-based cache storage, persisting entries across runs.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
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

    Ok(data_dir.join("rq").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resource_cache (
    key_hash TEXT PRIMARY KEY,
    resource_key TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    stale_after_ms INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn get_entry<T: Cacheable>(&self, key: &ResourceKey) -> Result<Option<CacheEntry<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT data, fetched_at, stale_after_ms FROM resource_cache WHERE key_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry for {}: {}", key, e))?;

    let Some((data, fetched_at, stale_after_ms)) = row else {
      return Ok(None);
    };

    let stored = StoredEntry {
      data,
      fetched_at: parse_datetime(&fetched_at)?,
      stale_after: Duration::from_millis(stale_after_ms.max(0) as u64),
    };
    stored.decode().map(Some)
  }

  fn put_entry<T: Cacheable>(&self, key: &ResourceKey, entry: &CacheEntry<T>) -> Result<()> {
    let stored = StoredEntry::encode(entry)?;
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO resource_cache (key_hash, resource_key, data, fetched_at, stale_after_ms)
         VALUES (?, ?, ?, ?, ?)",
        params![
          key.cache_hash(),
          key.as_str(),
          stored.data,
          stored.fetched_at.to_rfc3339(),
          i64::try_from(stored.stale_after.as_millis()).unwrap_or(i64::MAX),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry for {}: {}", key, e))?;

    Ok(())
  }

  fn remove_entry(&self, key: &ResourceKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM resource_cache WHERE key_hash = ?",
        params![key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to remove cache entry for {}: {}", key, e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp stored by `put_entry`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(data: Vec<String>) -> CacheEntry<Vec<String>> {
    CacheEntry::new(data, Utc::now(), Duration::from_secs(300))
  }

  #[test]
  fn test_noop_always_misses() {
    let storage = NoopStorage;
    let key = ResourceKey::from("users");
    storage.put_entry(&key, &entry(vec!["Ana".into()])).unwrap();
    assert!(storage.get_entry::<Vec<String>>(&key).unwrap().is_none());
  }

  #[test]
  fn test_memory_put_get_overwrite() {
    let storage = MemoryStorage::new();
    let key = ResourceKey::from("users");
    assert!(storage.get_entry::<Vec<String>>(&key).unwrap().is_none());

    storage.put_entry(&key, &entry(vec!["Ana".into()])).unwrap();
    storage.put_entry(&key, &entry(vec!["Bia".into()])).unwrap();

    let cached = storage.get_entry::<Vec<String>>(&key).unwrap().unwrap();
    assert_eq!(cached.data, vec!["Bia".to_string()]);
    assert_eq!(storage.len(), 1);

    storage.remove_entry(&key).unwrap();
    assert!(storage.is_empty());
  }

  #[test]
  fn test_memory_type_mismatch_is_an_error() {
    let storage = MemoryStorage::new();
    let key = ResourceKey::from("users");
    storage.put_entry(&key, &entry(vec!["Ana".into()])).unwrap();
    assert!(storage.get_entry::<u64>(&key).is_err());
  }

  #[test]
  fn test_sqlite_round_trip_preserves_metadata() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let key = ResourceKey::from("https://example.com/users");
    let original = entry(vec!["Ana".into(), "Bia".into()]);

    storage.put_entry(&key, &original).unwrap();
    let cached = storage.get_entry::<Vec<String>>(&key).unwrap().unwrap();

    assert_eq!(cached.data, original.data);
    assert_eq!(cached.stale_after, Duration::from_secs(300));
    assert_eq!(
      cached.fetched_at.timestamp_micros(),
      original.fetched_at.timestamp_micros()
    );
  }

  #[test]
  fn test_sqlite_remove() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let key = ResourceKey::from("users");
    storage.put_entry(&key, &entry(vec!["Ana".into()])).unwrap();
    storage.remove_entry(&key).unwrap();
    assert!(storage.get_entry::<Vec<String>>(&key).unwrap().is_none());
  }

  #[test]
  fn test_parse_datetime_rejects_garbage() {
    assert!(parse_datetime("yesterday").is_err());
  }
}
