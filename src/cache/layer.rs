//! Cache layer that applies the staleness policy on top of a storage backend.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;

use super::storage::CacheStorage;
use super::traits::{CacheEntry, Cacheable};
use crate::resource::ResourceKey;

/// Default freshness window for cached results.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// Shared, overwrite-only table of fetch results keyed by resource identity.
///
/// Clones share the same storage; the longest-lived clone keeps it alive.
pub struct ResourceCache<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> ResourceCache<S> {
  /// Create a new cache with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  /// Create a cache over storage that is already shared elsewhere.
  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      stale_time: DEFAULT_STALE_TIME,
    }
  }

  /// Set the stale time for newly stored entries.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn stale_time(&self) -> Duration {
    self.stale_time
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Get the entry for `key` regardless of its age.
  pub fn get<T: Cacheable>(&self, key: &ResourceKey) -> Result<Option<CacheEntry<T>>> {
    self.storage.get_entry(key)
  }

  /// Get the entry for `key` only if it is still fresh at `now`.
  pub fn fresh<T: Cacheable>(
    &self,
    key: &ResourceKey,
    now: DateTime<Utc>,
  ) -> Result<Option<CacheEntry<T>>> {
    Ok(
      self
        .storage
        .get_entry::<T>(key)?
        .filter(|entry| !entry.is_stale_at(now)),
    )
  }

  /// Store a freshly fetched result, overwriting any previous entry.
  pub fn store<T: Cacheable>(
    &self,
    key: &ResourceKey,
    data: &T,
    fetched_at: DateTime<Utc>,
  ) -> Result<()> {
    let entry = CacheEntry::new(data.clone(), fetched_at, self.stale_time);
    self.storage.put_entry(key, &entry)
  }

  /// Drop the entry for `key`.
  pub fn invalidate(&self, key: &ResourceKey) -> Result<()> {
    self.storage.remove_entry(key)
  }
}

impl<S: CacheStorage> Clone for ResourceCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, NoopStorage};

  #[test]
  fn test_fresh_filters_stale_entries() {
    let cache = ResourceCache::new(MemoryStorage::new()).with_stale_time(Duration::from_secs(10));
    let key = ResourceKey::from("users");
    let fetched_at = Utc::now();

    cache.store(&key, &vec![1u32, 2], fetched_at).unwrap();

    let fresh = cache.fresh::<Vec<u32>>(&key, fetched_at).unwrap();
    assert_eq!(fresh.map(|e| e.data), Some(vec![1, 2]));

    let later = fetched_at + chrono::Duration::seconds(11);
    assert!(cache.fresh::<Vec<u32>>(&key, later).unwrap().is_none());
    // Stale entries are still readable
    assert!(cache.get::<Vec<u32>>(&key).unwrap().is_some());
  }

  #[test]
  fn test_clones_share_storage() {
    let cache = ResourceCache::new(MemoryStorage::new());
    let other = cache.clone();
    let key = ResourceKey::from("users");

    cache.store(&key, &"Ana".to_string(), Utc::now()).unwrap();
    assert!(other.get::<String>(&key).unwrap().is_some());

    other.invalidate(&key).unwrap();
    assert!(cache.get::<String>(&key).unwrap().is_none());
  }

  #[test]
  fn test_noop_cache_never_fresh() {
    let cache = ResourceCache::new(NoopStorage);
    let key = ResourceKey::from("users");
    cache.store(&key, &1u8, Utc::now()).unwrap();
    assert!(cache.fresh::<u8>(&key, Utc::now()).unwrap().is_none());
  }
}
