//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Payloads that can be stored in a resource cache.
///
/// Blanket-implemented for every serializable, shareable type.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A memorized fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  /// The cached payload
  pub data: T,
  /// When the payload was fetched
  pub fetched_at: DateTime<Utc>,
  /// Age after which the entry no longer counts as fresh
  pub stale_after: Duration,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, fetched_at: DateTime<Utc>, stale_after: Duration) -> Self {
    Self {
      data,
      fetched_at,
      stale_after,
    }
  }

  /// Check if the entry is older than its `stale_after` at `now`.
  pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
    is_older_than(self.fetched_at, self.stale_after, now)
  }
}

/// True when `now - fetched_at > max_age`.
///
/// Timestamps in the future count as fresh.
pub fn is_older_than(fetched_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
  match (now - fetched_at).to_std() {
    Ok(age) => age > max_age,
    Err(_) => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_fresh_until_stale_after() {
    let fetched_at = Utc::now();
    let entry = CacheEntry::new(vec![1, 2], fetched_at, Duration::from_secs(60));

    assert!(!entry.is_stale_at(fetched_at));
    assert!(!entry.is_stale_at(fetched_at + chrono::Duration::seconds(60)));
    assert!(entry.is_stale_at(fetched_at + chrono::Duration::seconds(61)));
  }

  #[test]
  fn test_future_timestamp_is_fresh() {
    let now = Utc::now();
    assert!(!is_older_than(
      now + chrono::Duration::seconds(5),
      Duration::ZERO,
      now
    ));
  }
}
