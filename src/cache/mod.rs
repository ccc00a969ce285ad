//! Generic caching layer for fetch results.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Memorizes the last successful result per resource key
//! - Tracks when each result was fetched and when it goes stale
//! - Persists across controller lifetimes (in memory or in SQLite)

mod layer;
mod storage;
mod traits;

pub use layer::{ResourceCache, DEFAULT_STALE_TIME};
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{is_older_than, CacheEntry, Cacheable};
