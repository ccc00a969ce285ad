//! Per-key async fetch controller with de-duplication, cancellation and
//! staleness tracking.
//!
//! Inspired by TanStack Query, [`ResourceController`] owns one request state
//! machine per [`ResourceKey`]:
//!
//! ```text
//! Idle -> Loading -> Succeeded | Failed
//!           |
//!           +-> (cancel) -> state before the start
//! ```
//!
//! # Example
//!
//! ```ignore
//! let users = ResourceController::<Vec<User>>::new();
//! let http = transport.clone();
//! users.start("users", move || async move { http.get_json("users").await });
//!
//! // In the view
//! match users.state("users") {
//!     RequestState::Loading { .. } => render_spinner(),
//!     RequestState::Succeeded { data, .. } => render_list(&data),
//!     RequestState::Failed { error } => render_retry(&error),
//!     RequestState::Idle => {}
//! }
//!
//! // On teardown
//! users.cancel("users");
//! ```

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::{AbortHandle, Abortable};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::key::ResourceKey;
use super::state::{CancelHandle, FetchError, RequestState, StartOutcome};
use crate::cache::{is_older_than, CacheStorage, Cacheable, NoopStorage, ResourceCache};

/// Callback invoked after every state transition.
pub type Observer<T> = Arc<dyn Fn(&ResourceKey, &RequestState<T>) + Send + Sync>;

/// Identifies an observer registered with [`ResourceController::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Slot<T> {
  state: watch::Sender<RequestState<T>>,
  /// State to restore if the in-flight fetch is cancelled
  previous: RequestState<T>,
}

impl<T> Slot<T> {
  fn new() -> Self {
    let (state, _) = watch::channel(RequestState::Idle);
    Self {
      state,
      previous: RequestState::Idle,
    }
  }
}

struct Inner<T> {
  /// Slots live while they hold a result, a fetch or a watcher. A cancel that
  /// leaves an unwatched slot `Idle` removes it.
  slots: HashMap<ResourceKey, Slot<T>>,
  /// Shared by every key so a pruned slot never reuses a generation.
  next_generation: u64,
  /// Transitions waiting for observers, in the order they happened
  pending: VecDeque<(ResourceKey, RequestState<T>)>,
  observers: Vec<(SubscriptionId, Observer<T>)>,
  next_subscription: u64,
}

impl<T> Inner<T> {
  fn observers(&self) -> Vec<Observer<T>> {
    self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
  }

  fn publish(&mut self, key: &ResourceKey, state: &RequestState<T>)
  where
    T: Clone,
  {
    self.pending.push_back((key.clone(), state.clone()));
  }
}

struct Shared<T, S: CacheStorage> {
  inner: Mutex<Inner<T>>,
  /// Held by whichever caller is delivering `Inner::pending`
  dispatching: Mutex<()>,
  /// Serializes cache writes so they land in settlement order
  cache_writes: tokio::sync::Mutex<()>,
  cache: ResourceCache<S>,
}

/// Manages the request state of any number of resource keys.
///
/// Clones share the same state. Every transition happens under a single
/// short lock that never covers cache I/O. Observers run outside it, one
/// transition at a time, in the order the transitions happened.
pub struct ResourceController<T, S: CacheStorage = NoopStorage> {
  shared: Arc<Shared<T, S>>,
}

impl<T: Cacheable> ResourceController<T, NoopStorage> {
  /// Create a controller without a cache. Every `start` fetches.
  pub fn new() -> Self {
    Self::with_cache(ResourceCache::new(NoopStorage))
  }
}

impl<T: Cacheable> Default for ResourceController<T, NoopStorage> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Cacheable, S: CacheStorage> ResourceController<T, S> {
  /// Create a controller that reuses fresh results from `cache`.
  pub fn with_cache(cache: ResourceCache<S>) -> Self {
    Self {
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner {
          slots: HashMap::new(),
          next_generation: 0,
          pending: VecDeque::new(),
          observers: Vec::new(),
          next_subscription: 0,
        }),
        dispatching: Mutex::new(()),
        cache_writes: tokio::sync::Mutex::new(()),
        cache,
      }),
    }
  }

  pub fn cache(&self) -> &ResourceCache<S> {
    &self.shared.cache
  }

  /// Begin fetching `key` with `fetcher`.
  ///
  /// A no-op if `key` is already loading: the caller joins the in-flight
  /// fetch and `fetcher` is never invoked. A fresh cache entry satisfies the
  /// request without fetching; the cache is read on the calling thread.
  /// Must be called from within a tokio runtime.
  pub fn start<F, Fut>(&self, key: impl Into<ResourceKey>, fetcher: F) -> StartOutcome
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.begin(key.into(), fetcher, false)
  }

  /// Force a new fetch, even if already loading or cached.
  ///
  /// The in-flight generation, if any, is cancelled and superseded.
  pub fn refetch<F, Fut>(&self, key: impl Into<ResourceKey>, fetcher: F) -> StartOutcome
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.begin(key.into(), fetcher, true)
  }

  /// Cancel the in-flight fetch for `key`.
  ///
  /// Restores the state that was active before the fetch started. Returns
  /// `false` if nothing was loading.
  pub fn cancel(&self, key: impl Into<ResourceKey>) -> bool {
    let key = key.into();
    let handle = {
      let mut guard = self.shared.lock();
      let inner = &mut *guard;

      let Some(slot) = inner.slots.get_mut(&key) else {
        return false;
      };

      let handle = match &*slot.state.borrow() {
        RequestState::Loading { cancel } => cancel.clone(),
        _ => return false,
      };

      handle.cancel();
      let restored = std::mem::replace(&mut slot.previous, RequestState::Idle);
      slot.state.send_replace(restored.clone());
      if restored.is_idle() && slot.state.receiver_count() == 0 {
        inner.slots.remove(&key);
      }
      inner.publish(&key, &restored);
      handle
    };

    debug!(key = %key, generation = handle.generation(), "fetch cancelled");
    self.shared.flush();
    true
  }

  /// Cancel every in-flight fetch. Call this when the owning view goes away.
  pub fn cancel_all(&self) -> usize {
    let loading: Vec<ResourceKey> = {
      let inner = self.shared.lock();
      inner
        .slots
        .iter()
        .filter(|(_, slot)| slot.state.borrow().is_loading())
        .map(|(key, _)| key.clone())
        .collect()
    };

    loading.into_iter().filter(|key| self.cancel(key)).count()
  }

  /// Current state of `key`. Never blocks on a fetch or on the cache.
  pub fn state(&self, key: impl Into<ResourceKey>) -> RequestState<T> {
    let key = key.into();
    let inner = self.shared.lock();
    inner
      .slots
      .get(&key)
      .map(|slot| slot.state.borrow().clone())
      .unwrap_or(RequestState::Idle)
  }

  /// Check if `key` holds data older than `max_age`.
  pub fn is_stale(&self, key: impl Into<ResourceKey>, max_age: Duration) -> bool {
    self.is_stale_at(key, max_age, Utc::now())
  }

  /// Like [`is_stale`](Self::is_stale), measured at `now`.
  pub fn is_stale_at(
    &self,
    key: impl Into<ResourceKey>,
    max_age: Duration,
    now: DateTime<Utc>,
  ) -> bool {
    self
      .state(key)
      .fetched_at()
      .map(|fetched_at| is_older_than(fetched_at, max_age, now))
      .unwrap_or(false)
  }

  /// Receive every state change of `key`.
  pub fn watch(&self, key: impl Into<ResourceKey>) -> watch::Receiver<RequestState<T>> {
    let key = key.into();
    let mut inner = self.shared.lock();
    inner
      .slots
      .entry(key)
      .or_insert_with(Slot::new)
      .state
      .subscribe()
  }

  /// Wait until `key` is no longer loading and return its state.
  pub async fn settled(&self, key: impl Into<ResourceKey>) -> RequestState<T> {
    let key = key.into();
    let mut rx = self.watch(&key);
    let settled = rx.wait_for(|state| !state.is_loading()).await.map(|s| s.clone());
    match settled {
      Ok(state) => state,
      Err(_) => self.state(&key),
    }
  }

  /// Register an observer for state changes of every key.
  ///
  /// Observers may call back into the controller; transitions they cause are
  /// delivered after the current one.
  pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
  where
    F: Fn(&ResourceKey, &RequestState<T>) + Send + Sync + 'static,
  {
    let mut inner = self.shared.lock();
    let id = SubscriptionId(inner.next_subscription);
    inner.next_subscription += 1;
    let observer: Observer<T> = Arc::new(observer);
    inner.observers.push((id, observer));
    id
  }

  /// Remove an observer. Returns `false` if it was not registered.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut inner = self.shared.lock();
    let before = inner.observers.len();
    inner.observers.retain(|(existing, _)| *existing != id);
    inner.observers.len() != before
  }

  /// Drop the cached result for `key` so the next `start` fetches.
  pub fn invalidate(&self, key: impl Into<ResourceKey>) -> Result<()> {
    self.shared.cache.invalidate(&key.into())
  }

  fn begin<F, Fut>(&self, key: ResourceKey, fetcher: F, force: bool) -> StartOutcome
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    if !force {
      if let Some(generation) = self.shared.loading_generation(&key) {
        debug!(key = %key, generation, "joining in-flight fetch");
        return StartOutcome::Joined { generation };
      }
    }

    // Read outside the lock; the slot is checked again below
    let cached = if force {
      None
    } else {
      self.shared.fresh_from_cache(&key)
    };

    let mut guard = self.shared.lock();
    let inner = &mut *guard;
    let slot = inner.slots.entry(key.clone()).or_insert_with(Slot::new);
    let current = slot.state.borrow().clone();

    if let RequestState::Loading { cancel } = &current {
      if !force {
        debug!(key = %key, generation = cancel.generation(), "joining in-flight fetch");
        return StartOutcome::Joined {
          generation: cancel.generation(),
        };
      }
      // Superseded: the older generation keeps its `previous`
      cancel.cancel();
    } else {
      if let Some(state) = cached {
        slot.state.send_replace(state.clone());
        inner.publish(&key, &state);
        drop(guard);

        debug!(key = %key, "served from cache");
        self.shared.flush();
        return StartOutcome::Cached;
      }
      slot.previous = current;
    }

    inner.next_generation += 1;
    let generation = inner.next_generation;
    let (abort, registration) = AbortHandle::new_pair();
    let state = RequestState::Loading {
      cancel: CancelHandle::new(generation, abort),
    };
    slot.state.send_replace(state.clone());
    inner.publish(&key, &state);
    drop(guard);

    debug!(key = %key, generation, "fetch started");
    self.shared.flush();

    let shared = Arc::clone(&self.shared);
    tokio::spawn(async move {
      match Abortable::new(async move { fetcher().await }, registration).await {
        Ok(result) => shared.settle(&key, generation, result).await,
        Err(_) => debug!(key = %key, generation, "fetch abandoned after cancellation"),
      }
    });

    StartOutcome::Started { generation }
  }
}

impl<T: Cacheable, S: CacheStorage> Shared<T, S> {
  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    // Observers never run under this lock, so a poisoned state is still consistent
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn loading_generation(&self, key: &ResourceKey) -> Option<u64> {
    self
      .lock()
      .slots
      .get(key)
      .and_then(|slot| slot.state.borrow().loading_generation())
  }

  fn fresh_from_cache(&self, key: &ResourceKey) -> Option<RequestState<T>> {
    match self.cache.fresh::<T>(key, Utc::now()) {
      Ok(entry) => entry.map(|entry| RequestState::Succeeded {
        data: Arc::new(entry.data),
        fetched_at: entry.fetched_at,
      }),
      Err(e) => {
        warn!(key = %key, error = %e, "cache read failed, fetching instead");
        None
      }
    }
  }

  /// Apply the result of `generation`, unless it was cancelled or superseded.
  ///
  /// A successful result is written to the cache before it becomes visible,
  /// so a settled key can already be served from the cache.
  async fn settle(&self, key: &ResourceKey, generation: u64, result: Result<T, FetchError>) {
    match result {
      Ok(data) => {
        let _writing = self.cache_writes.lock().await;
        if self.loading_generation(key) != Some(generation) {
          debug!(key = %key, generation, "discarding stale response");
          return;
        }
        let data = Arc::new(data);
        let fetched_at = Utc::now();
        self.write_cache(key, &data, fetched_at).await;
        self.commit(key, generation, RequestState::Succeeded { data, fetched_at });
      }
      Err(error) => self.commit(key, generation, RequestState::Failed { error }),
    }
  }

  async fn write_cache(&self, key: &ResourceKey, data: &Arc<T>, fetched_at: DateTime<Utc>) {
    let cache = self.cache.clone();
    let entry_key = key.clone();
    let data = Arc::clone(data);
    let written =
      tokio::task::spawn_blocking(move || cache.store(&entry_key, data.as_ref(), fetched_at)).await;

    match written {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(key = %key, error = %e, "failed to cache fetch result"),
      Err(e) => warn!(key = %key, error = %e, "cache write task failed"),
    }
  }

  fn commit(&self, key: &ResourceKey, generation: u64, state: RequestState<T>) {
    {
      let mut guard = self.lock();
      let inner = &mut *guard;

      let Some(slot) = inner.slots.get_mut(key) else {
        debug!(key = %key, generation, "discarding response for a pruned key");
        return;
      };

      if slot.state.borrow().loading_generation() != Some(generation) {
        debug!(key = %key, generation, "discarding stale response");
        return;
      }

      slot.state.send_replace(state.clone());
      slot.previous = RequestState::Idle;
      inner.publish(key, &state);
    }

    debug!(key = %key, generation, phase = state.phase(), "fetch settled");
    self.flush();
  }

  /// Deliver queued transitions to observers.
  ///
  /// One caller delivers at a time. A caller that finds delivery in progress
  /// leaves its transitions to the current deliverer, which drains the queue
  /// before giving up the role.
  fn flush(&self) {
    loop {
      let dispatching = match self.dispatching.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return,
      };

      loop {
        let next = {
          let mut inner = self.lock();
          inner
            .pending
            .pop_front()
            .map(|(key, state)| (key, state, inner.observers()))
        };
        let Some((key, state, observers)) = next else {
          break;
        };
        notify(&observers, &key, &state);
      }

      drop(dispatching);
      // Transitions queued while we held the role but after our last pop
      if self.lock().pending.is_empty() {
        return;
      }
    }
  }
}

fn notify<T>(observers: &[Observer<T>], key: &ResourceKey, state: &RequestState<T>) {
  for observer in observers {
    observer(key, state);
  }
}

impl<T, S: CacheStorage> Clone for ResourceController<T, S> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T, S: CacheStorage> std::fmt::Debug for ResourceController<T, S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let keys = self
      .shared
      .inner
      .lock()
      .map(|inner| inner.slots.len())
      .unwrap_or(0);
    f.debug_struct("ResourceController")
      .field("keys", &keys)
      .field("stale_time", &self.shared.cache.stale_time())
      .finish_non_exhaustive()
  }
}
