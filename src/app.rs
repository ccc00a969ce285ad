use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{CacheStorage, ResourceCache};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::resource::{RequestState, ResourceController, ResourceKey, StartOutcome};
use crate::store::Store;
use crate::transport::HttpTransport;
use crate::users::{self, User, UsersReducer, UsersState};

/// Path of the users list, relative to the API base URL
pub const USERS_PATH: &str = "users";

/// Users list viewer: one resource, one store, printed to stdout.
pub struct App<S: CacheStorage> {
  config: Config,
  transport: HttpTransport,
  users: ResourceController<Vec<User>, S>,
  store: Store<UsersReducer>,
  key: ResourceKey,
  /// Exit after the first settlement instead of watching
  once: bool,
  last_rendered: Option<UsersState>,
}

impl<S: CacheStorage> App<S> {
  /// Must be called from within a tokio runtime.
  pub fn new(config: Config, storage: S, once: bool) -> Result<Self> {
    let transport = HttpTransport::new(&config.api.base_url, config.request_timeout())?;
    let key = transport
      .endpoint(USERS_PATH)
      .map(|url| ResourceKey::new(url.as_str()))
      .map_err(|e| eyre!("Invalid users endpoint: {}", e))?;

    let cache = ResourceCache::new(storage).with_stale_time(config.stale_time());

    Ok(Self {
      config,
      transport,
      users: ResourceController::with_cache(cache),
      store: Store::new(UsersReducer, UsersState::default()),
      key,
      once,
      last_rendered: None,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new(self.config.refresh_interval());
    let mut store_rx = self.store.subscribe();

    let binding = users::bind(&self.users, &self.store, &self.key);

    info!(key = %self.key, "loading users");
    self.load();

    loop {
      tokio::select! {
        event = events.next() => match event {
          Some(Event::Tick) => self.refresh_if_needed(),
          Some(Event::Shutdown) | None => break,
        },
        changed = store_rx.changed() => {
          if changed.is_err() {
            break;
          }
          let state = store_rx.borrow_and_update().clone();
          self.render(state);
        }
      }

      if self.once && self.finished() {
        break;
      }
    }

    // Teardown: nothing may settle into a view that is gone
    let cancelled = self.users.cancel_all();
    self.users.unsubscribe(binding);
    debug!(cancelled, "shut down");

    match self.users.state(&self.key) {
      RequestState::Failed { error } if self.once => Err(eyre!("Failed to fetch users: {}", error)),
      _ => Ok(()),
    }
  }

  fn load(&self) {
    let outcome = self
      .users
      .start(&self.key, self.transport.fetcher::<Vec<User>>(USERS_PATH));
    match outcome {
      StartOutcome::Started { generation } => debug!(generation, "fetch started"),
      StartOutcome::Joined { generation } => debug!(generation, "fetch already in flight"),
      StartOutcome::Cached => info!("serving users from cache"),
    }
  }

  /// Re-fetch on a refresh tick when the data went stale or the last fetch
  /// failed. This is the caller-side retry; the controller never retries.
  fn refresh_if_needed(&self) {
    if self.once {
      return;
    }
    let state = self.users.state(&self.key);
    let stale = self.users.is_stale(&self.key, self.config.stale_time());
    if needs_refresh(&state, stale) {
      info!(phase = state.phase(), "refreshing users");
      self.load();
    }
  }

  /// The first fetch settled and its final state has been printed.
  fn finished(&self) -> bool {
    let state = self.users.state(&self.key);
    let settled = state.is_success() || state.is_error();
    let current = self.store.state();
    settled && !current.loading && self.last_rendered.as_ref() == Some(&current)
  }

  fn render(&mut self, state: UsersState) {
    if self.last_rendered.as_ref() == Some(&state) {
      return;
    }
    for line in render_users(&state) {
      println!("{}", line);
    }
    self.last_rendered = Some(state);
  }

  pub fn stale_time(&self) -> Duration {
    self.config.stale_time()
  }
}

/// Whether a refresh tick should start a new fetch.
fn needs_refresh<T>(state: &RequestState<T>, stale: bool) -> bool {
  match state {
    RequestState::Loading { .. } => false,
    RequestState::Succeeded { .. } => stale,
    RequestState::Idle | RequestState::Failed { .. } => true,
  }
}

/// Text lines for the current users state.
pub fn render_users(state: &UsersState) -> Vec<String> {
  let mut lines = Vec::new();

  if state.loading {
    lines.push(if state.users.is_empty() {
      "Loading...".to_string()
    } else {
      "Refreshing...".to_string()
    });
    return lines;
  }

  if let Some(error) = &state.error {
    lines.push(format!("Error: {}", error));
  }

  for user in &state.users {
    lines.push(format!("{:>4}  {}", user.id, user.name));
  }

  if state.error.is_none() {
    lines.push(format!("({} users)", state.users.len()));
  }

  lines
}
