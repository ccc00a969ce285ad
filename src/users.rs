//! Users slice: the model, its reducer and the bridge from a resource
//! controller into a store.

use serde::{Deserialize, Serialize};

use crate::cache::CacheStorage;
use crate::resource::{RequestState, ResourceController, ResourceKey, SubscriptionId};
use crate::store::{Reducer, Store};

/// Message used when a rejection carries no reason.
pub const DEFAULT_USERS_ERROR: &str = "Failed to fetch users";

/// A user as served by `/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub name: String,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub email: String,
}

impl User {
  pub fn new(id: u64, name: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
      username: String::new(),
      email: String::new(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsersState {
  pub users: Vec<User>,
  pub loading: bool,
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsersAction {
  Pending,
  Fulfilled(Vec<User>),
  Rejected(Option<String>),
  Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsersReducer;

impl Reducer for UsersReducer {
  type State = UsersState;
  type Action = UsersAction;

  fn reduce(&self, state: &UsersState, action: UsersAction) -> UsersState {
    match action {
      UsersAction::Pending => UsersState {
        loading: true,
        error: None,
        ..state.clone()
      },
      UsersAction::Fulfilled(users) => UsersState {
        users,
        loading: false,
        error: None,
      },
      UsersAction::Rejected(message) => UsersState {
        loading: false,
        error: Some(
          message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_USERS_ERROR.to_string()),
        ),
        ..state.clone()
      },
      UsersAction::Cancelled => UsersState {
        loading: false,
        ..state.clone()
      },
    }
  }
}

/// Map a request transition to the action the users store expects.
pub fn action_for(state: &RequestState<Vec<User>>) -> UsersAction {
  match state {
    RequestState::Idle => UsersAction::Cancelled,
    RequestState::Loading { .. } => UsersAction::Pending,
    RequestState::Succeeded { data, .. } => UsersAction::Fulfilled(data.as_ref().clone()),
    RequestState::Failed { error } => UsersAction::Rejected(Some(error.to_string())),
  }
}

/// Mirror every transition of `key` into `store`.
///
/// Returns the subscription so the caller can unbind on teardown.
pub fn bind<S: CacheStorage>(
  controller: &ResourceController<Vec<User>, S>,
  store: &Store<UsersReducer>,
  key: impl Into<ResourceKey>,
) -> SubscriptionId {
  let key = key.into();
  let store = store.clone();
  controller.subscribe(move |changed, state| {
    if *changed == key {
      // Dispatch only fails once the runtime is shutting down
      let _ = store.dispatch(action_for(state));
    }
  })
}
