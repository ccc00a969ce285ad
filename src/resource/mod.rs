//! Async resource fetching with per-key request state.

mod controller;
mod key;
mod state;

pub use controller::{Observer, ResourceController, SubscriptionId};
pub use key::ResourceKey;
pub use state::{with_timeout, CancelHandle, FetchError, RequestState, StartOutcome};
