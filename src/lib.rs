//! Async request-state machine for remote resources: de-duplicated fetches,
//! cooperative cancellation, superseded-response guards and staleness-aware
//! caching, plus the small users-list application built on top of it.

pub mod app;
pub mod cache;
pub mod config;
pub mod event;
pub mod logging;
pub mod resource;
pub mod store;
pub mod transport;
pub mod users;

pub use resource::{FetchError, RequestState, ResourceController, ResourceKey, StartOutcome};
