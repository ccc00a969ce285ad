//! Request lifecycle states and the errors a fetch can settle with.

use chrono::{DateTime, Utc};
use futures::future::AbortHandle;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a fetch failed. Stored in [`RequestState::Failed`], never returned to
/// the caller of `start`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// The request never produced a response (DNS, connect, reset, ...)
  #[error("network error: {0}")]
  Network(String),
  /// The server answered with a non-success status
  #[error("request to {url} failed with status {status}")]
  Status { status: u16, url: String },
  /// The response body could not be parsed
  #[error("failed to decode response: {0}")]
  Decode(String),
  /// The fetcher gave up after the given duration
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// Any other failure reported by the fetcher
  #[error("{0}")]
  Other(String),
}

impl From<String> for FetchError {
  fn from(message: String) -> Self {
    FetchError::Other(message)
  }
}

impl From<&str> for FetchError {
  fn from(message: &str) -> Self {
    FetchError::Other(message.to_string())
  }
}

/// Handle to the in-flight fetch of one generation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  generation: u64,
  abort: AbortHandle,
}

impl CancelHandle {
  pub(crate) fn new(generation: u64, abort: AbortHandle) -> Self {
    Self { generation, abort }
  }

  /// Generation this handle belongs to.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// Signal the fetch to stop. The fetch observes this at its next poll.
  pub fn cancel(&self) {
    self.abort.abort();
  }

  pub fn is_cancelled(&self) -> bool {
    self.abort.is_aborted()
  }
}

/// The lifecycle phase of one resource key.
#[derive(Debug, Clone)]
pub enum RequestState<T> {
  /// No fetch issued yet
  Idle,
  /// Fetch in flight
  Loading { cancel: CancelHandle },
  /// Most recent successful payload
  Succeeded {
    data: Arc<T>,
    fetched_at: DateTime<Utc>,
  },
  /// Most recent failure
  Failed { error: FetchError },
}

impl<T> RequestState<T> {
  pub fn is_idle(&self) -> bool {
    matches!(self, RequestState::Idle)
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, RequestState::Loading { .. })
  }

  pub fn is_success(&self) -> bool {
    matches!(self, RequestState::Succeeded { .. })
  }

  pub fn is_error(&self) -> bool {
    matches!(self, RequestState::Failed { .. })
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      RequestState::Succeeded { data, .. } => Some(data.as_ref()),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&FetchError> {
    match self {
      RequestState::Failed { error } => Some(error),
      _ => None,
    }
  }

  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    match self {
      RequestState::Succeeded { fetched_at, .. } => Some(*fetched_at),
      _ => None,
    }
  }

  /// Generation of the in-flight fetch, if any.
  pub fn loading_generation(&self) -> Option<u64> {
    match self {
      RequestState::Loading { cancel } => Some(cancel.generation()),
      _ => None,
    }
  }

  /// Short lowercase name of the phase, for logs.
  pub fn phase(&self) -> &'static str {
    match self {
      RequestState::Idle => "idle",
      RequestState::Loading { .. } => "loading",
      RequestState::Succeeded { .. } => "succeeded",
      RequestState::Failed { .. } => "failed",
    }
  }
}

/// What a call to `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
  /// A new fetch was spawned under this generation
  Started { generation: u64 },
  /// A fetch was already in flight; the caller joined it
  Joined { generation: u64 },
  /// A fresh cache entry satisfied the request without fetching
  Cached,
}

impl StartOutcome {
  pub fn generation(&self) -> Option<u64> {
    match self {
      StartOutcome::Started { generation } | StartOutcome::Joined { generation } => {
        Some(*generation)
      }
      StartOutcome::Cached => None,
    }
  }
}

/// Bound a fetch with a timeout, failing with [`FetchError::Timeout`].
///
/// The controller never enforces timeouts itself; fetchers compose this.
pub async fn with_timeout<T, Fut>(duration: Duration, future: Fut) -> Result<T, FetchError>
where
  Fut: Future<Output = Result<T, FetchError>>,
{
  match tokio::time::timeout(duration, future).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout(duration)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_other_error_displays_bare_message() {
    let error = FetchError::from("network down");
    assert_eq!(error.to_string(), "network down");
  }

  #[test]
  fn test_status_error_display() {
    let error = FetchError::Status {
      status: 404,
      url: "https://example.com/users".to_string(),
    };
    assert_eq!(
      error.to_string(),
      "request to https://example.com/users failed with status 404"
    );
  }

  #[test]
  fn test_state_accessors() {
    let state: RequestState<i32> = RequestState::Succeeded {
      data: Arc::new(7),
      fetched_at: Utc::now(),
    };
    assert!(state.is_success());
    assert_eq!(state.data(), Some(&7));
    assert_eq!(state.phase(), "succeeded");

    let state: RequestState<i32> = RequestState::Failed {
      error: FetchError::from("boom"),
    };
    assert!(state.is_error());
    assert_eq!(state.error(), Some(&FetchError::Other("boom".to_string())));
    assert!(state.data().is_none());
  }

  #[test]
  fn test_cancel_handle() {
    let (abort, _registration) = AbortHandle::new_pair();
    let handle = CancelHandle::new(3, abort);
    assert_eq!(handle.generation(), 3);
    assert!(!handle.is_cancelled());
    handle.cancel();
    assert!(handle.is_cancelled());
  }

  #[tokio::test]
  async fn test_with_timeout_expires() {
    let result: Result<(), FetchError> = with_timeout(Duration::from_millis(5), async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(())
    })
    .await;
    assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(5))));
  }

  #[tokio::test]
  async fn test_with_timeout_passes_result_through() {
    let result = with_timeout(Duration::from_secs(1), async { Ok::<_, FetchError>(42) }).await;
    assert_eq!(result, Ok(42));
  }
}
