//! HTTP transport producing fetchers for the resource controller.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use crate::resource::{with_timeout, FetchError};

/// JSON-over-HTTP client rooted at a base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url = parse_base_url(base_url)?;
    let client = reqwest::Client::builder()
      .connect_timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      timeout,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve `path` against the base URL.
  pub fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| FetchError::Other(format!("invalid path '{}': {}", path, e)))
  }

  /// GET `path` and decode the JSON body, bounded by the transport timeout.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
    let url = self.endpoint(path)?;
    with_timeout(self.timeout, self.request_json(url)).await
  }

  async fn request_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status {
        status: status.as_u16(),
        url: url.to_string(),
      });
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;
    decode_body(&body)
  }

  /// A fetcher for `path`, suitable for `ResourceController::start`.
  pub fn fetcher<T>(
    &self,
    path: &str,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<T, FetchError>> + Send + 'static
  where
    T: DeserializeOwned + Send + 'static,
  {
    let transport = self.clone();
    let path = path.to_string();
    move || async move { transport.get_json::<T>(&path).await }.boxed()
  }
}

/// Parse a base URL, making sure relative paths extend it instead of
/// replacing its last segment.
fn parse_base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid base URL '{}': {}", raw, e))?;
  if url.cannot_be_a_base() {
    return Err(eyre!("Base URL '{}' cannot carry paths", raw));
  }
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FetchError> {
  serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))
}
