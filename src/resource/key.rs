use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for an independent fetch target (e.g., a URL or "users").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash of the key, used as a fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ResourceKey {
  fn from(key: &str) -> Self {
    Self::new(key)
  }
}

impl From<String> for ResourceKey {
  fn from(key: String) -> Self {
    Self(key)
  }
}

impl From<&ResourceKey> for ResourceKey {
  fn from(key: &ResourceKey) -> Self {
    key.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_hash_is_stable() {
    let a = ResourceKey::from("users");
    let b = ResourceKey::new(String::from("users"));
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_distinct_keys_hash_differently() {
    assert_ne!(
      ResourceKey::from("users").cache_hash(),
      ResourceKey::from("users/1").cache_hash()
    );
  }
}
