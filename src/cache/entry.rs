//! Stored shapes for cache entries and cache metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached payload stamped with its write time and lifetime (both in ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: Value,
  #[serde(rename = "timestamp")]
  pub written_at: i64,
  #[serde(rename = "ttl")]
  pub ttl_ms: i64,
}

impl CacheEntry {
  pub fn new(data: Value, written_at: i64, ttl_ms: i64) -> Self {
    Self {
      data,
      written_at,
      ttl_ms,
    }
  }

  /// Valid while strictly younger than its TTL. Stamps that cannot be
  /// aged (overflow) are never valid.
  pub fn is_valid(&self, now: i64) -> bool {
    now
      .checked_sub(self.written_at)
      .is_some_and(|age| age < self.ttl_ms)
  }
}

/// Singleton record used to wipe the cache when the payload schema changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  pub version: String,
  pub last_cleared: i64,
}

/// Storage key for a logical key and optional per-entity suffix.
pub fn storage_key(prefix: &str, key: &str, suffix: Option<&str>) -> String {
  match suffix {
    Some(suffix) => format!("{}{}_{}", prefix, key, suffix),
    None => format!("{}{}", prefix, key),
  }
}
