//! Two-tier cache: bounded in-process map in front of durable storage.
//!
//! The durable copy is the source of truth; the in-process copy is an
//! accelerator written alongside it. Expiry is checked lazily on read in both
//! tiers. Nothing here returns an error: storage failures are logged and the
//! cache degrades to session-only.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{storage_key, CacheEntry, CacheMetadata};
use super::memory::MemoryTier;
use crate::clock::Clock;
use crate::storage::KeyValueStore;

/// Durable key prefix for cache entries.
pub const CACHE_PREFIX: &str = "cache.";
/// Durable key of the metadata record. Must not start with `CACHE_PREFIX`.
pub const CACHE_META_KEY: &str = "cache_meta";
/// TTL used when a write does not specify one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Options for a cache write.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
  pub ttl: Option<Duration>,
  pub suffix: Option<String>,
}

impl CacheOptions {
  pub fn ttl(ttl: Duration) -> Self {
    Self {
      ttl: Some(ttl),
      suffix: None,
    }
  }

  pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
    self.suffix = Some(suffix.into());
    self
  }
}

/// Snapshot of in-process tier usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub memory_entries: usize,
  pub memory_capacity: usize,
}

struct Inner {
  memory: Mutex<MemoryTier>,
  persistent: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
}

/// Namespaced two-tier cache. Cheap to clone; clones share both tiers.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
}

impl CacheStore {
  pub fn with_settings(
    persistent: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    default_ttl: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        memory: Mutex::new(MemoryTier::new(capacity)),
        persistent,
        clock,
        default_ttl,
      }),
    }
  }

  /// Read a valid entry, promoting persistent hits into memory.
  pub fn get<T: DeserializeOwned>(&self, key: &str, suffix: Option<&str>) -> Option<T> {
    let full_key = storage_key(CACHE_PREFIX, key, suffix);
    let now = self.inner.clock.now_millis();

    let in_memory = {
      let mut memory = self.memory();
      match memory.get(&full_key) {
        Some(entry) if entry.is_valid(now) => Some(entry.data.clone()),
        Some(_) => {
          memory.remove(&full_key);
          None
        }
        None => None,
      }
    };

    if let Some(data) = in_memory {
      return match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(key = %full_key, error = %e, "Cached value has unexpected shape, discarding");
          self.memory().remove(&full_key);
          self.remove_persistent(&full_key);
          None
        }
      };
    }

    let raw = match self.inner.persistent.get(&full_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %full_key, error = %e, "Persistent cache read failed");
        return None;
      }
    };

    let entry: CacheEntry = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %full_key, error = %e, "Corrupt cache entry, discarding");
        self.remove_persistent(&full_key);
        return None;
      }
    };

    if !entry.is_valid(now) {
      debug!(key = %full_key, "Cache entry expired");
      self.remove_persistent(&full_key);
      return None;
    }

    let value = match serde_json::from_value(entry.data.clone()) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = %full_key, error = %e, "Cached value has unexpected shape, discarding");
        self.remove_persistent(&full_key);
        return None;
      }
    };

    // A write that landed during the durable read is newer than `entry`.
    let mut memory = self.memory();
    if !memory.contains(&full_key) {
      memory.insert(full_key, entry);
    }
    Some(value)
  }

  /// Write `value` to both tiers, stamped with the current time.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, options: CacheOptions) {
    let full_key = storage_key(CACHE_PREFIX, key, options.suffix.as_deref());
    let data = match serde_json::to_value(value) {
      Ok(data) => data,
      Err(e) => {
        warn!(key = %full_key, error = %e, "Value is not serializable, not caching");
        return;
      }
    };

    let ttl = options.ttl.unwrap_or(self.inner.default_ttl);
    let entry = CacheEntry::new(
      data,
      self.inner.clock.now_millis(),
      i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
    );

    let encoded = serde_json::to_string(&entry);

    // Both tiers are written under the tier lock so concurrent writers land in
    // the same order in each.
    let mut memory = self.memory();
    if let Some(evicted) = memory.insert(full_key.clone(), entry) {
      debug!(key = %evicted, "Evicted from in-process cache");
    }

    match encoded {
      Ok(encoded) => {
        if let Err(e) = self.inner.persistent.set(&full_key, &encoded) {
          warn!(key = %full_key, error = %e, "Persistent cache write failed");
        }
      }
      Err(e) => warn!(key = %full_key, error = %e, "Failed to encode cache entry"),
    }
  }

  pub fn remove(&self, key: &str, suffix: Option<&str>) {
    let full_key = storage_key(CACHE_PREFIX, key, suffix);
    self.memory().remove(&full_key);
    self.remove_persistent(&full_key);
  }

  /// Remove every entry whose logical key starts with `pattern`, suffixed variants included.
  pub fn remove_by_pattern(&self, pattern: &str) {
    let prefix = format!("{}{}", CACHE_PREFIX, pattern);
    let removed = self.memory().remove_prefix(&prefix);
    debug!(pattern, removed, "Invalidated in-process cache entries");
    self.remove_persistent_prefix(&prefix);
  }

  /// Wipe every cache entry from both tiers.
  pub fn clear_all(&self) {
    self.memory().clear();
    self.remove_persistent_prefix(CACHE_PREFIX);
    debug!("Cache cleared");
  }

  /// Clear the cache if it was written by a different payload schema version.
  /// Returns whether a wipe happened.
  pub fn ensure_version(&self, version: &str) -> bool {
    let current = match self.inner.persistent.get(CACHE_META_KEY) {
      Ok(raw) => raw.and_then(|raw| serde_json::from_str::<CacheMetadata>(&raw).ok()),
      Err(e) => {
        warn!(error = %e, "Failed to read cache metadata");
        None
      }
    };

    if current.as_ref().map(|m| m.version.as_str()) == Some(version) {
      return false;
    }

    debug!(
      previous = current.as_ref().map(|m| m.version.as_str()).unwrap_or("none"),
      version, "Cache schema version changed, clearing"
    );
    self.clear_all();

    let metadata = CacheMetadata {
      version: version.to_string(),
      last_cleared: self.inner.clock.now_millis(),
    };
    match serde_json::to_string(&metadata) {
      Ok(encoded) => {
        if let Err(e) = self.inner.persistent.set(CACHE_META_KEY, &encoded) {
          warn!(error = %e, "Failed to write cache metadata");
        }
      }
      Err(e) => warn!(error = %e, "Failed to encode cache metadata"),
    }
    true
  }

  pub fn metadata(&self) -> Option<CacheMetadata> {
    self
      .inner
      .persistent
      .get(CACHE_META_KEY)
      .ok()
      .flatten()
      .and_then(|raw| serde_json::from_str(&raw).ok())
  }

  pub fn stats(&self) -> CacheStats {
    let memory = self.memory();
    CacheStats {
      memory_entries: memory.len(),
      memory_capacity: memory.capacity(),
    }
  }

  fn memory(&self) -> MutexGuard<'_, MemoryTier> {
    match self.inner.memory.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn remove_persistent(&self, full_key: &str) {
    if let Err(e) = self.inner.persistent.remove(full_key) {
      warn!(key = %full_key, error = %e, "Persistent cache delete failed");
    }
  }

  fn remove_persistent_prefix(&self, prefix: &str) {
    let keys: Vec<String> = match self.inner.persistent.list_keys() {
      Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
      Err(e) => {
        warn!(prefix, error = %e, "Failed to list persistent cache keys");
        return;
      }
    };

    if let Err(e) = self.inner.persistent.remove_many(&keys) {
      warn!(prefix, error = %e, "Persistent cache bulk delete failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::storage::MemoryStore;
  use color_eyre::{eyre::eyre, Result};
  use serde_json::{json, Value};

  struct Fixture {
    cache: CacheStore,
    clock: Arc<ManualClock>,
    persistent: Arc<MemoryStore>,
  }

  fn fixture(capacity: usize) -> Fixture {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let persistent = Arc::new(MemoryStore::new());
    let cache = CacheStore::with_settings(persistent.clone(), clock.clone(), capacity, DEFAULT_TTL);
    Fixture {
      cache,
      clock,
      persistent,
    }
  }

  /// A second cache over the same durable store, i.e. a cold process.
  fn cold(f: &Fixture) -> CacheStore {
    CacheStore::with_settings(f.persistent.clone(), f.clock.clone(), 10, DEFAULT_TTL)
  }

  #[test]
  fn test_dashboard_expires_after_ttl() {
    let f = fixture(10);
    let dashboard = json!({ "applications": 3, "views": 120 });

    f.cache
      .set("dashboard", &dashboard, CacheOptions::ttl(Duration::from_millis(5_000)));
    assert_eq!(f.cache.get::<Value>("dashboard", None), Some(dashboard));

    f.clock.advance(6_000);
    assert_eq!(f.cache.get::<Value>("dashboard", None), None);
    assert_eq!(f.persistent.get("cache.dashboard").unwrap(), None);
  }

  #[test]
  fn test_ttl_boundary_in_both_tiers() {
    let f = fixture(10);
    f.cache.set("k", &1, CacheOptions::ttl(Duration::from_millis(100)));

    f.clock.advance(99);
    assert_eq!(f.cache.get::<i32>("k", None), Some(1));
    assert_eq!(cold(&f).get::<i32>("k", None), Some(1));

    f.clock.advance(1);
    assert_eq!(cold(&f).get::<i32>("k", None), None);
    assert_eq!(f.cache.get::<i32>("k", None), None);
  }

  #[test]
  fn test_default_ttl_applies() {
    let f = fixture(10);
    f.cache.set("k", &"v", CacheOptions::default());

    f.clock.advance(DEFAULT_TTL.as_millis() as i64 - 1);
    assert_eq!(f.cache.get::<String>("k", None).as_deref(), Some("v"));
    f.clock.advance(1);
    assert_eq!(f.cache.get::<String>("k", None), None);
  }

  #[test]
  fn test_persistent_hit_is_promoted() {
    let f = fixture(10);
    f.cache.set("profile", &json!({"name": "Ada"}), CacheOptions::default());

    let fresh = cold(&f);
    assert_eq!(fresh.stats().memory_entries, 0);
    assert!(fresh.get::<Value>("profile", None).is_some());
    assert_eq!(fresh.stats().memory_entries, 1);

    // Served from memory even once the durable copy is gone.
    f.persistent.remove("cache.profile").unwrap();
    assert!(fresh.get::<Value>("profile", None).is_some());
  }

  #[test]
  fn test_expired_persistent_entry_is_not_promoted() {
    let f = fixture(10);
    f.cache.set("k", &1, CacheOptions::ttl(Duration::from_millis(10)));
    f.clock.advance(10);

    let fresh = cold(&f);
    assert_eq!(fresh.get::<i32>("k", None), None);
    assert_eq!(fresh.stats().memory_entries, 0);
    assert_eq!(f.persistent.get("cache.k").unwrap(), None);
  }

  #[test]
  fn test_suffix_variants_are_separate_entries() {
    let f = fixture(10);
    f.cache.set("properties", &json!(["a", "b"]), CacheOptions::default());
    f.cache.set(
      "properties",
      &json!({"id": 7}),
      CacheOptions::default().with_suffix("7"),
    );

    assert_eq!(
      f.cache.get::<Value>("properties", Some("7")),
      Some(json!({"id": 7}))
    );
    f.cache.remove("properties", Some("7"));
    assert_eq!(f.cache.get::<Value>("properties", Some("7")), None);
    assert!(f.cache.get::<Value>("properties", None).is_some());
  }

  #[test]
  fn test_remove_by_pattern() {
    let f = fixture(10);
    f.cache.set("properties", &1, CacheOptions::default());
    f.cache.set("properties_featured", &2, CacheOptions::default());
    f.cache
      .set("properties", &3, CacheOptions::default().with_suffix("42"));
    f.cache.set("applications", &4, CacheOptions::default());

    f.cache.remove_by_pattern("properties");

    assert_eq!(f.cache.get::<i32>("properties", None), None);
    assert_eq!(f.cache.get::<i32>("properties_featured", None), None);
    assert_eq!(f.cache.get::<i32>("properties", Some("42")), None);
    assert_eq!(cold(&f).get::<i32>("properties", None), None);
    assert_eq!(f.cache.get::<i32>("applications", None), Some(4));
  }

  #[test]
  fn test_capacity_evicts_earliest_insert_only_from_memory() {
    let f = fixture(2);
    f.cache.set("a", &1, CacheOptions::default());
    f.cache.set("b", &2, CacheOptions::default());
    f.cache.get::<i32>("a", None);
    f.cache.set("c", &3, CacheOptions::default());

    assert_eq!(f.cache.stats().memory_entries, 2);
    // "a" left memory but the durable copy still answers.
    f.persistent.remove("cache.b").unwrap();
    f.persistent.remove("cache.c").unwrap();
    assert_eq!(f.cache.get::<i32>("b", None), Some(2));
    assert_eq!(f.cache.get::<i32>("c", None), Some(3));
    assert_eq!(f.cache.get::<i32>("a", None), Some(1));
  }

  #[test]
  fn test_corrupt_entry_is_a_miss_and_discarded() {
    let f = fixture(10);
    f.persistent.set("cache.broken", "{not json").unwrap();

    assert_eq!(f.cache.get::<Value>("broken", None), None);
    assert_eq!(f.persistent.get("cache.broken").unwrap(), None);
  }

  #[test]
  fn test_extreme_timestamp_is_a_miss_and_discarded() {
    let f = fixture(10);
    f.persistent
      .set(
        "cache.k",
        r#"{"data":1,"timestamp":-9223372036854775808,"ttl":1}"#,
      )
      .unwrap();

    assert_eq!(f.cache.get::<i32>("k", None), None);
    assert_eq!(f.persistent.get("cache.k").unwrap(), None);
  }

  #[test]
  fn test_wrong_shape_is_a_miss() {
    let f = fixture(10);
    f.cache.set("k", &json!({"a": 1}), CacheOptions::default());

    assert_eq!(f.cache.get::<Vec<i32>>("k", None), None);
    assert_eq!(f.cache.get::<Value>("k", None), None);
  }

  #[test]
  fn test_clear_all_keeps_non_cache_keys() {
    let f = fixture(10);
    f.persistent.set("auth.device_id", "device").unwrap();
    f.cache.set("a", &1, CacheOptions::default());
    f.cache.set("b", &2, CacheOptions::default());

    f.cache.clear_all();

    assert_eq!(f.cache.get::<i32>("a", None), None);
    assert_eq!(f.cache.stats().memory_entries, 0);
    assert_eq!(
      f.persistent.list_keys().unwrap(),
      vec!["auth.device_id".to_string()]
    );
  }

  #[test]
  fn test_ensure_version() {
    let f = fixture(10);
    f.cache.set("a", &1, CacheOptions::default());

    assert!(f.cache.ensure_version("1"));
    assert_eq!(f.cache.get::<i32>("a", None), None);
    assert_eq!(f.cache.metadata().unwrap().version, "1");

    f.cache.set("a", &1, CacheOptions::default());
    assert!(!f.cache.ensure_version("1"));
    assert_eq!(f.cache.get::<i32>("a", None), Some(1));

    f.clock.advance(50);
    assert!(f.cache.ensure_version("2"));
    assert_eq!(f.cache.get::<i32>("a", None), None);
    assert_eq!(f.cache.metadata().unwrap().last_cleared, 1_000_050);
  }

  /// Memory store that runs a one-shot hook in the middle of a read.
  struct ReadHookStore {
    inner: MemoryStore,
    during_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
  }

  impl KeyValueStore for ReadHookStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
      let value = self.inner.get(key)?;
      let hook = self.during_read.lock().unwrap().take();
      if let Some(hook) = hook {
        hook();
      }
      Ok(value)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
      self.inner.set(key, value)
    }
    fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key)
    }
    fn remove_many(&self, keys: &[String]) -> Result<()> {
      self.inner.remove_many(keys)
    }
    fn list_keys(&self) -> Result<Vec<String>> {
      self.inner.list_keys()
    }
  }

  #[test]
  fn test_write_during_durable_read_is_not_shadowed() {
    let clock = Arc::new(ManualClock::new(1_000));
    let persistent = Arc::new(ReadHookStore {
      inner: MemoryStore::new(),
      during_read: Mutex::new(None),
    });
    let cache = CacheStore::with_settings(persistent.clone(), clock.clone(), 10, DEFAULT_TTL);
    // Written by an earlier process: durable only.
    CacheStore::with_settings(persistent.clone(), clock, 10, DEFAULT_TTL).set(
      "k",
      &"old",
      CacheOptions::default(),
    );

    let writer = cache.clone();
    *persistent.during_read.lock().unwrap() = Some(Box::new(move || {
      writer.set("k", &"new", CacheOptions::default());
    }));

    assert_eq!(cache.get::<String>("k", None).as_deref(), Some("old"));

    // Both tiers agree on the later write.
    assert_eq!(cache.get::<String>("k", None).as_deref(), Some("new"));
    let durable: CacheEntry =
      serde_json::from_str(&persistent.inner.get("cache.k").unwrap().unwrap()).unwrap();
    assert_eq!(durable.data, json!("new"));
  }

  /// Durable store that always fails.
  struct BrokenStore;

  impl KeyValueStore for BrokenStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
      Err(eyre!("disk unavailable"))
    }
    fn set(&self, _key: &str, _value: &str) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }
    fn remove(&self, _key: &str) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }
    fn remove_many(&self, _keys: &[String]) -> Result<()> {
      Err(eyre!("disk unavailable"))
    }
    fn list_keys(&self) -> Result<Vec<String>> {
      Err(eyre!("disk unavailable"))
    }
  }

  #[test]
  fn test_storage_failure_degrades_to_session_cache() {
    let cache = CacheStore::with_settings(
      Arc::new(BrokenStore),
      Arc::new(ManualClock::new(0)),
      10,
      DEFAULT_TTL,
    );

    cache.set("k", &5, CacheOptions::default());
    assert_eq!(cache.get::<i32>("k", None), Some(5));
    cache.remove_by_pattern("k");
    assert_eq!(cache.get::<i32>("k", None), None);
    cache.clear_all();
    assert!(cache.ensure_version("1"));
  }
}
