//! Bounded in-process cache tier.

use indexmap::IndexMap;

use super::entry::CacheEntry;

/// Default number of entries kept in process.
pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity map that evicts in insertion order.
///
/// Overwriting a key keeps its original position; reads never reorder.
#[derive(Debug)]
pub struct MemoryTier {
  entries: IndexMap<String, CacheEntry>,
  capacity: usize,
}

impl MemoryTier {
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: IndexMap::new(),
      capacity: capacity.max(1),
    }
  }

  pub fn get(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  /// Insert an entry, evicting the oldest key first if a new key would overflow.
  /// Returns the evicted key, if any.
  pub fn insert(&mut self, key: String, entry: CacheEntry) -> Option<String> {
    let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
      self.entries.shift_remove_index(0).map(|(oldest, _)| oldest)
    } else {
      None
    };

    self.entries.insert(key, entry);
    evicted
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    self.entries.shift_remove(key)
  }

  /// Remove every key starting with `prefix`, returning how many went.
  pub fn remove_prefix(&mut self, prefix: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|k, _| !k.starts_with(prefix));
    before - self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

impl Default for MemoryTier {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}
