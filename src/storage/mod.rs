//! Durable key/value storage backing the token store and the persistent cache tier.
//!
//! Backends store opaque strings; callers own the encoding of what they put in.

mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Trait for durable key/value backends.
pub trait KeyValueStore: Send + Sync {
  /// Read a value, `None` when the key is absent.
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace a value.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete a single key. Missing keys are not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// Delete several keys at once.
  fn remove_many(&self, keys: &[String]) -> Result<()>;

  /// List every stored key.
  fn list_keys(&self) -> Result<Vec<String>>;
}
