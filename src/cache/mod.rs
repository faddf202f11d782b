//! Two-tier response cache.
//!
//! - `CacheStore`: in-process map (bounded, insertion-order eviction) in front
//!   of durable storage, with per-entry TTL checked lazily on read
//! - `CacheLayer`: cache-first reads that fall back to a caller-supplied fetch
//! - Pattern invalidation for families of keys and a schema-version wipe

mod entry;
mod layer;
mod memory;
mod store;

pub use entry::{CacheEntry, CacheMetadata};
pub use layer::{CacheLayer, FetchOptions, Fetched, RefreshHandle};
pub use memory::{MemoryTier, DEFAULT_CAPACITY};
pub use store::{CacheOptions, CacheStats, CacheStore, CACHE_META_KEY, CACHE_PREFIX, DEFAULT_TTL};
