//! Cache layer that composes the cache store with network fetching.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::store::{CacheOptions, CacheStore};

/// Options for [`CacheLayer::get_with_fallback`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  pub ttl: Option<Duration>,
  pub suffix: Option<String>,
  /// Skip the cache read and always fetch.
  pub force_refresh: bool,
}

impl FetchOptions {
  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
    self.suffix = Some(suffix.into());
    self
  }

  pub fn force_refresh(mut self, force: bool) -> Self {
    self.force_refresh = force;
    self
  }

  fn cache_options(&self) -> CacheOptions {
    CacheOptions {
      ttl: self.ttl,
      suffix: self.suffix.clone(),
    }
  }
}

/// Deferred network refresh handed back alongside cached data.
pub struct RefreshHandle<T> {
  run: Box<dyn FnOnce() -> BoxFuture<'static, Option<T>> + Send>,
}

impl<T> RefreshHandle<T> {
  /// Fetch from the network and overwrite the cache entry.
  /// `None` when the fetch fails; the cached copy is then left alone.
  pub async fn run(self) -> Option<T> {
    (self.run)().await
  }
}

/// Result of a cache-first read.
pub struct Fetched<T> {
  pub data: Option<T>,
  pub is_from_cache: bool,
  /// Present when `data` came from the cache.
  pub refresh: Option<RefreshHandle<T>>,
}

/// Cache-first reads with fetch fallback.
///
/// Concurrent callers on a cold key each run their own fetch; there is no
/// de-duplication at this level.
#[derive(Clone)]
pub struct CacheLayer {
  store: CacheStore,
}

impl CacheLayer {
  pub fn new(store: CacheStore) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Drop every cached read whose key starts with `pattern`.
  pub fn invalidate(&self, pattern: &str) {
    self.store.remove_by_pattern(pattern);
  }

  /// Return cached data when valid, otherwise fetch, cache and return.
  ///
  /// Fetch failures are logged and produce `data: None`.
  pub async fn get_with_fallback<T, E, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: FetchOptions,
  ) -> Fetched<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    E: Display + Send,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    if !options.force_refresh {
      if let Some(cached) = self.store.get::<T>(key, options.suffix.as_deref()) {
        debug!(key, "Serving from cache");
        let store = self.store.clone();
        let key = key.to_string();
        let refresh = RefreshHandle {
          run: Box::new(move || {
            async move { fetch_and_store(&store, &key, &fetcher, &options).await }.boxed()
          }),
        };
        return Fetched {
          data: Some(cached),
          is_from_cache: true,
          refresh: Some(refresh),
        };
      }
    }

    Fetched {
      data: fetch_and_store(&self.store, key, &fetcher, &options).await,
      is_from_cache: false,
      refresh: None,
    }
  }
}

async fn fetch_and_store<T, E, F, Fut>(
  store: &CacheStore,
  key: &str,
  fetcher: &F,
  options: &FetchOptions,
) -> Option<T>
where
  T: Serialize,
  E: Display,
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  match fetcher().await {
    Ok(data) => {
      store.set(key, &data, options.cache_options());
      Some(data)
    }
    Err(e) => {
      warn!(key, error = %e, "Fetch failed");
      None
    }
  }
}
