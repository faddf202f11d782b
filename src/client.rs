//! Wiring: builds the token store, refresh coordinator, pipeline and cache from config.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::auth::{CredentialPair, RefreshCoordinator, TokenStore};
use crate::cache::{CacheLayer, CacheStore, FetchOptions, Fetched};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::ApiError;
use crate::http::pipeline::join_path;
use crate::http::transport::Transport;
use crate::http::{RequestOptions, RequestPipeline, ReqwestTransport};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
  access_token: String,
  refresh_token: String,
}

/// API client with authenticated requests and a response cache.
#[derive(Clone)]
pub struct Client {
  pipeline: RequestPipeline,
  cache: CacheLayer,
  login_path: String,
}

impl Client {
  /// Create a client with SQLite (or in-memory) storage and the reqwest transport.
  pub fn new(config: &Config) -> Result<Self> {
    let store: Arc<dyn KeyValueStore> = if config.storage.persistent {
      Arc::new(SqliteStore::open(config.storage.path.as_deref())?)
    } else {
      Arc::new(MemoryStore::new())
    };

    Self::with_parts(config, store, Arc::new(ReqwestTransport::new()))
  }

  /// Create a client over explicit storage and transport.
  pub fn with_parts(
    config: &Config,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
  ) -> Result<Self> {
    let base_url = Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", config.api.base_url, e))?;
    let refresh_url = join_path(&base_url, &config.api.refresh_path)
      .map_err(|e| eyre!("Invalid refresh path: {}", e))?;

    let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);
    let tokens = Arc::new(TokenStore::new(store.clone(), ids.clone()));
    let coordinator = RefreshCoordinator::new(
      tokens.clone(),
      transport.clone(),
      ids.clone(),
      refresh_url,
      config.timeout(),
    );
    let pipeline = RequestPipeline::new(
      base_url,
      transport,
      tokens,
      coordinator,
      ids,
      config.timeout(),
    );

    let cache_store = CacheStore::with_settings(
      store,
      Arc::new(SystemClock),
      config.cache.capacity,
      config.default_ttl(),
    );
    if cache_store.ensure_version(&config.cache.schema_version) {
      info!(version = %config.cache.schema_version, "Cache reset for schema version");
    }

    Ok(Self {
      pipeline,
      cache: CacheLayer::new(cache_store),
      login_path: config.api.login_path.clone(),
    })
  }

  pub fn pipeline(&self) -> &RequestPipeline {
    &self.pipeline
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn tokens(&self) -> &Arc<TokenStore> {
    self.pipeline.tokens()
  }

  /// Register the application shell's reaction to an unrecoverable session.
  pub fn set_force_logout_callback<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.pipeline.coordinator().set_force_logout_callback(callback);
  }

  /// Exchange credentials for a token pair and start a fresh session.
  pub async fn login(&self, credentials: Value) -> Result<CredentialPair, ApiError> {
    let response: LoginResponse = self
      .pipeline
      .post(
        &self.login_path,
        RequestOptions::new().body(credentials).skip_auth(),
      )
      .await?;

    let pair = CredentialPair::new(response.access_token, response.refresh_token);
    // Cached reads belong to the previous session.
    self.cache.store().clear_all();
    self.tokens().set(&pair);
    info!("Logged in");
    Ok(pair)
  }

  /// End the session locally: drop tokens and every cached read.
  pub fn logout(&self) {
    self.tokens().clear();
    self.cache.store().clear_all();
    info!("Logged out");
  }

  /// Cache-first GET keyed by `key`.
  pub async fn get_cached<T>(&self, key: &str, path: &str, options: FetchOptions) -> Fetched<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let pipeline = self.pipeline.clone();
    let path = path.to_string();
    let fetcher = move || {
      let pipeline = pipeline.clone();
      let path = path.clone();
      async move { pipeline.get::<T>(&path, RequestOptions::new()).await }
    };

    self.cache.get_with_fallback(key, fetcher, options).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ACCESS_TOKEN_EXPIRED;
  use crate::http::testing::{bearer, fail, ok, FakeTransport};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn client(transport: FakeTransport) -> (Client, Arc<FakeTransport>, Arc<MemoryStore>) {
    let config = Config::with_base_url("https://api.test/v1");
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(transport);
    let client = Client::with_parts(&config, store.clone(), transport.clone()).unwrap();
    (client, transport, store)
  }

  #[tokio::test]
  async fn test_login_stores_pair_and_sends_no_bearer() {
    let (client, transport, _) = client(FakeTransport::new(|_| {
      ok(json!({ "accessToken": "a1", "refreshToken": "r1" }))
    }));

    let pair = client.login(json!({ "email": "x@y.z" })).await.unwrap();

    assert_eq!(pair, CredentialPair::new("a1", "r1"));
    assert_eq!(client.tokens().get(), Some(pair));
    let sent = transport.requests();
    assert_eq!(sent[0].url.path(), "/v1/auth/login");
    assert_eq!(bearer(&sent[0]), None);
  }

  #[tokio::test]
  async fn test_logout_clears_tokens_and_cache() {
    let (client, _, store) = client(FakeTransport::new(|_| ok(json!([1, 2]))));
    client.tokens().set(&CredentialPair::new("a", "r"));
    let _: Fetched<Vec<i32>> = client
      .get_cached("applications", "/applications", FetchOptions::default())
      .await;

    client.logout();

    assert_eq!(client.tokens().get(), None);
    assert_eq!(client.cache().store().get::<Vec<i32>>("applications", None), None);
    assert!(store
      .list_keys()
      .unwrap()
      .iter()
      .all(|k| !k.starts_with(crate::cache::CACHE_PREFIX)));
  }

  #[tokio::test]
  async fn test_cached_read_recovers_from_expired_token() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (client, transport, _) = client(FakeTransport::new(move |req| {
      if req.url.path() == "/v1/auth/refresh" {
        return ok(json!({ "accessToken": "fresh" }));
      }
      counter.fetch_add(1, Ordering::SeqCst);
      match bearer(req).as_deref() {
        Some("fresh") => ok(json!({ "count": 3 })),
        _ => fail(401, ACCESS_TOKEN_EXPIRED),
      }
    }));
    client.tokens().set(&CredentialPair::new("stale", "r"));

    let first: Fetched<Value> = client
      .get_cached("dashboard", "/dashboard", FetchOptions::default())
      .await;
    assert_eq!(first.data, Some(json!({ "count": 3 })));
    assert!(!first.is_from_cache);

    let second: Fetched<Value> = client
      .get_cached("dashboard", "/dashboard", FetchOptions::default())
      .await;
    assert!(second.is_from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(transport.count_path("/v1/auth/refresh"), 1);
  }

  #[tokio::test]
  async fn test_schema_version_change_wipes_cache() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(FakeTransport::new(|_| ok(json!(1))));
    let mut config = Config::with_base_url("https://api.test");

    config.cache.schema_version = "1".into();
    let first = Client::with_parts(&config, store.clone(), transport.clone()).unwrap();
    first
      .cache()
      .store()
      .set("k", &1, crate::cache::CacheOptions::default());

    let same = Client::with_parts(&config, store.clone(), transport.clone()).unwrap();
    assert_eq!(same.cache().store().get::<i32>("k", None), Some(1));

    config.cache.schema_version = "2".into();
    let upgraded = Client::with_parts(&config, store.clone(), transport).unwrap();
    assert_eq!(upgraded.cache().store().get::<i32>("k", None), None);
  }
}
