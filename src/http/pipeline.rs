//! The request pipeline: the single choke point for every API call.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::transport::{Transport, TransportRequest};
use super::{
  envelope, send_with_timeout, AUTHORIZATION_HEADER, DEVICE_ID_HEADER, IDEMPOTENCY_KEY_HEADER,
  REQUEST_ID_HEADER,
};
use crate::auth::{RefreshCoordinator, TokenStore};
use crate::error::ApiError;
use crate::ids::IdGenerator;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
  /// Preserved as-is when set; generated for mutating calls otherwise.
  pub idempotency_key: Option<String>,
  /// Send without a bearer token and never enter token refresh.
  pub skip_auth: bool,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((key.into(), value.to_string()));
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }

  pub fn skip_auth(mut self) -> Self {
    self.skip_auth = true;
    self
  }
}

fn is_mutating(method: &Method) -> bool {
  matches!(
    *method,
    Method::POST | Method::PUT | Method::PATCH | Method::DELETE
  )
}

/// Authenticated API client over an injected transport.
#[derive(Clone)]
pub struct RequestPipeline {
  base_url: Url,
  transport: Arc<dyn Transport>,
  tokens: Arc<TokenStore>,
  coordinator: RefreshCoordinator,
  ids: Arc<dyn IdGenerator>,
  timeout: Duration,
}

impl RequestPipeline {
  pub fn new(
    base_url: Url,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    coordinator: RefreshCoordinator,
    ids: Arc<dyn IdGenerator>,
    timeout: Duration,
  ) -> Self {
    Self {
      base_url: normalize_base(base_url),
      transport,
      tokens,
      coordinator,
      ids,
      timeout,
    }
  }

  pub fn coordinator(&self) -> &RefreshCoordinator {
    &self.coordinator
  }

  pub fn tokens(&self) -> &Arc<TokenStore> {
    &self.tokens
  }

  /// Resolve `path` against the base URL.
  pub fn url_for(&self, path: &str) -> Result<Url, ApiError> {
    join_path(&self.base_url, path)
  }

  pub async fn get<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    self.request(Method::GET, path, options).await
  }

  pub async fn post<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    self.request(Method::POST, path, options).await
  }

  pub async fn put<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    self.request(Method::PUT, path, options).await
  }

  pub async fn patch<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    self.request(Method::PATCH, path, options).await
  }

  pub async fn delete<T: DeserializeOwned>(
    &self,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    self.request(Method::DELETE, path, options).await
  }

  /// Issue a call and decode the unwrapped payload.
  pub async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    let value = self.request_value(method, path, options).await?;
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
  }

  /// Issue a call and return the unwrapped payload as JSON.
  ///
  /// An expired access token is refreshed and the call replayed once with the
  /// same request id and idempotency key. Anything else is returned as-is.
  pub async fn request_value(
    &self,
    method: Method,
    path: &str,
    options: RequestOptions,
  ) -> Result<Value, ApiError> {
    let skip_auth = options.skip_auth;
    let mut request = self.prepare(method, path, options)?;
    let mut retried = false;

    loop {
      let sent_token = request
        .header(AUTHORIZATION_HEADER)
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);

      debug!(
        method = %request.method,
        path,
        request_id = request.header(REQUEST_ID_HEADER).unwrap_or_default(),
        retried,
        "Sending request"
      );

      let outcome = match send_with_timeout(self.transport.as_ref(), request.clone(), self.timeout)
        .await
      {
        Ok(response) => envelope::unwrap(response),
        Err(e) => Err(e),
      };

      let err = match outcome {
        Ok(value) => return Ok(value),
        Err(e) => e,
      };

      if err.is_access_token_expired() && !skip_auth && !retried {
        retried = true;
        let token = match self.tokens.access_token() {
          // Someone else already refreshed while this call was in flight.
          Some(current) if sent_token.as_deref() != Some(current.as_str()) => current,
          _ => self.coordinator.refresh().await?,
        };
        request.set_header(AUTHORIZATION_HEADER, format!("Bearer {}", token));
        continue;
      }

      if err.is_refresh_token_expired() && !skip_auth {
        self.coordinator.force_logout();
        return Err(ApiError::SessionExpired(err.to_string()));
      }

      warn!(method = %request.method, path, error = %err, "Request failed");
      return Err(err);
    }
  }

  fn prepare(
    &self,
    method: Method,
    path: &str,
    options: RequestOptions,
  ) -> Result<TransportRequest, ApiError> {
    let mut url = self.url_for(path)?;
    if !options.query.is_empty() {
      url.query_pairs_mut().extend_pairs(options.query.iter());
    }

    let mut request = TransportRequest {
      method,
      url,
      headers: options.headers,
      body: options.body,
    };

    request.set_header(REQUEST_ID_HEADER, self.ids.generate());
    request.set_header(DEVICE_ID_HEADER, self.tokens.get_or_create_device_id());

    if !options.skip_auth {
      if let Some(token) = self.tokens.access_token() {
        request.set_header(AUTHORIZATION_HEADER, format!("Bearer {}", token));
      }
    }

    if is_mutating(&request.method) {
      let key = match options.idempotency_key {
        Some(key) => key,
        None => match request.header(IDEMPOTENCY_KEY_HEADER) {
          Some(existing) => existing.to_string(),
          None => self.ids.generate(),
        },
      };
      request.set_header(IDEMPOTENCY_KEY_HEADER, key);
    }

    Ok(request)
  }
}

/// Resolve an API path below `base`, keeping any path prefix the base carries.
pub fn join_path(base: &Url, path: &str) -> Result<Url, ApiError> {
  normalize_base(base.clone())
    .join(path.trim_start_matches('/'))
    .map_err(|e| ApiError::InvalidRequest(format!("bad path {}: {}", path, e)))
}

/// `Url::join` replaces the last segment unless the base ends with a slash.
fn normalize_base(mut base: Url) -> Url {
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  base
}
