//! Wire transport. The only place that touches the network.

use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// A fully prepared outbound call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl TransportRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace (or add) a header value.
  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
  }
}

/// Status and body of an HTTP response, whatever the status.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub body: String,
}

impl RawResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Failure below HTTP: nothing usable came back.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("transport timed out")]
  Timeout,
  #[error("transport error: {0}")]
  Other(String),
}

/// Sends prepared requests. Non-2xx responses are not errors at this level.
pub trait Transport: Send + Sync {
  fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<RawResponse, TransportError>>;
}

/// Production transport over reqwest.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

impl Transport for ReqwestTransport {
  fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<RawResponse, TransportError>> {
    Box::pin(async move {
      let mut builder = self.client.request(request.method, request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.json(body);
      }

      let response = builder.send().await.map_err(map_reqwest_error)?;
      let status = response.status().as_u16();
      let body = response.text().await.map_err(map_reqwest_error)?;

      Ok(RawResponse { status, body })
    })
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_connect() {
    TransportError::Connect(e.to_string())
  } else {
    TransportError::Other(e.to_string())
  }
}
