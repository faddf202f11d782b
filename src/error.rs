//! Errors returned to callers of the request pipeline.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Server code signalling that the bearer token has expired.
pub const ACCESS_TOKEN_EXPIRED: &str = "ACCESS_TOKEN_EXPIRED";
/// Older servers send this shorter form for the same condition.
pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
/// Server code signalling that the refresh token is no longer usable.
pub const REFRESH_TOKEN_EXPIRED: &str = "REFRESH_TOKEN_EXPIRED";

/// Failure of a pipeline call.
///
/// Cloneable because a single refresh outcome is handed to every parked caller.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
  /// Connectivity or IO failure below HTTP.
  #[error("network error: {0}")]
  Network(String),

  /// The call exceeded the pipeline timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Structured error from the server envelope.
  #[error("{code} ({status}): {message}")]
  Api {
    status: u16,
    code: String,
    message: String,
    details: Option<Value>,
  },

  /// The session could not be recovered; the user must log in again.
  #[error("session expired: {0}")]
  SessionExpired(String),

  /// The response body could not be decoded into the expected shape.
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// The request could not be built (bad path, bad base URL).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl ApiError {
  /// Machine-readable code for server errors.
  pub fn code(&self) -> Option<&str> {
    match self {
      Self::Api { code, .. } => Some(code),
      _ => None,
    }
  }

  /// HTTP status for server errors.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Api { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn is_access_token_expired(&self) -> bool {
    matches!(self.code(), Some(ACCESS_TOKEN_EXPIRED) | Some(TOKEN_EXPIRED))
  }

  pub fn is_refresh_token_expired(&self) -> bool {
    self.code() == Some(REFRESH_TOKEN_EXPIRED)
  }
}
