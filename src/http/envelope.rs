//! Unwrapping of the server's `{ success, data, error }` response envelope.

use serde::Deserialize;
use serde_json::Value;

use super::transport::RawResponse;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct ErrorBody {
  #[serde(default)]
  code: Option<String>,
  #[serde(default)]
  message: Option<String>,
  #[serde(default)]
  details: Option<Value>,
}

/// Turn a raw response into the logical payload or a structured error.
pub fn unwrap(response: RawResponse) -> Result<Value, ApiError> {
  let body = if response.body.trim().is_empty() {
    Value::Null
  } else {
    match serde_json::from_str::<Value>(&response.body) {
      Ok(value) => value,
      Err(e) if response.is_success() => {
        return Err(ApiError::Decode(format!("invalid JSON body: {}", e)));
      }
      // Error pages are often HTML; keep the text as the message.
      Err(_) => Value::String(response.body.clone()),
    }
  };

  let error = body
    .get("error")
    .filter(|e| e.is_object())
    .and_then(|e| serde_json::from_value::<ErrorBody>(e.clone()).ok());
  let failed = body.get("success").and_then(Value::as_bool) == Some(false);

  if response.is_success() && error.is_none() && !failed {
    return Ok(match body {
      Value::Object(mut map) if map.contains_key("data") => {
        map.remove("data").unwrap_or(Value::Null)
      }
      other => other,
    });
  }

  let error = error.unwrap_or(ErrorBody {
    code: None,
    message: None,
    details: None,
  });

  Err(ApiError::Api {
    status: response.status,
    code: error
      .code
      .unwrap_or_else(|| format!("HTTP_{}", response.status)),
    message: error
      .message
      .or_else(|| body.get("message").and_then(Value::as_str).map(String::from))
      .or_else(|| body.as_str().map(String::from))
      .unwrap_or_default(),
    details: error.details,
  })
}
