//! Outbound HTTP: transport seam, envelope handling and the request pipeline.

pub mod envelope;
pub mod pipeline;
pub mod transport;

use std::time::Duration;

use crate::error::ApiError;
use transport::{RawResponse, Transport, TransportError, TransportRequest};

pub use pipeline::{RequestOptions, RequestPipeline};
pub use transport::ReqwestTransport;

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Default overall timeout for a single call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl From<TransportError> for ApiError {
  fn from(e: TransportError) -> Self {
    ApiError::Network(e.to_string())
  }
}

/// Send through the transport with an overall deadline.
pub(crate) async fn send_with_timeout(
  transport: &dyn Transport,
  request: TransportRequest,
  timeout: Duration,
) -> Result<RawResponse, ApiError> {
  match tokio::time::timeout(timeout, transport.send(request)).await {
    Ok(Ok(response)) => Ok(response),
    Ok(Err(TransportError::Timeout)) | Err(_) => Err(ApiError::Timeout(timeout)),
    Ok(Err(e)) => Err(e.into()),
  }
}
