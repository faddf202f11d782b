//! Single-flight token refresh.
//!
//! The first caller that hits an expired access token moves the coordinator
//! from `Idle` to `Refreshing` and issues the one refresh call. Everyone who
//! arrives while that call is outstanding is parked on a FIFO queue and gets
//! the same outcome once it settles.

use futures::FutureExt;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use super::tokens::{CredentialPair, TokenStore};
use crate::error::ApiError;
use crate::http::transport::{Transport, TransportRequest};
use crate::http::{envelope, send_with_timeout, DEVICE_ID_HEADER, REQUEST_ID_HEADER};
use crate::ids::IdGenerator;

/// Invoked when the session cannot be recovered.
pub type ForceLogoutCallback = Arc<dyn Fn() + Send + Sync>;

type Waiter = oneshot::Sender<Result<String, ApiError>>;

/// Observable phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
  Idle,
  Refreshing,
}

enum RefreshState {
  Idle,
  Refreshing { waiters: VecDeque<Waiter> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
  access_token: String,
  #[serde(default)]
  refresh_token: Option<String>,
}

struct Inner {
  state: Mutex<RefreshState>,
  tokens: Arc<TokenStore>,
  transport: Arc<dyn Transport>,
  ids: Arc<dyn IdGenerator>,
  refresh_url: Url,
  timeout: Duration,
  on_force_logout: RwLock<Option<ForceLogoutCallback>>,
}

/// Owner of the refresh state machine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RefreshCoordinator {
  inner: Arc<Inner>,
}

impl RefreshCoordinator {
  pub fn new(
    tokens: Arc<TokenStore>,
    transport: Arc<dyn Transport>,
    ids: Arc<dyn IdGenerator>,
    refresh_url: Url,
    timeout: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(RefreshState::Idle),
        tokens,
        transport,
        ids,
        refresh_url,
        timeout,
        on_force_logout: RwLock::new(None),
      }),
    }
  }

  /// Register the callback fired when the session is terminated.
  pub fn set_force_logout_callback<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    let mut slot = match self.inner.on_force_logout.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    *slot = Some(Arc::new(callback));
  }

  pub fn phase(&self) -> RefreshPhase {
    match &*self.inner.lock_state() {
      RefreshState::Idle => RefreshPhase::Idle,
      RefreshState::Refreshing { .. } => RefreshPhase::Refreshing,
    }
  }

  /// Obtain a fresh access token, sharing any refresh already in flight.
  pub async fn refresh(&self) -> Result<String, ApiError> {
    let parked = {
      let mut state = self.inner.lock_state();
      match &mut *state {
        RefreshState::Refreshing { waiters } => {
          let (tx, rx) = oneshot::channel();
          waiters.push_back(tx);
          debug!(waiting = waiters.len(), "Refresh in flight, parking caller");
          Some(rx)
        }
        RefreshState::Idle => {
          *state = RefreshState::Refreshing {
            waiters: VecDeque::new(),
          };
          None
        }
      }
    };

    if let Some(rx) = parked {
      return rx
        .await
        .unwrap_or_else(|_| Err(ApiError::SessionExpired("token refresh was abandoned".into())));
    }

    // Run on its own task so the refresh settles even if this caller goes away.
    let inner = Arc::clone(&self.inner);
    match tokio::spawn(async move { inner.run_refresh().await }).await {
      Ok(outcome) => outcome,
      Err(e) => {
        let outcome = Err(ApiError::SessionExpired(format!("token refresh task failed: {}", e)));
        self.inner.settle(&outcome);
        outcome
      }
    }
  }

  /// Drop the session and notify the application shell.
  pub fn force_logout(&self) {
    self.inner.force_logout();
  }
}

impl Inner {
  fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  async fn run_refresh(&self) -> Result<String, ApiError> {
    let attempt = AssertUnwindSafe(self.perform_refresh())
      .catch_unwind()
      .await
      .unwrap_or_else(|_| Err(ApiError::SessionExpired("token refresh panicked".into())));

    match attempt {
      Ok(pair) => {
        self.tokens.set(&pair);
        info!("Access token refreshed");
        let outcome = Ok(pair.access_token);
        self.settle(&outcome);
        outcome
      }
      Err(e) => {
        warn!(error = %e, "Token refresh failed, ending session");
        let had_session = self.tokens.clear();
        let outcome = Err(match e {
          ApiError::SessionExpired(_) => e,
          other => ApiError::SessionExpired(other.to_string()),
        });
        self.settle(&outcome);
        if had_session {
          self.notify_logout();
        }
        outcome
      }
    }
  }

  async fn perform_refresh(&self) -> Result<CredentialPair, ApiError> {
    let current = self
      .tokens
      .get()
      .ok_or_else(|| ApiError::SessionExpired("no refresh token available".into()))?;

    let mut request = TransportRequest {
      method: Method::POST,
      url: self.refresh_url.clone(),
      headers: Vec::new(),
      body: Some(json!({ "refreshToken": current.refresh_token })),
    };
    request.set_header(REQUEST_ID_HEADER, self.ids.generate());
    request.set_header(DEVICE_ID_HEADER, self.tokens.get_or_create_device_id());

    debug!(url = %self.refresh_url, "Refreshing access token");
    let response = send_with_timeout(self.transport.as_ref(), request, self.timeout).await?;
    let data = envelope::unwrap(response)?;
    let refreshed: RefreshResponse = serde_json::from_value(data)
      .map_err(|e| ApiError::Decode(format!("refresh response: {}", e)))?;

    Ok(CredentialPair {
      access_token: refreshed.access_token,
      refresh_token: refreshed.refresh_token.unwrap_or(current.refresh_token),
    })
  }

  /// Resolve every parked caller in arrival order and return to `Idle`.
  fn settle(&self, outcome: &Result<String, ApiError>) {
    let waiters = match std::mem::replace(&mut *self.lock_state(), RefreshState::Idle) {
      RefreshState::Refreshing { waiters } => waiters,
      RefreshState::Idle => VecDeque::new(),
    };

    debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Refresh settled");
    for waiter in waiters {
      let _ = waiter.send(outcome.clone());
    }
  }

  fn force_logout(&self) {
    if self.tokens.clear() {
      warn!("Session terminated, forcing logout");
      self.notify_logout();
    }
  }

  fn notify_logout(&self) {
    let callback = match self.on_force_logout.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    };
    if let Some(callback) = callback {
      callback();
    }
  }
}
