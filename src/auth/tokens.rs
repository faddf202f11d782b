//! Persistence of the access/refresh token pair and the per-install device id.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::ids::IdGenerator;
use crate::storage::KeyValueStore;

pub const CREDENTIALS_KEY: &str = "auth.credentials";
pub const DEVICE_ID_KEY: &str = "auth.device_id";

/// Access and refresh token, always stored together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
  pub access_token: String,
  pub refresh_token: String,
}

impl CredentialPair {
  pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
    Self {
      access_token: access_token.into(),
      refresh_token: refresh_token.into(),
    }
  }

  fn is_complete(&self) -> bool {
    !self.access_token.is_empty() && !self.refresh_token.is_empty()
  }
}

/// Owner of the credential pair and device id.
///
/// The pair is one storage record, so a reader sees both tokens or neither.
pub struct TokenStore {
  store: Arc<dyn KeyValueStore>,
  ids: Arc<dyn IdGenerator>,
  /// Held across every write of the pair record.
  pair_lock: Mutex<()>,
  /// Serializes device id creation; also holds the id once known.
  device_id: Mutex<Option<String>>,
}

impl TokenStore {
  pub fn new(store: Arc<dyn KeyValueStore>, ids: Arc<dyn IdGenerator>) -> Self {
    Self {
      store,
      ids,
      pair_lock: Mutex::new(()),
      device_id: Mutex::new(None),
    }
  }

  /// Current credential pair, if both tokens are present.
  pub fn get(&self) -> Option<CredentialPair> {
    let raw = self.read(CREDENTIALS_KEY)?;

    match serde_json::from_str::<CredentialPair>(&raw) {
      Ok(pair) if pair.is_complete() => Some(pair),
      Ok(_) => {
        warn!("Found incomplete credential pair in storage, clearing it");
        self.discard_if_unchanged(&raw);
        None
      }
      Err(e) => {
        warn!(error = %e, "Unreadable credential record in storage, clearing it");
        self.discard_if_unchanged(&raw);
        None
      }
    }
  }

  pub fn access_token(&self) -> Option<String> {
    self.get().map(|pair| pair.access_token)
  }

  pub fn set(&self, pair: &CredentialPair) {
    let encoded = match serde_json::to_string(pair) {
      Ok(encoded) => encoded,
      Err(e) => {
        warn!(error = %e, "Failed to encode credentials");
        return;
      }
    };

    let _guard = self.lock_pair();
    if let Err(e) = self.store.set(CREDENTIALS_KEY, &encoded) {
      warn!(error = %e, "Failed to persist credentials");
    }
  }

  /// Remove both tokens. Returns whether a pair was present.
  ///
  /// Of several concurrent callers, at most one sees `true`.
  pub fn clear(&self) -> bool {
    let _guard = self.lock_pair();
    let had_pair = self.read(CREDENTIALS_KEY).is_some();

    if let Err(e) = self.store.remove(CREDENTIALS_KEY) {
      warn!(error = %e, "Failed to clear credentials");
    }

    had_pair
  }

  /// Drop an unusable record, unless a writer already replaced it.
  fn discard_if_unchanged(&self, raw: &str) {
    let _guard = self.lock_pair();
    if self.read(CREDENTIALS_KEY).as_deref() == Some(raw) {
      if let Err(e) = self.store.remove(CREDENTIALS_KEY) {
        warn!(error = %e, "Failed to clear credentials");
      }
    }
  }

  fn lock_pair(&self) -> MutexGuard<'_, ()> {
    match self.pair_lock.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Stable identifier for this installation, created and persisted on first use.
  pub fn get_or_create_device_id(&self) -> String {
    let mut cached = match self.device_id.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(id) = cached.as_ref() {
      return id.clone();
    }

    let id = match self.read(DEVICE_ID_KEY) {
      Some(existing) => existing,
      None => {
        let created = self.ids.generate();
        if let Err(e) = self.store.set(DEVICE_ID_KEY, &created) {
          warn!(error = %e, "Failed to persist device id, using it for this session only");
        }
        created
      }
    };

    *cached = Some(id.clone());
    id
  }

  fn read(&self, key: &str) -> Option<String> {
    match self.store.get(key) {
      Ok(value) => value.filter(|v| !v.is_empty()),
      Err(e) => {
        warn!(key, error = %e, "Failed to read from token storage");
        None
      }
    }
  }
}
