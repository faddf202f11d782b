use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Overall timeout per call
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Token refresh endpoint, relative to base_url
  #[serde(default = "default_refresh_path")]
  pub refresh_path: String,
  /// Login endpoint, relative to base_url
  #[serde(default = "default_login_path")]
  pub login_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Maximum entries kept in process
  #[serde(default = "default_capacity")]
  pub capacity: usize,
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Bump to discard payloads cached by an incompatible build
  #[serde(default = "default_schema_version")]
  pub schema_version: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: default_capacity(),
      default_ttl_secs: default_ttl_secs(),
      schema_version: default_schema_version(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/tollgate/store.db)
  pub path: Option<PathBuf>,
  /// When false, tokens and cache live only for the process
  #[serde(default = "default_true")]
  pub persistent: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      persistent: true,
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_refresh_path() -> String {
  "/auth/refresh".to_string()
}

fn default_login_path() -> String {
  "/auth/login".to_string()
}

fn default_capacity() -> usize {
  DEFAULT_CAPACITY
}

fn default_ttl_secs() -> u64 {
  DEFAULT_TTL.as_secs()
}

fn default_schema_version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tollgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tollgate/config.yaml
  ///
  /// `TOLLGATE_BASE_URL` overrides `api.base_url`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => match std::env::var("TOLLGATE_BASE_URL") {
        Ok(base_url) => Self::with_base_url(base_url),
        Err(_) => {
          return Err(eyre!(
            "No configuration file found. Create one at ~/.config/tollgate/config.yaml\n\
             or set TOLLGATE_BASE_URL."
          ))
        }
      },
    };

    if let Ok(base_url) = std::env::var("TOLLGATE_BASE_URL") {
      config.api.base_url = base_url;
    }

    Ok(config)
  }

  /// Load configuration, letting `base_url` stand in for a missing file.
  ///
  /// A config file that exists but does not parse is still an error.
  pub fn load_with_base_url(explicit_path: Option<&Path>, base_url: Option<String>) -> Result<Self> {
    let no_file = explicit_path.is_none() && Self::find_config_file().is_none();

    let mut config = match &base_url {
      Some(url) if no_file => Self::with_base_url(url.clone()),
      _ => Self::load(explicit_path)?,
    };

    if let Some(url) = base_url {
      config.api.base_url = url;
    }

    Ok(config)
  }

  /// Defaults for everything but the API location.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        timeout_secs: default_timeout_secs(),
        refresh_path: default_refresh_path(),
        login_path: default_login_path(),
      },
      cache: CacheConfig::default(),
      storage: StorageConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tollgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tollgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.timeout_secs == 0 {
      return Err(eyre!("api.timeout_secs must be greater than zero"));
    }
    Ok(config)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.default_ttl_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://api.example.com/v1\n").unwrap();

    assert_eq!(config.api.base_url, "https://api.example.com/v1");
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.api.refresh_path, "/auth/refresh");
    assert_eq!(config.cache.capacity, DEFAULT_CAPACITY);
    assert_eq!(config.default_ttl(), DEFAULT_TTL);
    assert!(config.storage.persistent);
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: https://api.example.com
  timeout_secs: 10
  refresh_path: /v2/token/refresh
cache:
  capacity: 20
  default_ttl_secs: 60
  schema_version: "7"
storage:
  path: /tmp/tollgate.db
  persistent: false
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.timeout(), Duration::from_secs(10));
    assert_eq!(config.api.refresh_path, "/v2/token/refresh");
    assert_eq!(config.api.login_path, "/auth/login");
    assert_eq!(config.cache.capacity, 20);
    assert_eq!(config.cache.schema_version, "7");
    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/tollgate.db")));
    assert!(!config.storage.persistent);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_zero_timeout_is_rejected() {
    let err = Config::parse("api:\n  base_url: https://api.example.com\n  timeout_secs: 0\n")
      .unwrap_err();
    assert!(err.to_string().contains("timeout_secs"));
  }

  #[test]
  fn test_base_url_does_not_mask_a_broken_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "api: [not, a, map]\n").unwrap();

    let result = Config::load_with_base_url(Some(&path), Some("https://cli.example.com".into()));
    assert!(result.is_err());

    std::fs::write(&path, "api:\n  base_url: https://file.example.com\n").unwrap();
    let config =
      Config::load_with_base_url(Some(&path), Some("https://cli.example.com".into())).unwrap();
    assert_eq!(config.api.base_url, "https://cli.example.com");
  }
}
