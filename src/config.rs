use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub preload: PreloadConfig,
  /// Path to the durable store (defaults to the user data directory)
  pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the dashboard API, e.g. "https://api.example.org/api"
  pub base_url: String,
  /// Path hit by the reachability probe
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

fn default_probe_path() -> String {
  "/health".to_string()
}

fn default_request_timeout_secs() -> u64 {
  15
}

impl ApiConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace for durable cache keys
  pub prefix: String,
  pub default_ttl_secs: u64,
  /// Maximum entries in the memory tier
  pub max_size: usize,
  pub cleanup_interval_secs: u64,
  pub ttl: CacheTtls,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "churchsync_cache_".to_string(),
      default_ttl_secs: 5 * 60,
      max_size: 100,
      cleanup_interval_secs: 5 * 60,
      ttl: CacheTtls::default(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs)
  }
}

/// Per-category TTLs, in seconds.
///
/// Notifications go stale fastest; church and member directories barely move.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
  pub dashboard_secs: u64,
  pub notifications_secs: u64,
  pub events_secs: u64,
  pub tithes_secs: u64,
  pub directory_secs: u64,
}

impl Default for CacheTtls {
  fn default() -> Self {
    Self {
      dashboard_secs: 5 * 60,
      notifications_secs: 60,
      events_secs: 10 * 60,
      tithes_secs: 10 * 60,
      directory_secs: 30 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed attempts after which a queued item is dropped
  pub max_retries: u32,
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
  pub queue_key: String,
  pub snapshot_key: String,
  pub last_sync_key: String,
  /// First retry delay; 0 retries on the next drain
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
  /// Cache key patterns dropped after every successful write
  pub invalidate_on_write: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      probe_interval_secs: 30,
      probe_timeout_secs: 5,
      queue_key: "sync_queue".to_string(),
      snapshot_key: "offline_data".to_string(),
      last_sync_key: "last_sync".to_string(),
      backoff_base_ms: 2_000,
      backoff_max_ms: 5 * 60 * 1000,
      invalidate_on_write: vec!["^dashboard_data_".to_string()],
    }
  }
}

impl SyncConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }

  /// Delay before attempt number `retry_count + 1`, or None when backoff is off.
  pub fn backoff_for(&self, retry_count: u32) -> Option<Duration> {
    if self.backoff_base_ms == 0 || retry_count == 0 {
      return None;
    }
    let factor = 1u64
      .checked_shl(retry_count.saturating_sub(1))
      .unwrap_or(u64::MAX);
    let delay = self
      .backoff_base_ms
      .saturating_mul(factor)
      .min(self.backoff_max_ms);
    Some(Duration::from_millis(delay))
  }
}

/// Read-mostly endpoints captured into the offline snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
  pub dashboard: Option<String>,
  pub notifications: Option<String>,
  pub events: Option<String>,
  pub members: Option<String>,
  pub preferences: Option<String>,
}

impl Default for PreloadConfig {
  fn default() -> Self {
    Self {
      dashboard: None,
      notifications: Some("/notificacao".to_string()),
      events: None,
      members: None,
      preferences: Some("/config".to_string()),
    }
  }
}

impl Config {
  /// Configuration with defaults for everything except the API location.
  pub fn with_base_url(base_url: &str) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.to_string(),
        probe_path: default_probe_path(),
        request_timeout_secs: default_request_timeout_secs(),
      },
      ..Self::default()
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./churchsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/churchsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/churchsync/config.yaml\n\
                 or pass --base-url."
      )),
    }
  }

  pub fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("churchsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("churchsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.api.base_url.trim().is_empty() {
      return Err(eyre!("api.base_url must not be empty"));
    }

    Ok(config)
  }

  /// Get a bearer token from the environment, if one was provided.
  ///
  /// Checks CHURCHSYNC_TOKEN.
  pub fn env_token() -> Option<String> {
    std::env::var("CHURCHSYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
