use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Acting user/session id attached to every remote call
  pub owner: String,
  /// Logical scope of the persisted queue (e.g. facility id)
  #[serde(default = "default_scope")]
  pub scope: String,
  /// Directory for the outbox database and logs
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub sync: SyncSettings,
}

fn default_scope() -> String {
  "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted backend, e.g. https://xyz.supabase.co
  pub url: String,
  /// Column holding the owner id on every table
  #[serde(default = "default_owner_column")]
  pub owner_column: String,
  /// Per-call timeout for remote mutations
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_owner_column() -> String {
  "user_id".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
  /// Rejections before an action is moved to the dead-letter record (0 = never)
  #[serde(default = "default_max_rejections")]
  pub max_rejections: u32,
  /// Seconds between connectivity probes in watch mode
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  /// Path probed to decide whether the remote is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default)]
  pub retry: RetrySettings,
}

fn default_max_rejections() -> u32 {
  5
}

fn default_probe_interval_secs() -> u64 {
  10
}

fn default_health_path() -> String {
  "/rest/v1/".to_string()
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_rejections: default_max_rejections(),
      probe_interval_secs: default_probe_interval_secs(),
      health_path: default_health_path(),
      retry: RetrySettings::default(),
    }
  }
}

impl SyncSettings {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  /// Rejection ceiling, `None` when dead-lettering is disabled.
  pub fn rejection_ceiling(&self) -> Option<u32> {
    (self.max_rejections > 0).then_some(self.max_rejections)
  }
}

/// Backoff between automatic retry passes while failures remain.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
  #[serde(default = "default_initial_delay_ms")]
  pub initial_delay_ms: u64,
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
  #[serde(default = "default_multiplier")]
  pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
  2_000
}

fn default_max_delay_ms() -> u64 {
  300_000
}

fn default_multiplier() -> f64 {
  2.0
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      initial_delay_ms: default_initial_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
      multiplier: default_multiplier(),
    }
  }
}

impl From<&RetrySettings> for RetryConfig {
  fn from(settings: &RetrySettings) -> Self {
    RetryConfig::new(
      Duration::from_millis(settings.initial_delay_ms),
      Duration::from_millis(settings.max_delay_ms),
      settings.multiplier,
    )
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nursery-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nursery-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/nursery-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("nursery-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nursery-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.remote.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.remote.url, e))?;
    Ok(config)
  }

  /// Directory holding the outbox database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("nursery-sync"))
  }

  /// Get the project API key from environment variables.
  pub fn get_api_key() -> Result<String> {
    std::env::var("NURSERY_SYNC_API_KEY").map_err(|_| {
      eyre!("API key not found. Set the NURSERY_SYNC_API_KEY environment variable.")
    })
  }

  /// Get the session bearer token, falling back to the API key.
  pub fn get_token() -> Result<String> {
    std::env::var("NURSERY_SYNC_TOKEN").or_else(|_| Self::get_api_key())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(
      r#"
remote:
  url: https://example.supabase.co
owner: staff-1
"#,
    )
    .unwrap();

    assert_eq!(config.scope, "default");
    assert_eq!(config.remote.owner_column, "user_id");
    assert_eq!(config.remote.timeout(), Duration::from_secs(30));
    assert_eq!(config.sync.rejection_ceiling(), Some(5));
    assert_eq!(config.sync.health_path, "/rest/v1/");
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
remote:
  url: https://example.supabase.co
  owner_column: staff_id
  timeout_secs: 5
owner: staff-2
scope: sakura-room
data_dir: /tmp/nursery
sync:
  max_rejections: 0
  probe_interval_secs: 3
  retry:
    initial_delay_ms: 100
    max_delay_ms: 1000
    multiplier: 3.0
"#,
    )
    .unwrap();

    assert_eq!(config.scope, "sakura-room");
    assert_eq!(config.remote.owner_column, "staff_id");
    assert_eq!(config.sync.rejection_ceiling(), None);
    assert_eq!(config.sync.probe_interval(), Duration::from_secs(3));
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/nursery"));

    let retry = RetryConfig::from(&config.sync.retry);
    assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
    assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(300));
    assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(1000));
  }

  #[test]
  fn test_invalid_url_rejected() {
    let result = Config::parse(
      r#"
remote:
  url: not a url
owner: staff-1
"#,
    );
    assert!(result.is_err());
  }

  #[test]
  fn test_missing_owner_rejected() {
    let result = Config::parse(
      r#"
remote:
  url: https://example.supabase.co
"#,
    );
    assert!(result.is_err());
  }
}
