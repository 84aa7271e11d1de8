//! Configuration loader and validator for the offline data layer.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::EntityKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Remote authority endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("probe_path", &self.probe_path)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Sync scheduling and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_retries: u32,
    pub client_errors_to_conflicts: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            base_backoff_secs: 5,
            max_backoff_secs: 60,
            max_retries: 3,
            client_errors_to_conflicts: true,
        }
    }
}

/// Response cache policy. `cacheable` holds regexes matched against the
/// request path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub cacheable: Vec<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
            cacheable: vec![
                "^/referrals(/[^/]+)?$".into(),
                "^/notifications(/[^/]+)?$".into(),
                "^/me$".into(),
                "^/lookups(/.*)?$".into(),
            ],
        }
    }
}

/// Entities whose writes may be queued while offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewaySettings {
    pub queueable: Vec<EntityKind>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            queueable: EntityKind::ALL.to_vec(),
        }
    }
}

fn default_probe_path() -> String {
    "health".into()
}

fn default_probe_interval() -> u64 {
    15
}

fn default_timeout() -> u64 {
    20
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` when set, otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/partner-offline.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let base = cfg.remote.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ConfigError::Invalid(
            "remote.base_url must start with http:// or https://",
        ));
    }
    if cfg.remote.probe_interval_secs == 0 {
        return Err(ConfigError::Invalid("remote.probe_interval_secs must be > 0"));
    }

    if cfg.sync.interval_secs == 0 {
        return Err(ConfigError::Invalid("sync.interval_secs must be > 0"));
    }
    if cfg.sync.base_backoff_secs == 0 {
        return Err(ConfigError::Invalid("sync.base_backoff_secs must be > 0"));
    }
    if cfg.sync.max_backoff_secs < cfg.sync.base_backoff_secs {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_secs must be >= sync.base_backoff_secs",
        ));
    }
    if cfg.sync.max_retries == 0 {
        return Err(ConfigError::Invalid("sync.max_retries must be > 0"));
    }

    if cfg.cache.ttl_secs == 0 {
        return Err(ConfigError::Invalid("cache.ttl_secs must be > 0"));
    }
    if cfg.cache.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("cache.sweep_interval_secs must be > 0"));
    }
    if cfg.cache.cacheable.iter().any(|p| Regex::new(p).is_err()) {
        return Err(ConfigError::Invalid(
            "cache.cacheable entries must be valid regular expressions",
        ));
    }

    Ok(())
}

/// Returns the example YAML shipped with the daemon.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

remote:
  base_url: "https://partners.example.com/api/"
  token: ""
  probe_path: "health"
  probe_interval_secs: 15
  timeout_secs: 20

sync:
  interval_secs: 30
  base_backoff_secs: 5
  max_backoff_secs: 60
  max_retries: 3
  client_errors_to_conflicts: true

cache:
  ttl_secs: 300
  sweep_interval_secs: 60
  cacheable:
    - "^/referrals(/[^/]+)?$"
    - "^/notifications(/[^/]+)?$"
    - "^/me$"
    - "^/lookups(/.*)?$"

gateway:
  queueable: [referral, notification, user]
"#
}
