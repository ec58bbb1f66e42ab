//! Configuration loader and validator for the course generation service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub jobs: Jobs,
    pub notifications: Notifications,
    pub identity: Identity,
    pub provider: Provider,
    pub client: Client,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub workers: usize,
}

/// Job orchestration: retry budget, backoff and staleness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jobs {
    pub max_retries: i32,
    pub backoff_base_ms: u64,
    pub max_backoff_seconds: u64,
    pub staleness_window_secs: u64,
    pub janitor_interval_secs: u64,
}

/// Live event delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub heartbeat_secs: u64,
    pub buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub cache_ttl_secs: u64,
}

/// Content-generation provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provider {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// Polling cadence used by the client generation controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub outline_poll_ms: u64,
    pub lesson_poll_ms: u64,
}

impl App {
    /// Expand a leading `~/` in `data_dir` using `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        expand_home(&self.data_dir)
    }
}

/// Expand a leading `~/` using `$HOME`; other paths are returned unchanged.
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path.to_string(),
    }
}

impl Jobs {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

impl Notifications {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Identity {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/course_forge.db", self.app.resolved_data_dir())
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }

    if cfg.jobs.max_retries < 1 {
        return Err(ConfigError::Invalid("jobs.max_retries must be >= 1"));
    }
    if cfg.jobs.max_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("jobs.max_backoff_seconds must be > 0"));
    }
    if cfg.jobs.staleness_window_secs == 0 {
        return Err(ConfigError::Invalid("jobs.staleness_window_secs must be > 0"));
    }
    if cfg.jobs.janitor_interval_secs == 0 {
        return Err(ConfigError::Invalid("jobs.janitor_interval_secs must be > 0"));
    }

    if cfg.notifications.heartbeat_secs == 0 {
        return Err(ConfigError::Invalid("notifications.heartbeat_secs must be > 0"));
    }
    if cfg.notifications.buffer == 0 {
        return Err(ConfigError::Invalid("notifications.buffer must be > 0"));
    }

    if cfg.identity.cache_ttl_secs == 0 {
        return Err(ConfigError::Invalid("identity.cache_ttl_secs must be > 0"));
    }

    if cfg.provider.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.base_url must be non-empty"));
    }
    if cfg.provider.model.trim().is_empty() {
        return Err(ConfigError::Invalid("provider.model must be non-empty"));
    }
    if cfg.provider.timeout_secs == 0 {
        return Err(ConfigError::Invalid("provider.timeout_secs must be > 0"));
    }

    if cfg.client.outline_poll_ms == 0 || cfg.client.lesson_poll_ms == 0 {
        return Err(ConfigError::Invalid("client poll intervals must be > 0"));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  workers: 4

jobs:
  max_retries: 3
  backoff_base_ms: 2000
  max_backoff_seconds: 300
  staleness_window_secs: 1800
  janitor_interval_secs: 60

notifications:
  heartbeat_secs: 15
  buffer: 64

identity:
  cache_ttl_secs: 3600

provider:
  base_url: "https://generation.example.com/"
  api_key: "YOUR_PROVIDER_API_KEY"
  model: "course-writer-large"
  timeout_secs: 120

client:
  outline_poll_ms: 3000
  lesson_poll_ms: 7000
"#
}
