//! Configuration management for a device.

use std::{env, path::PathBuf, time::Duration};

/// Device configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the sync server
    pub server_url: String,
    /// Directory holding the device state file
    pub data_dir: PathBuf,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// Per-request timeout; an expired request is a transport failure
    pub request_timeout: Duration,
    /// Interval of the incremental pull
    pub pull_interval: Duration,
    /// First retry delay after a failed flush
    pub backoff_base: Duration,
    /// Upper bound of the retry delay
    pub backoff_max: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            data_dir: PathBuf::from(".tally"),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
            pull_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let server_url = env::var("TALLY_SERVER_URL").unwrap_or(defaults.server_url);
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(ConfigError::InvalidServerUrl(server_url));
        }

        let data_dir = env::var("TALLY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let auth_token = env::var("TALLY_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            data_dir,
            auth_token,
            request_timeout: duration_var("TALLY_REQUEST_TIMEOUT_MS", Duration::from_millis, defaults.request_timeout)?,
            pull_interval: duration_var("TALLY_PULL_INTERVAL_SECS", Duration::from_secs, defaults.pull_interval)?,
            backoff_base: duration_var("TALLY_BACKOFF_BASE_MS", Duration::from_millis, defaults.backoff_base)?,
            backoff_max: duration_var("TALLY_BACKOFF_MAX_SECS", Duration::from_secs, defaults.backoff_max)?,
        })
    }
}

fn duration_var(
    name: &'static str,
    unit: fn(u64) -> Duration,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(unit)
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TALLY_SERVER_URL must include http:// or https://, got {0}")]
    InvalidServerUrl(String),

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),
}
