//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};

pub const ENV_BASE_URL: &str = "SESSION_API_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "SESSION_REQUEST_TIMEOUT_SECS";
pub const ENV_REFRESH_INTERVAL_SECS: &str = "SESSION_REFRESH_INTERVAL_SECS";
pub const ENV_STATE_FILE: &str = "SESSION_STATE_FILE";

const DEFAULT_BASE_URL: &str = "http://localhost:5000";
/// Long enough for slow analysis endpoints.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
/// Tokens live for 24 hours; renew well before that.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Backend token endpoint paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
    pub refresh: String,
    pub verify: String,
    pub logout: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/api/auth/login".to_string(),
            refresh: "/api/auth/refresh-token".to_string(),
            verify: "/api/auth/verify-token".to_string(),
            logout: "/api/auth/logout".to_string(),
        }
    }
}

/// Configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend base URL; request paths are resolved against it.
    pub base_url: String,
    /// Absolute timeout applied to every outbound call.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Period of the proactive refresh timer.
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Where the credential and user record are persisted. `None` keeps them in memory.
    pub state_file: Option<PathBuf>,
    pub endpoints: AuthEndpoints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            state_file: None,
            endpoints: AuthEndpoints::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from `SESSION_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_BASE_URL) {
            config.base_url = url;
        }
        if let Some(secs) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = parse_secs(ENV_REQUEST_TIMEOUT_SECS, &secs)?;
        }
        if let Some(secs) = lookup(ENV_REFRESH_INTERVAL_SECS) {
            config.refresh_interval = parse_secs(ENV_REFRESH_INTERVAL_SECS, &secs)?;
        }
        if let Some(path) = lookup(ENV_STATE_FILE).filter(|p| !p.trim().is_empty()) {
            config.state_file = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Parsed base URL.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| SessionError::config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SessionError::config(format!(
                "Unsupported base URL scheme: {}",
                url.scheme()
            )));
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;

        if self.request_timeout.is_zero() {
            return Err(SessionError::config("request_timeout must be greater than zero"));
        }
        if self.refresh_interval.is_zero() {
            return Err(SessionError::config("refresh_interval must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| SessionError::config(format!("{} must be a number of seconds: {}", key, e)))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
