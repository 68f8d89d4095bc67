use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;

/// Runtime configuration for the session core.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the API the transport talks to.
    pub base_url: String,
    /// Path of the credentials login endpoint.
    pub login_path: String,
    /// Path of the token refresh endpoint.
    pub refresh_path: String,
    /// Storage key holding the raw access token.
    pub storage_key: String,
    /// Timeout applied to ordinary requests.
    pub request_timeout: Duration,
    /// Timeout applied to the refresh call; elapsing it is a refresh failure.
    pub refresh_timeout: Duration,
    /// Safety margin subtracted from token expiry when arming the proactive
    /// refresh timer.
    pub refresh_skew: Duration,
}

impl SessionConfig {
    /// Construct config with sensible defaults (10 second timeouts, 5 minute
    /// refresh skew).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            storage_key: "auth_token".to_string(),
            request_timeout: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(10),
            refresh_skew: Duration::from_secs(300),
        }
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }
}

pub fn load_session_config() -> Result<SessionConfig> {
    let base_url =
        env::var("SESSION_BASE_URL").context("SESSION_BASE_URL must be set")?;
    let mut config = SessionConfig::new(base_url);

    if let Some(path) = non_empty_from_env("SESSION_LOGIN_PATH") {
        config.login_path = path;
    }
    if let Some(path) = non_empty_from_env("SESSION_REFRESH_PATH") {
        config.refresh_path = path;
    }
    if let Some(key) = non_empty_from_env("SESSION_STORAGE_KEY") {
        config.storage_key = key;
    }
    if let Some(timeout) = duration_from_env("SESSION_REQUEST_TIMEOUT_SECS")? {
        config.request_timeout = timeout;
    }
    if let Some(timeout) = duration_from_env("SESSION_REFRESH_TIMEOUT_SECS")? {
        config.refresh_timeout = timeout;
    }
    if let Some(skew) = duration_from_env("SESSION_REFRESH_SKEW_SECS")? {
        config.refresh_skew = skew;
    }

    Ok(config)
}

fn non_empty_from_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn duration_from_env(key: &str) -> Result<Option<Duration>> {
    match non_empty_from_env(key) {
        Some(value) => {
            let seconds: u64 = value
                .parse()
                .map_err(|err| anyhow!("Invalid seconds value '{value}' for {key}: {err}"))?;
            Ok(Some(Duration::from_secs(seconds)))
        }
        None => Ok(None),
    }
}
