//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default file.
//! `API_BASE_URL` overrides `[api] base_url`. The seed access token comes from
//! the `ACCESS_TOKEN` env var or `token_file`, never from the TOML itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use realtime::{BackoffPolicy, CorrelationPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// REST settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Host URL; `/api` is appended unless present.
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Path to a file holding an access token to start the session with
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
}

/// Content hub settings
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Server silence after which a hub connection is dropped and retried
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,
    /// Payload field carrying the request id in hub events. Unset means any
    /// event on the channel settles a pending call.
    #[serde(default)]
    pub correlation_field: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_secs: default_invoke_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            keepalive_secs: default_keepalive(),
            server_timeout_secs: default_server_timeout(),
            correlation_field: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_invoke_timeout() -> u64 {
    120
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_keepalive() -> u64 {
    15
}

fn default_server_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Access token resolution order:
    /// 1. ACCESS_TOKEN env var
    /// 2. token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(base_url) = std::env::var("API_BASE_URL") {
            config.api.base_url = base_url;
        }
        config.validate()?;

        if let Ok(token) = std::env::var("ACCESS_TOKEN") {
            let token = Secret::new(token);
            if !token.is_blank() {
                config.api.access_token = Some(token);
            }
        } else if let Some(ref token_file) = config.api.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.api.access_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = self.api.base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.realtime.invoke_timeout_secs == 0 {
            return Err(common::Error::Config(
                "invoke_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.realtime.keepalive_secs == 0 {
            return Err(common::Error::Config(
                "keepalive_secs must be greater than 0".into(),
            ));
        }
        if self.realtime.server_timeout_secs == 0 {
            return Err(common::Error::Config(
                "server_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.realtime.backoff_base_ms == 0
            || self.realtime.backoff_base_ms > self.realtime.backoff_max_ms
        {
            return Err(common::Error::Config(format!(
                "backoff_base_ms must be between 1 and backoff_max_ms ({})",
                self.realtime.backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("learnpath-access.toml")
    }

    /// REST base, e.g. `https://host/api`.
    pub fn api_base(&self) -> String {
        session_auth::api_base(&self.api.base_url)
    }

    /// Hub base, e.g. `wss://host`.
    pub fn hub_base(&self) -> String {
        realtime::hub_base(&self.api.base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.realtime.invoke_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.realtime.keepalive_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.realtime.server_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.realtime.backoff_base_ms),
            max: Duration::from_millis(self.realtime.backoff_max_ms),
        }
    }

    pub fn correlation_policy(&self) -> CorrelationPolicy {
        match &self.realtime.correlation_field {
            Some(field) if !field.trim().is_empty() => {
                CorrelationPolicy::PayloadField(field.trim().to_string())
            }
            _ => CorrelationPolicy::AnyEvent,
        }
    }
}
