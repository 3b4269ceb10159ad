//! Configuration structures.
//!
//! Configuration is loaded from a TOML file and then overridden by `HUB_*`
//! environment variables. Every section has defaults, so an empty file (or
//! no file at all) yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::RateLimitConfig;
use crate::types::{Error, Result};

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Runtime budgets (hook timeouts, shutdown grace).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Credential lifetimes, signing secret and rate limits.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Storage adapter selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Plugins to load at boot, in load order.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// Runtime budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Budget for a plugin's `start` hook.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,

    /// Budget for a plugin's `stop` hook before it is abandoned.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// How long in-flight calls and handlers may run after shutdown is signalled.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// How often the background cleanup sweeps expired credentials.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for access tokens. A random secret is generated at boot
    /// when unset, so tokens do not survive a restart.
    pub token_secret: Option<String>,

    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,

    /// Default lifetime for new API keys; `None` means keys never expire.
    #[serde(with = "humantime_serde")]
    pub api_key_ttl: Option<Duration>,

    /// Header carrying the raw API key.
    pub api_key_header: String,

    /// Cookie carrying the session id.
    pub session_cookie: String,

    pub rate_limit: RateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 3600),
            session_ttl: Duration::from_secs(24 * 3600),
            api_key_ttl: None,
            api_key_header: "x-api-key".to_string(),
            session_cookie: "session".to_string(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Storage adapter selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the JSON file adapter. In-memory storage when unset.
    pub data_dir: Option<PathBuf>,
}

/// One plugin to load at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Catalog kind, e.g. `system`.
    pub kind: String,

    /// Instance name; defaults to the kind.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Plugin-specific settings handed to the factory.
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl PluginConfig {
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::config(e.to_string()))
    }

    /// Apply `HUB_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("HUB_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(json) = lookup("HUB_LOG_JSON") {
            self.observability.json_logs = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("HUB_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(secret) = lookup("HUB_TOKEN_SECRET") {
            self.auth.token_secret = Some(secret);
        }
    }

    /// Reject budgets and limits that would make the kernel unusable.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.start_timeout.is_zero() || self.runtime.stop_timeout.is_zero() {
            return Err(Error::config("plugin hook timeouts must be non-zero"));
        }
        if self.runtime.cleanup_interval.is_zero() {
            return Err(Error::config("cleanup_interval must be non-zero"));
        }
        if self.auth.access_token_ttl.is_zero() {
            return Err(Error::config("access_token_ttl must be non-zero"));
        }
        if let Some(secret) = &self.auth.token_secret {
            if secret.len() < 16 {
                return Err(Error::config("token_secret must be at least 16 bytes"));
            }
        }
        self.auth.rate_limit.validate()?;

        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.instance_name()) {
                return Err(Error::config(format!(
                    "plugin instance {} configured twice",
                    plugin.instance_name()
                )));
            }
        }
        Ok(())
    }
}
