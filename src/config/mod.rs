mod provider;
pub use provider::{ConfigProvider, EnvConfigProvider, MapConfigProvider};

use crate::error::{Error, Result};
use crate::marketplace::{Marketplace, OAuthEndpoints};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Complete marketlink configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketlinkConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    /// Per-marketplace endpoint overrides, keyed by canonical name
    #[serde(default)]
    pub endpoints: HashMap<String, OAuthEndpoints>,
}

/// Token lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Refresh once fewer than this many seconds remain before expiry
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_seconds: i64,

    /// Per-marketplace thresholds, keyed by canonical name.
    ///
    /// Amazon issues one-hour access tokens, so the global one-hour
    /// threshold would refresh them on every call.
    #[serde(default = "default_thresholds")]
    pub thresholds: HashMap<String, i64>,
}

fn default_refresh_threshold() -> i64 {
    3600
}

fn default_thresholds() -> HashMap<String, i64> {
    HashMap::from([(Marketplace::Amazon.as_str().to_string(), 600)])
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_seconds: default_refresh_threshold(),
            thresholds: default_thresholds(),
        }
    }
}

impl LifecycleConfig {
    /// Threshold in seconds for a marketplace, falling back to the global one.
    pub fn threshold_for(&self, marketplace: Marketplace) -> i64 {
        self.thresholds
            .get(marketplace.as_str())
            .copied()
            .unwrap_or(self.refresh_threshold_seconds)
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Timeout for every call to a marketplace authorization server
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_http_timeout(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "marketlink.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Authorization (account linking) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    /// How long an issued OAuth `state` stays valid
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
}

fn default_state_expiry() -> i64 {
    600
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            state_expiry_seconds: default_state_expiry(),
        }
    }
}

impl MarketlinkConfig {
    /// Endpoints for a marketplace, honoring overrides from the config file.
    pub fn endpoints_for(&self, marketplace: Marketplace) -> OAuthEndpoints {
        self.endpoints
            .get(marketplace.as_str())
            .cloned()
            .unwrap_or_else(|| marketplace.default_endpoints())
    }

    /// Apply `MARKETLINK_*` overrides from a config provider.
    ///
    /// Unparseable values are ignored and the current value kept.
    pub fn apply_overrides(&mut self, provider: &dyn ConfigProvider) {
        if let Some(n) = provider
            .get("MARKETLINK_REFRESH_THRESHOLD_SECONDS")
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.lifecycle.refresh_threshold_seconds = n;
        }
        if let Some(n) = provider
            .get("MARKETLINK_HTTP_TIMEOUT_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.http.timeout_seconds = n;
        }
        if let Some(path) = provider.get("MARKETLINK_DATABASE_PATH") {
            if !path.is_empty() {
                self.storage.database_path = path;
            }
        }
    }

    /// Reject unknown marketplace keys, zero timeouts and negative thresholds.
    pub fn validate(&self) -> Result<()> {
        for name in self.endpoints.keys() {
            name.parse::<Marketplace>()?;
        }
        if self.http.timeout_seconds == 0 {
            return Err(Error::Configuration(
                "http.timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.lifecycle.refresh_threshold_seconds < 0 {
            return Err(Error::Configuration(
                "lifecycle.refresh_threshold_seconds must not be negative".to_string(),
            ));
        }
        for (name, seconds) in &self.lifecycle.thresholds {
            name.parse::<Marketplace>()?;
            if *seconds < 0 {
                return Err(Error::Configuration(format!(
                    "lifecycle.thresholds.{} must not be negative",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Parse configuration from TOML text
pub fn parse_config(contents: &str) -> Result<MarketlinkConfig> {
    let config: MarketlinkConfig = toml::from_str(contents)
        .map_err(|e| Error::Configuration(format!("invalid config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<MarketlinkConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("failed to read {}: {}", path, e)))?;
    parse_config(&contents)
}
