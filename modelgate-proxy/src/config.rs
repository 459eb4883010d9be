//! Configuration file loading.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

/// Error types for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("backend_url is required and must be non-empty")]
    MissingBackendUrl,

    #[error("backend_url '{url}' is not a valid URL: {reason}")]
    InvalidBackendUrl { url: String, reason: String },
}

/// Per-model settings in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    /// Maximum concurrent requests forwarded for this model. Non-positive
    /// values are replaced with a fallback when the pools are built.
    pub capacity: i64,
}

/// Operator-written configuration.
///
/// ```yaml
/// backend_url: "http://127.0.0.1:11434"
/// listen_addr: "127.0.0.1:8080"
/// default_capacity: 100
/// models:
///   llama3:
///     capacity: 4
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Origin all requests are forwarded to. Required.
    pub backend_url: String,

    /// Address the proxy listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Capacity of the catch-all `default` pool.
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    /// Per-model admission capacities. May be empty; unlisted models share
    /// the `default` pool.
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_capacity() -> usize {
    100
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: display.clone(), source })?;
        Self::from_yaml(&raw, &display)
    }

    fn from_yaml(raw: &str, path: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;

        if config.backend_url.trim().is_empty() {
            return Err(ConfigError::MissingBackendUrl);
        }
        if let Err(err) = config.backend_url.parse::<reqwest::Url>() {
            return Err(ConfigError::InvalidBackendUrl {
                url: config.backend_url.clone(),
                reason: err.to_string(),
            });
        }

        Ok(config)
    }
}
