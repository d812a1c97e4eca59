//! Context manager configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Context manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextManagerConfig {
    /// Endpoint used for capabilities and requests that name no endpoint
    #[serde(rename = "default-endpoint-id", default = "default_endpoint_id")]
    pub default_endpoint_id: String,

    /// Deadline for `get_default_context` requests, in milliseconds
    #[serde(rename = "default-timeout-ms", default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_endpoint_id() -> String {
    debug!("default_endpoint_id: called");
    "default".to_string()
}

fn default_timeout_ms() -> u64 {
    debug!("default_timeout_ms: called");
    2000
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            default_endpoint_id: default_endpoint_id(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl ContextManagerConfig {
    /// Default request deadline as a Duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.contextmanager.yml`, then
    /// `<config dir>/contextmanager/contextmanager.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // An explicit path must load; a broken file there is an error
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Implicit locations are best effort: a bad file is skipped with a warning
        for candidate in Self::search_paths() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("Failed to load config from {}: {}", candidate.display(), e),
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Implicit config locations, most specific first
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".contextmanager.yml")];
        // ~/.config/contextmanager/contextmanager.yml
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("contextmanager").join("contextmanager.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        // Empty would make every unaddressed capability unreachable
        if config.default_endpoint_id.is_empty() {
            return Err(eyre::eyre!("default-endpoint-id must not be empty"));
        }

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
