use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BakeError, Result};

/// Default deadline for network-bound steps (base fetch, package fetch).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;

/// Bake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    /// Local base image store (`<root>/<registry>/<repository>/<tag>/`)
    pub base_store: PathBuf,

    /// Local package repository (`<root>/<name>/package.json`)
    pub package_repo: PathBuf,

    /// Deadline for each network-bound step, in seconds
    pub fetch_timeout_secs: u64,

    /// Pull base images from OCI registries instead of the local store
    pub use_registry: bool,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for BakeConfig {
    fn default() -> Self {
        let home = bake_home();
        Self {
            base_store: home.join("bases"),
            package_repo: home.join("packages"),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            use_registry: false,
            log_level: LogLevel::Warn,
        }
    }
}

impl BakeConfig {
    /// Path of the user configuration file (~/.a3s/bake/config.yaml).
    pub fn default_path() -> PathBuf {
        bake_home().join("config.yaml")
    }

    /// Load configuration from a YAML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BakeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: BakeConfig = serde_yaml::from_str(&content).map_err(|e| {
            BakeError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the user configuration file if present, defaults otherwise.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_secs == 0 {
            return Err(BakeError::ConfigError(
                "fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// A3S Bake home directory (~/.a3s/bake).
fn bake_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("bake")
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
