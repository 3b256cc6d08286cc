//! # dreg-config
//!
//! Configuration management for dreg.
//!
//! Loads configuration from:
//! 1. An explicit `--config` path, or `<config-dir>/dreg/config.toml`
//! 2. Environment variables (highest priority)
//!
//! The daemon builds one [`Config`] at startup and passes it down; there is
//! no process-wide instance.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use dreg_cas::EvictionPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub registry: RegistryConfig,
    pub eviction: EvictionConfig,
}

impl Config {
    /// Load config from `path` if given, otherwise from the standard location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::global_config_path() {
                Some(global) if global.exists() => Self::from_file(&global)?,
                _ => Config::default(),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse a single TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: `<config-dir>/dreg/config.toml`
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dreg/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = lookup("DREG_CACHE_ROOT") {
            self.storage.cache_root = PathBuf::from(root);
        }
        if let Some(listen) = lookup("DREG_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(host) = lookup("DOCKER_HOST") {
            match host.strip_prefix("unix://") {
                Some(socket) => self.runtime.socket = PathBuf::from(socket),
                None => {
                    return Err(ConfigError::InvalidValue {
                        key: "DOCKER_HOST",
                        value: host,
                    })
                }
            }
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the registry API listens on
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache root holding `blobs/` and `indexes/`
    pub cache_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/lib/dreg/cache"),
        }
    }
}

/// Container runtime connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker Engine Unix socket
    pub socket: PathBuf,
    /// Engine API version prefix
    pub api_version: String,
    /// Timeout for listing images and starting an export
    pub timeout_secs: u64,
    /// Timeout for a whole pull
    pub pull_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            api_version: "v1.44".to_string(),
            timeout_secs: 30,
            pull_timeout_secs: 600,
        }
    }
}

impl RuntimeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

/// How a tag request is answered
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TagResolution {
    /// Serve the exported `index.json`
    #[default]
    Index,
    /// Redirect to the single manifest the index points at
    Redirect,
}

/// Registry facade behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry prefix stripped from image names before asking the runtime
    pub default_registry: String,
    /// Tag request handling
    pub tag_resolution: TagResolution,
    /// Serialize cache population per image name
    pub serialize_scans: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_registry: "docker.io".to_string(),
            tag_resolution: TagResolution::Index,
            serialize_scans: true,
        }
    }
}

/// Cache eviction; with neither limit set nothing is evicted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    /// Maximum total blob bytes
    pub max_bytes: Option<u64>,
    /// Maximum age of cache entries in seconds
    pub max_age_secs: Option<u64>,
    /// Seconds between background sweeps
    pub interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            max_age_secs: None,
            interval_secs: 3600,
        }
    }
}

impl EvictionConfig {
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_bytes: self.max_bytes,
            max_age: self.max_age_secs.map(Duration::from_secs),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
