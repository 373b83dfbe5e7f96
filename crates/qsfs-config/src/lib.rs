//! # qsfs-config
//!
//! Configuration for the QSFS supervisor daemon.
//!
//! The daemon reads a single YAML file. Only the keys the supervisor itself
//! consumes live here; deployment tooling keeps its own settings in the same
//! file and ignores ours.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod deployment;
pub mod logging;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("missing required config key: {0}")]
    Missing(&'static str),
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the zdb persistence tree (`<root>/index`, `<root>/data`)
    pub zdb_root_path: PathBuf,
    /// Seconds between retry sweeps
    pub retry_interval: u64,
    /// Port the daemon serves its own /metrics on
    pub prometheus_port: u16,
    /// zstor config file, passed to every uploader invocation
    pub zstor_config_path: PathBuf,
    /// zstor executable
    pub zstor_binary_path: PathBuf,
    /// zstor metadata decoder executable
    pub zstor_decoder_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zdb_root_path: PathBuf::new(),
            retry_interval: 60,
            prometheus_port: 9092,
            zstor_config_path: PathBuf::from("/etc/zstor.toml"),
            zstor_binary_path: PathBuf::from("/usr/local/bin/zstor"),
            zstor_decoder_path: PathBuf::from("/usr/local/bin/zstor-metadata-decoder"),
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("QSFS_ZDB_ROOT") {
            self.zdb_root_path = PathBuf::from(root);
        }
        if let Ok(path) = std::env::var("QSFS_ZSTOR_CONFIG") {
            self.zstor_config_path = PathBuf::from(path);
        }
    }

    /// Checks the keys that have no usable default. Binary presence is
    /// left to the uploader client, which stats its executables on setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zdb_root_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("zdb_root_path"));
        }
        if self.zstor_config_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("zstor_config_path"));
        }
        Ok(())
    }

    /// An explicit 0 falls back to the default sweep cadence.
    pub fn retry_interval(&self) -> Duration {
        if self.retry_interval == 0 {
            Duration::from_secs(60)
        } else {
            Duration::from_secs(self.retry_interval)
        }
    }
}
