//! Engine configuration.
//!
//! Ambient settings loaded from a YAML file (`warden.yaml`). Scheduling
//! itself belongs to the host substrate; the interval and jitter here are
//! informational defaults that tooling (and the simulator) reuse.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between scheduled ticks for one managed index.
    #[serde(default = "default_job_interval", with = "crate::duration")]
    pub job_interval: Duration,

    /// Fraction of the interval used as the jitter bound at job start.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Metadata history settings.
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_interval: default_job_interval(),
            jitter: default_jitter(),
            history: HistoryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }
}

/// History settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: HistoryBackend,

    /// File path for the file backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: HistoryBackend::default(),
            file_path: None,
        }
    }
}

/// History storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    /// Log records to stdout.
    #[default]
    Console,
    /// Append JSON Lines to a file.
    File,
    /// Keep records in memory (tooling and tests).
    Memory,
    /// Discard records.
    None,
}

fn default_true() -> bool {
    true
}

fn default_job_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_jitter() -> f64 {
    0.6
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
