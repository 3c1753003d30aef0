use crate::task::{validate_user_args, ServerEndpoint};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from iperf-driver.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DriverConfig {
    pub measurement: MeasurementConfig,
    pub server: Option<ServerEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// iperf binary, looked up on PATH unless absolute.
    pub command: PathBuf,
    pub writable_dir: PathBuf,
    /// Extra iperf arguments. `-c` and `-p` are injected and must not appear.
    pub args: String,
    pub idle_timeout_millis: u64,
    pub max_start_attempts: u32,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("iperf3"),
            writable_dir: PathBuf::from("."),
            args: String::new(),
            idle_timeout_millis: 5000,
            max_start_attempts: 5,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`, or defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<DriverConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(DriverConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl MeasurementConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_millis == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_millis must be positive".to_string(),
            ));
        }
        if self.max_start_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_start_attempts must be at least 1".to_string(),
            ));
        }
        validate_user_args(&self.args).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
