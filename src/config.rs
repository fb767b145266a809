//! Configuration for the telemetry layer
//!
//! Configuration is a nested TOML document with three sections. Unknown
//! keys are ignored; missing keys fall back to the documented defaults.
//!
//! # Example kode-kronical.toml
//!
//! ```toml
//! [kode_kronical]
//! enabled = true
//! exception_show_globals = true
//! max_arg_capture_len = 256
//!
//! [local]
//! enabled = false
//! data_dir = "./kode-kronical-data"
//!
//! [daemon]
//! data_dir = "/var/lib/kode-kronical"
//! staleness_window_secs = 30.0
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by configuration loading and validation
///
/// This is the only error category the crate raises as a hard failure;
/// everything downstream of construction degrades instead of erroring.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A recognized key carries an unusable value
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

fn default_true() -> bool {
    true
}

fn default_max_arg_capture_len() -> usize {
    256
}

fn default_local_data_dir() -> PathBuf {
    PathBuf::from("./kode-kronical-data")
}

fn default_staleness_window_secs() -> f64 {
    30.0
}

/// The `[kode_kronical]` section: recording and capture gates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KodeKronicalSection {
    /// Gates all recording; `false` turns every wrapper into a pass-through
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Gates module-level variable capture in failure records
    #[serde(default = "default_true")]
    pub exception_show_globals: bool,
    /// Upper bound on captured argument representations, in bytes
    #[serde(default = "default_max_arg_capture_len")]
    pub max_arg_capture_len: usize,
}

impl Default for KodeKronicalSection {
    fn default() -> Self {
        KodeKronicalSection {
            enabled: true,
            exception_show_globals: true,
            max_arg_capture_len: default_max_arg_capture_len(),
        }
    }
}

/// The `[local]` section: project-local data directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalSection {
    /// When set, the local data directory joins the candidate search order
    pub enabled: bool,
    #[serde(default = "default_local_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for LocalSection {
    fn default() -> Self {
        LocalSection {
            enabled: false,
            data_dir: default_local_data_dir(),
        }
    }
}

/// The `[daemon]` section: collector feed discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSection {
    /// Explicit feed directory; when set it is the only candidate checked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// A feed whose newest snapshot is older than this is treated as dead
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: f64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        DaemonSection {
            data_dir: None,
            staleness_window_secs: default_staleness_window_secs(),
        }
    }
}

/// Root configuration for the telemetry layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KronicalConfig {
    pub kode_kronical: KodeKronicalSection,
    pub local: LocalSection,
    pub daemon: DaemonSection,
}

impl KronicalConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: KronicalConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every recognized value, rejecting unusable ones immediately
    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = self.daemon.staleness_window_secs;
        if !window.is_finite() || window <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "daemon.staleness_window_secs",
                reason: format!("must be a finite positive number, got {window}"),
            });
        }
        if self.kode_kronical.max_arg_capture_len == 0 {
            return Err(ConfigError::InvalidValue {
                key: "kode_kronical.max_arg_capture_len",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(dir) = &self.daemon.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "daemon.data_dir",
                    reason: "must not be empty when set".to_string(),
                });
            }
        }
        if self.local.enabled && self.local.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "local.data_dir",
                reason: "must not be empty when local.enabled is set".to_string(),
            });
        }
        Ok(())
    }

    /// Effective resolved configuration as JSON, for diagnostics
    pub fn effective(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .context("serializing effective config")
            .unwrap_or_else(|err| {
                tracing::debug!("effective config serialization failed: {err:#}");
                serde_json::Value::Null
            })
    }
}
