//! Daemon configuration parsing.
//!
//! Configuration is a TOML file; every field has a default so an empty file
//! (or no file at all) yields a working single-node setup. The orchestrator
//! block is passed through to [`enroll_core::OrchestratorConfig`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use enroll_core::OrchestratorConfig;
use enroll_core::naming::namespace_root;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML did not parse or did not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed configuration is semantically invalid.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What rule was violated.
        reason: String,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// HTTP API listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Onboarding orchestrator settings (environment suffix, root topic,
    /// adapter retry policy).
    #[serde(default)]
    pub onboarding: OrchestratorConfig,

    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the onboarding API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address the Prometheus metrics endpoint listens on.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,

    /// Message broker endpoint returned to onboarded devices, if known.
    #[serde(default)]
    pub broker_endpoint: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("valid default listen addr")
}

fn default_metrics_addr() -> SocketAddr {
    "127.0.0.1:9100".parse().expect("valid default metrics addr")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            broker_endpoint: None,
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path of the onboarding ledger database.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Directory where issued certificates (public material only) are
    /// written for operator re-fetch. `None` disables the write-out.
    #[serde(default)]
    pub certificate_dir: Option<PathBuf>,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("onboarding.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            certificate_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a validation rule fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let root = namespace_root(&self.onboarding.root_topic);
        if root.is_empty() || root == "#" || root == "+" {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "root_topic {:?} must start with a concrete segment",
                    self.onboarding.root_topic
                ),
            });
        }
        if self.onboarding.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
