//! Engine configuration.
//!
//! Every field has a default, so `{}` is a valid configuration file.
//!
//! ```
//! use manuscript_core::config::{EngineConfig, MirrorMode};
//!
//! let config: EngineConfig = serde_json::from_str(r#"{ "mirror_mode": "inline" }"#).unwrap();
//! assert_eq!(config.mirror_mode, MirrorMode::Inline);
//! assert_eq!(config.external_timeout_ms, 10_000);
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How cache writes are mirrored to the external store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMode {
    /// Spawn the mirror write and respond without waiting for it.
    #[default]
    Detached,
    /// Await the mirror write (still bounded) and report failures as warnings.
    Inline,
}

/// Runtime configuration of the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for every external store call.
    #[serde(default = "default_external_timeout_ms")]
    pub external_timeout_ms: u64,
    #[serde(default)]
    pub mirror_mode: MirrorMode,
    /// `trace|debug|info|warn|error`; defaults to the build-mode level.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Absolute directory for rolling log files. Logging stays off when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_external_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            external_timeout_ms: default_external_timeout_ms(),
            mirror_mode: MirrorMode::default(),
            log_level: None,
            log_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    /// Rejects values that would make external calls unbounded or instant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.external_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "external_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse config `{}`: {source}", path.display())
            }
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid(_) => None,
        }
    }
}

/// Reads and validates a JSON configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: EngineConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
