//! Configuration for the Retrace monitor
//!
//! TOML with serde, per-section defaults, and validation of the few values
//! that have hard requirements (the trace timeout must be positive).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete monitor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// General monitor settings
    pub monitor: MonitorSettings,

    /// Probe-side settings
    pub probe: ProbeSettings,

    /// Reconstruction engine settings
    pub reconstruction: ReconstructionSettings,
}

impl MonitorConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        debug!(path = %path.display(), "loading config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.reconstruction.max_trace_duration_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconstruction.max_trace_duration_ms must be positive".to_string(),
            ));
        }
        if self.reconstruction.event_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "reconstruction.event_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// General monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Probe-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Master switch; a disabled probe emits no events
    pub enabled: bool,

    /// Hostname override (detected when unset)
    pub hostname: Option<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hostname: None,
        }
    }
}

/// Reconstruction engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionSettings {
    /// Maximum duration a pending trace may span before it is evicted as
    /// incomplete (milliseconds, must be positive)
    pub max_trace_duration_ms: u64,

    /// Report invalid traces and continue (true), or halt processing on the
    /// first invalid trace (false)
    pub ignore_invalid_traces: bool,

    /// Inbound event channel capacity for the stage adapter
    pub event_buffer_size: usize,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            max_trace_duration_ms: 600_000, // 10 minutes
            ignore_invalid_traces: true,
            event_buffer_size: 10_000,
        }
    }
}

impl ReconstructionSettings {
    /// The eviction bound in the unit the engine compares timestamps in
    pub fn max_trace_duration_nanos(&self) -> i64 {
        (self.max_trace_duration_ms as i64).saturating_mul(1_000_000)
    }
}
