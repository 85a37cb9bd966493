//! Configuration module for quill writers
//!
//! Loaded from a TOML file with three sections:
//! - `[writer]`: destination, schema and pipeline tuning
//! - `[rolling]`: thresholds for the built-in rolling policy
//! - `[load]`: synthetic load for the `quill-writer` binary
//!
//! # Example
//! ```ignore
//! let config = Config::load("writer.toml")?;
//! let publisher = WriterBuilder::from_config(&config)?.build()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::common::Schema;
use crate::recorder::Codec;
use crate::ring::{ProducerMode, WaitStrategyKind};
use crate::rolling::RollingPolicyConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub writer: WriterFileConfig,
    #[serde(default)]
    pub rolling: RollingFileConfig,
    #[serde(default)]
    pub load: LoadConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A relative `schema_file` is resolved against the config file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        if let (Some(schema_file), Some(dir)) = (&config.writer.schema_file, path.parent()) {
            if schema_file.is_relative() {
                config.writer.schema_file = Some(dir.join(schema_file));
            }
        }
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

// =============================================================================
// Writer
// =============================================================================

/// `[writer]` section
#[derive(Debug, Clone, Deserialize)]
pub struct WriterFileConfig {
    /// Initial output file
    pub destination: PathBuf,

    /// Inline schema JSON
    #[serde(default)]
    pub schema: Option<String>,

    /// Path to a schema JSON file
    #[serde(default)]
    pub schema_file: Option<PathBuf>,

    /// Ring buffer capacity (power of two)
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    #[serde(default)]
    pub producer_mode: ProducerMode,

    #[serde(default)]
    pub wait_strategy: WaitStrategyKind,

    #[serde(default)]
    pub codec: Codec,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_ring_buffer_size() -> usize {
    2048
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl WriterFileConfig {
    /// Resolve the schema from `schema` or `schema_file`
    pub fn load_schema(&self) -> Result<Schema, ConfigError> {
        let text = match (&self.schema, &self.schema_file) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    field: "writer.schema".to_string(),
                    reason: "set either schema or schema_file, not both".to_string(),
                })
            }
            (Some(inline), None) => inline.clone(),
            (None, Some(file)) => std::fs::read_to_string(file)?,
            (None, None) => return Err(ConfigError::MissingField("writer.schema".to_string())),
        };

        Schema::parse(&text).map_err(|e| ConfigError::InvalidValue {
            field: "writer.schema".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// =============================================================================
// Rolling
// =============================================================================

/// `[rolling]` section
///
/// Omitting the section gives 1 GiB / 10 minutes. Inside the section each
/// threshold is optional; at least one must remain.
#[derive(Debug, Clone, Deserialize)]
pub struct RollingFileConfig {
    #[serde(default)]
    pub max_file_size_mb: Option<u64>,

    #[serde(default)]
    pub max_file_age_secs: Option<u64>,
}

impl Default for RollingFileConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: Some(1024),
            max_file_age_secs: Some(600),
        }
    }
}

impl RollingFileConfig {
    pub fn to_policy_config(&self) -> RollingPolicyConfig {
        let mut config = RollingPolicyConfig::new();
        if let Some(mb) = self.max_file_size_mb {
            config = config.with_file_rolling_size_of(mb * 1024 * 1024);
        }
        if let Some(secs) = self.max_file_age_secs {
            config = config.with_file_rolling_age_of(Duration::from_secs(secs));
        }
        config
    }
}

// =============================================================================
// Load generator
// =============================================================================

/// `[load]` section (quill-writer only)
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_producers")]
    pub producers: usize,

    #[serde(default = "default_records_per_producer")]
    pub records_per_producer: u64,

    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            records_per_producer: default_records_per_producer(),
            payload_bytes: default_payload_bytes(),
        }
    }
}

fn default_producers() -> usize {
    4
}

fn default_records_per_producer() -> u64 {
    100_000
}

fn default_payload_bytes() -> usize {
    150
}
