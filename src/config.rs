//! Engine construction parameters and their TOML form.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default reserved field carrying the join object in document sources.
pub const DEFAULT_JOIN_FIELD: &str = "join_field";
/// Default number of partitions.
pub const DEFAULT_PARTITIONS: u32 = 4;
/// Default number of incremental updates a snapshot absorbs before the
/// partition is rebuilt.
pub const DEFAULT_INCREMENTAL_UPDATE_THRESHOLD: usize = 10_000;
/// Default memory budget of the ordinal cache (64 MiB).
pub const DEFAULT_CACHE_MEMORY_BUDGET: usize = 64 << 20;

/// Configuration of a [`crate::JoinEngine`].
///
/// ```toml
/// partitions = 8
/// join_field = "my_join"
/// eager_global_ordinals = false
/// incremental_update_threshold = 5000
/// cache_memory_budget_bytes = 16777216
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinConfig {
    /// Number of partitions documents are routed over.
    pub partitions: u32,
    /// Name of the join field inside document sources. A mapping that names
    /// a different field is rejected by the engine.
    pub join_field: String,
    /// Overrides the mapping's `eager_global_ordinals` when set.
    pub eager_global_ordinals: Option<bool>,
    /// Incremental updates per partition before the snapshot is dropped and
    /// rebuilt from scratch.
    pub incremental_update_threshold: usize,
    /// Soft memory budget for resident ordinal snapshots.
    pub cache_memory_budget_bytes: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            join_field: DEFAULT_JOIN_FIELD.to_string(),
            eager_global_ordinals: None,
            incremental_update_threshold: DEFAULT_INCREMENTAL_UPDATE_THRESHOLD,
            cache_memory_budget_bytes: DEFAULT_CACHE_MEMORY_BUDGET,
        }
    }
}

impl JoinConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|source| ConfigError::ParseInline { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::Invalid {
                field: "partitions",
                reason: "must be at least 1",
            });
        }
        if self.join_field.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "join_field",
                reason: "must not be empty",
            });
        }
        if self.incremental_update_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "incremental_update_threshold",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Failures while loading a [`JoinConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read join config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// File was not valid TOML for the config shape.
    #[error("failed to parse join config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Inline TOML was not valid for the config shape.
    #[error("failed to parse join config: {source}")]
    ParseInline {
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid join config value for '{field}': {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Constraint that was violated.
        reason: &'static str,
    },
}
