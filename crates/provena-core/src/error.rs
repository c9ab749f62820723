//! Error types for Provena

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ProvenaError
pub type Result<T> = std::result::Result<T, ProvenaError>;

/// Main error type for Provena operations
#[derive(Debug, Error)]
pub enum ProvenaError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Scheduler contract violations
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Pipeline contract violations
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Persistent storage errors
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduler contract violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The task is already registered with a scheduler
    #[error("Task {0} is already registered")]
    DuplicateTask(u64),

    /// The scheduler has been aborted and accepts no more work
    #[error("Scheduler has been aborted")]
    Aborted,
}

/// Pipeline contract violations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The filter has no output with this id
    #[error("Filter '{filter}' has no output {id}")]
    UnknownOutput { filter: String, id: u32 },

    /// The output holds no data of this type
    #[error("Output {output} holds no '{data_type}' data")]
    UnknownDataType { output: u32, data_type: String },

    /// The data does not declare this dependency
    #[error("'{data_type}' data does not depend on '{dependency}'")]
    UnknownDependency {
        data_type: String,
        dependency: String,
    },

    /// Storage failure while snapshotting or restoring
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistent storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest serialization error
    #[error("Storage manifest error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored bytes do not match the recorded checksum
    #[error("Checksum mismatch for '{0}'")]
    ChecksumMismatch(String),

    /// Requested entry is not present
    #[error("Storage entry not found: {0}")]
    NotFound(String),
}
