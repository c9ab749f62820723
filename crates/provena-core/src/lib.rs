//! Provena Core - shared foundations for the provenance pipeline
//!
//! This crate provides the error taxonomy, configuration loading and the
//! small value types shared by the task scheduler and the caching layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, SchedulerConfig, StorageConfig};
pub use error::{
    ConfigError, PipelineError, ProvenaError, Result, SchedulerError, StorageError,
};
pub use types::{Bounds, Priority, Spacing, TaskClass};
