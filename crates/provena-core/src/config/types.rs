//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::{
    DEFAULT_CATEGORY, DEFAULT_PERIOD_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS, DEFAULT_STORAGE_ROOT,
    RUNNING_TASKS_PER_CORE,
};

/// Main configuration for Provena
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Persistent storage configuration
    pub storage: StorageConfig,
}

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the scheduling loop in milliseconds
    pub period_ms: u64,

    /// Maximum concurrently running tasks. 0 = automatic.
    pub max_running_tasks: usize,

    /// How long abort waits for each worker thread, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            max_running_tasks: 0,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// Scheduling loop period
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Bound on waiting for a worker thread to exit during abort
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Resolve the concurrency cap (0 means a multiple of available parallelism)
    pub fn resolved_max_running_tasks(&self) -> usize {
        if self.max_running_tasks == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                * RUNNING_TASKS_PER_CORE
        } else {
            self.max_running_tasks
        }
    }
}

/// Persistent storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the storage
    pub root: PathBuf,

    /// Category tag prefixed to every filter's data location
    pub category: String,

    /// Whether fetched bytes are verified against recorded checksums
    pub verify_checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            category: DEFAULT_CATEGORY.to_string(),
            verify_checksums: true,
        }
    }
}
