//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "provena.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "provena.yaml";

/// Default scheduling period in milliseconds
pub const DEFAULT_PERIOD_MS: u64 = 100;

/// Default bound on waiting for worker threads during abort
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Running tasks allowed per hardware thread when the cap is automatic.
///
/// A task blocked on another filter's output keeps its slot, so the cap must
/// sit above hardware parallelism or dependency chains starve.
pub const RUNNING_TASKS_PER_CORE: usize = 4;

/// Default storage root, relative to the working directory
pub const DEFAULT_STORAGE_ROOT: &str = ".provena/storage";

/// Default storage category for filter data
pub const DEFAULT_CATEGORY: &str = "Filters";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".provena.toml",
        ".provena.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Provena Configuration

[scheduler]
period_ms = 100
max_running_tasks = 0
shutdown_timeout_ms = 5000

[storage]
root = ".provena/storage"
category = "Filters"
verify_checksums = true
"#;
