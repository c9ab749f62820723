//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_scheduler(config)?;
    validate_storage(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_scheduler(config: &Config) -> Result<()> {
    if config.scheduler.period_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scheduler.period_ms".to_string(),
            message: "period must be greater than zero".to_string(),
        }
        .into());
    }

    if config.scheduler.shutdown_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scheduler.shutdown_timeout_ms".to_string(),
            message: "shutdown timeout must be greater than zero".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_storage(config: &Config) -> Result<()> {
    let category = &config.storage.category;
    if category.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "storage.category".to_string(),
            message: "category cannot be empty".to_string(),
        }
        .into());
    }

    if category.contains('/') {
        return Err(ConfigError::InvalidValue {
            field: "storage.category".to_string(),
            message: "category cannot contain '/'".to_string(),
        }
        .into());
    }

    Ok(())
}
