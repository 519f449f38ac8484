// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Configuration validation
//!
//! Ensures configuration values are within valid ranges and consistent with
//! each other before a context is built from them.

use crate::{AcceleratorConfig, CipherflowConfig, ConfigError, ConfigResult, LoggingConfig};

/// Validation errors that can occur during config validation
#[derive(Debug, Clone)]
pub enum ConfigValidationError {
    MissingRequired { field: String },
    InvalidValue { field: String, reason: String },
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired { field } => {
                write!(f, "Missing required configuration: {}", field)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid configuration value for {}: {}", field, reason)
            }
        }
    }
}

/// Validate the complete configuration
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` listing every problem found
pub fn validate_config(config: &CipherflowConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    validate_required_fields(config, &mut errors);
    validate_value_ranges(config, &mut errors);

    if !errors.is_empty() {
        let error_messages = errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");

        return Err(ConfigError::ValidationError(format!(
            "Configuration validation failed:\n{}",
            error_messages
        )));
    }

    Ok(())
}

fn validate_required_fields(config: &CipherflowConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.logging.level.is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "logging.level".to_string(),
        });
    }
    if config.accelerator.selection.is_empty() {
        errors.push(ConfigValidationError::MissingRequired {
            field: "accelerator.selection".to_string(),
        });
    }
}

fn validate_value_ranges(config: &CipherflowConfig, errors: &mut Vec<ConfigValidationError>) {
    if config.keys.cache_capacity == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "keys.cache_capacity".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    if config.runtime.parallelism > 4096 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "runtime.parallelism".to_string(),
            reason: "must be at most 4096 (0 = auto-detect)".to_string(),
        });
    }

    if config.accelerator.enabled {
        if config.accelerator.device_count == 0 {
            errors.push(ConfigValidationError::InvalidValue {
                field: "accelerator.device_count".to_string(),
                reason: "must be at least 1 when the accelerator is enabled".to_string(),
            });
        }
        if config.accelerator.device_memory_bytes == 0 {
            errors.push(ConfigValidationError::InvalidValue {
                field: "accelerator.device_memory_bytes".to_string(),
                reason: "must be positive".to_string(),
            });
        }
    }

    if !config.accelerator.selection.is_empty()
        && !AcceleratorConfig::SELECTION_POLICIES.contains(&config.accelerator.selection.as_str())
    {
        errors.push(ConfigValidationError::InvalidValue {
            field: "accelerator.selection".to_string(),
            reason: format!(
                "must be one of {}",
                AcceleratorConfig::SELECTION_POLICIES.join(", ")
            ),
        });
    }

    if config.distributed.remote_workers > 0 && config.distributed.channel_capacity == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "distributed.channel_capacity".to_string(),
            reason: "must be positive when remote workers are configured".to_string(),
        });
    }
    if config.distributed.remote_workers > 0 && config.distributed.ack_timeout_ms == 0 {
        errors.push(ConfigValidationError::InvalidValue {
            field: "distributed.ack_timeout_ms".to_string(),
            reason: "must be positive when remote workers are configured".to_string(),
        });
    }

    if !config.logging.level.is_empty()
        && !LoggingConfig::LEVELS.contains(&config.logging.level.as_str())
    {
        errors.push(ConfigValidationError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!("must be one of {}", LoggingConfig::LEVELS.join(", ")),
        });
    }
}
