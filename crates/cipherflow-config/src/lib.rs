// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Cipherflow Configuration System
//!
//! Loads `cipherflow.toml` into [`CipherflowConfig`]. Values are layered: file first,
//! then `CIPHERFLOW_*` environment variables, then an explicit CLI override map, and the
//! result is validated as a whole.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cipherflow_config::{load_config, CipherflowConfig};
//!
//! // Load configuration with automatic file discovery and overrides
//! let config = load_config(None, None).expect("Failed to load config");
//!
//! println!("Parallelism: {}", config.runtime.parallelism);
//! println!("Key cache capacity: {}", config.keys.cache_capacity);
//! ```
//!
//! A missing section falls back to its defaults, so an empty file is a valid
//! configuration.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::path::PathBuf;

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{apply_cli_overrides, apply_environment_overrides, find_config_file, load_config};
pub use types::*;
pub use validation::{validate_config, ConfigValidationError};

/// Errors from locating, reading, parsing or validating `cipherflow.toml`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found. Searched: {0}")]
    FileNotFound(String),

    #[error("Failed to read {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML syntax: {0}")]
    ParseError(String),

    #[error("{0}")]
    ValidationError(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err.message().to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
