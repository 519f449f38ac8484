// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Unified logging initialization
//!
//! Console output is always installed. With the `file-logging` feature, each run also
//! writes a combined JSON log into a timestamped folder.

use anyhow::{Context, Result};
use cipherflow_config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;

/// Keeps background log writers alive; logs are flushed when dropped
pub struct LoggingGuard {
    #[cfg(feature = "file-logging")]
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Run folder receiving file logs, if file logging is active
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// Build the filter directive for a logging config plus debug flags
pub fn filter_directive(config: &LoggingConfig, debug_flags: &CrateDebugFlags) -> String {
    let mut flags = CrateDebugFlags::from_names(&config.debug_crates);
    flags.merge(debug_flags);
    flags.to_filter_string(&config.level)
}

/// Initialize console logging
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig, debug_flags: &CrateDebugFlags) -> Result<LoggingGuard> {
    let env_filter = EnvFilter::try_new(filter_directive(config, debug_flags))
        .context("Invalid log filter directive")?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    Registry::default()
        .with(console_layer)
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    Ok(LoggingGuard {
        #[cfg(feature = "file-logging")]
        _file_guards: Vec::new(),
        log_dir: None,
    })
}

/// Initialize console logging plus a rolling JSON log file under `base_log_dir/run_<timestamp>/`
#[cfg(feature = "file-logging")]
pub fn init_file_logging(
    config: &LoggingConfig,
    debug_flags: &CrateDebugFlags,
    base_log_dir: &Path,
) -> Result<LoggingGuard> {
    use chrono::Utc;
    use tracing_appender::rolling;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let run_folder = base_log_dir.join(format!("run_{}", timestamp));
    std::fs::create_dir_all(&run_folder)
        .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

    let directive = filter_directive(config, debug_flags);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(EnvFilter::try_new(&directive).context("Invalid log filter directive")?)
        .boxed();

    let appender = rolling::daily(&run_folder, "cipherflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(EnvFilter::try_new(&directive).context("Invalid log filter directive")?)
        .boxed();

    Registry::default()
        .with(vec![console_layer, file_layer])
        .try_init()
        .context("Failed to install global tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guards: vec![guard],
        log_dir: Some(run_folder),
    })
}
