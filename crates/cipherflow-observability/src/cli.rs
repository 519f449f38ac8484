// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! CLI argument parsing for per-crate debug flags
//!
//! Supports flags like `--debug-cipherflow-runtime` to raise one crate to debug level.

use std::collections::HashMap;
use std::env;

use crate::{crate_target, KNOWN_CRATES};

/// Environment variable holding comma-separated crate names to debug
pub const DEBUG_ENV: &str = "CIPHERFLOW_DEBUG";

/// Per-crate debug flags
///
/// # Example
/// ```rust
/// use cipherflow_observability::CrateDebugFlags;
///
/// let flags = CrateDebugFlags::from_args(vec!["--debug-cipherflow-keys".to_string()]);
/// assert!(flags.is_enabled("cipherflow-keys"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CrateDebugFlags {
    pub enabled_crates: HashMap<String, bool>,
}

impl CrateDebugFlags {
    /// Parse debug flags from command-line arguments
    ///
    /// Looks for arguments matching `--debug-{crate-name}`; `--debug-all` enables every known crate.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut flags = CrateDebugFlags::default();
        for arg in args {
            if arg == "--debug-all" {
                flags.enable_all();
                continue;
            }
            if let Some(crate_name) = arg.strip_prefix("--debug-") {
                flags.enable(crate_name);
            }
        }
        flags
    }

    /// Build flags from a configured crate list (`logging.debug_crates`)
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = CrateDebugFlags::default();
        for name in names {
            let name = name.as_ref().trim();
            if name == "all" {
                flags.enable_all();
            } else if !name.is_empty() {
                flags.enable(name);
            }
        }
        flags
    }

    pub fn enable(&mut self, crate_name: &str) {
        self.enabled_crates.insert(crate_name.to_string(), true);
    }

    pub fn enable_all(&mut self) {
        for crate_name in KNOWN_CRATES {
            self.enable(crate_name);
        }
    }

    /// Merge another set of flags into this one
    pub fn merge(&mut self, other: &CrateDebugFlags) {
        for name in other.enabled_crates.keys() {
            self.enable(name);
        }
    }

    /// Check if debug is enabled for a specific crate
    pub fn is_enabled(&self, crate_name: &str) -> bool {
        self.enabled_crates.contains_key(crate_name)
    }

    /// Check if debug is enabled for any crate
    pub fn any_enabled(&self) -> bool {
        !self.enabled_crates.is_empty()
    }

    /// Get log level for a crate
    pub fn log_level(&self, crate_name: &str) -> tracing::Level {
        if self.is_enabled(crate_name) {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Create an `EnvFilter` directive string
    ///
    /// Format: `"cipherflow_runtime=debug,info"`, or just the default level if none enabled.
    pub fn to_filter_string(&self, default_level: &str) -> String {
        let mut names: Vec<&String> = self.enabled_crates.keys().collect();
        names.sort();

        let mut filters: Vec<String> = names
            .into_iter()
            .map(|name| format!("{}=debug", crate_target(name)))
            .collect();
        filters.push(default_level.to_string());
        filters.join(",")
    }
}

/// Parse debug flags from process arguments and the `CIPHERFLOW_DEBUG` environment variable
///
/// The variable holds comma-separated crate names, or `all`.
pub fn parse_debug_flags() -> CrateDebugFlags {
    let mut flags = CrateDebugFlags::from_args(env::args());
    if let Ok(env_var) = env::var(DEBUG_ENV) {
        flags.merge(&CrateDebugFlags::from_names(env_var.split(',')));
    }
    flags
}

/// Generate help text for debug flags
pub fn debug_flags_help() -> String {
    format!(
        r#"Debug Flags:
  --debug-all                    Enable debug logging for all crates
  --debug-{{crate-name}}          Enable debug logging for specific crate

Available crates:
  {}

Environment Variable:
  {}={{crate-name}}[,{{crate-name}}]  Enable debug for crates (comma-separated)
  {}=all                             Enable debug for all crates
"#,
        KNOWN_CRATES.join(", "),
        DEBUG_ENV,
        DEBUG_ENV
    )
}
