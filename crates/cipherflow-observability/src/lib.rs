// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # cipherflow-observability
//!
//! Unified logging setup for cipherflow crates with per-crate debug flag support.
//!
//! ## Features
//! - `file-logging`: Rolling JSON log files per run, in addition to console output

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

pub use cli::*;
pub use init::*;

/// Known cipherflow crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "cipherflow-config",
    "cipherflow-keys",
    "cipherflow-runtime",
    "cipherflow-observability",
];

/// Convert a crate name to the tracing target used by its modules
///
/// Tracing targets use the module path, so `cipherflow-keys` logs under `cipherflow_keys`.
pub fn crate_target(crate_name: &str) -> String {
    crate_name.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_target() {
        assert_eq!(crate_target("cipherflow-runtime"), "cipherflow_runtime");
        assert_eq!(crate_target("plain"), "plain");
    }
}
