// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Configuration type definitions
//!
//! This module defines all configuration structs that map to sections in
//! `cipherflow.toml`.

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CipherflowConfig {
    pub runtime: RuntimeConfig,
    pub keys: KeysConfig,
    pub accelerator: AcceleratorConfig,
    pub simulation: SimulationConfig,
    pub distributed: DistributedConfig,
    pub logging: LoggingConfig,
}

/// Scheduler and worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool size
    pub parallelism: usize, // 0 = auto-detect
    /// Dispatch nodes in a reproducible order (lowest ready node id first)
    pub deterministic_order: bool,
    /// Skip nodes that no requested output depends on
    pub elide_dead_nodes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            deterministic_order: false,
            elide_dead_nodes: true,
        }
    }
}

/// Key manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Maximum number of cached key sets before LRU eviction
    pub cache_capacity: usize,
    /// Seed for secret key randomness
    pub secret_seed: u64,
    /// Seed for encryption randomness
    pub encryption_seed: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 32,
            secret_seed: 0,
            encryption_seed: 0,
        }
    }
}

/// Accelerator backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    pub enabled: bool,
    /// Number of emulated devices in the inventory
    pub device_count: usize,
    /// Memory available on each emulated device
    pub device_memory_bytes: u64,
    /// "round_robin" or "least_loaded"
    pub selection: String,
    /// Re-run a node on the CPU path when its device fails
    pub cpu_fallback: bool,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_count: 1,
            device_memory_bytes: 256 * 1024 * 1024,
            selection: "round_robin".to_string(),
            cpu_fallback: true,
        }
    }
}

/// Simulation backend configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
}

/// Remote worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Number of remote workers spawned with the context
    pub remote_workers: usize,
    /// Bounded capacity of each worker's message channel
    pub channel_capacity: usize,
    /// Wait this long for a remote completion before retransmitting
    pub ack_timeout_ms: u64,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            remote_workers: 0,
            channel_capacity: 64,
            ack_timeout_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    pub level: String,
    /// Crates that log at debug level regardless of `level`
    pub debug_crates: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug_crates: Vec::new(),
        }
    }
}

impl AcceleratorConfig {
    /// Accepted values for `selection`
    pub const SELECTION_POLICIES: &'static [&'static str] = &["round_robin", "least_loaded"];
}

impl LoggingConfig {
    /// Accepted values for `level`
    pub const LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];
}
