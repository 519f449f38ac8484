// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Cipherflow - Execution Runtime for Compiled FHE Circuits
//!
//! Cipherflow runs circuits that an FHE compiler lowered ahead of time into a dataflow
//! graph of primitive encrypted operations. It owns key material per cryptographic
//! partition, schedules ready operations across CPU workers, accelerator devices or remote
//! workers, and moves ciphertext buffers between operations.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! cipherflow = "0.3"
//! ```
//!
//! ## Feature Flags
//! - **`observability`** (default): logging initialization and per-crate debug flags
//! - **`file-logging`**: rolling log files next to console output
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cipherflow::prelude::*;
//!
//! let config = cipherflow::config::load_config(None, None)?;
//! let ctx = Context::create(ContextOptions::from_config(&config)?)?;
//!
//! let artifact = ProgramArtifact::from_file("circuit.json")?;
//! let program = load_program(&artifact)?;
//!
//! let inputs = program.encrypt_inputs(&ctx, &[3, 4])?;
//! let outputs = program.call(&ctx, inputs)?;
//! println!("{:?}", program.decrypt_outputs(&ctx, &outputs)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Crates
//! - [`config`]: `cipherflow.toml` loading, overrides and validation
//! - [`keys`]: partitions, key sets, key manager, key blobs
//! - [`runtime`]: task graph, scheduler, backends, context, programs, C ABI
//! - [`observability`]: logging setup

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export foundation
pub use cipherflow_config as config;
pub use cipherflow_keys as keys;

// Re-export execution
pub use cipherflow_runtime as runtime;

// Re-export infrastructure
#[cfg(feature = "observability")]
pub use cipherflow_observability as observability;

/// Prelude - commonly used types and traits
pub mod prelude {
    pub use crate::config::CipherflowConfig;
    pub use crate::keys::{KeyManager, KeySeed, KeySet, Partition, PartitionId};
    pub use crate::runtime::{
        load_program, CallOptions, CancellationToken, Context, ContextOptions, ExecutionMode,
        ExecutionTrace, OpKind, Program, ProgramArtifact, RuntimeError, Value, ValueId,
    };
}
