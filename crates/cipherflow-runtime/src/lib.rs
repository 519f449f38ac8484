// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Cipherflow Runtime
//!
//! Executes ahead-of-time compiled FHE circuits. A circuit is a [`TaskGraph`] of primitive
//! encrypted operations; the runtime binds the key material each operation needs, runs
//! ready nodes concurrently on the context's backends, and frees every ciphertext buffer as
//! soon as its last consumer has read it.
//!
//! ## Architecture
//! - [`Context`]: key manager, worker pool, devices and remote workers for one program instance
//! - [`TaskGraph`] / scheduler: dependency-counted dataflow execution with deterministic mode
//! - Backends: CPU ([`Primitives`]), accelerator devices, simulation, remote workers
//! - [`Program`]: JSON artifact loading and the caller-facing `call` API
//! - [`abi`]: `extern "C"` entry points for compiled program code
//!
//! ## Usage
//! ```
//! use cipherflow_runtime::{load_program, Context, ContextOptions, ProgramArtifact};
//!
//! let artifact = ProgramArtifact::from_json(r#"{
//!     "name": "inc",
//!     "partitions": [{"name": "P", "lwe_dim": 1, "glwe_dim": 1, "poly_size": 256}],
//!     "inputs": [{"value": 0, "partition": "P"}],
//!     "outputs": [1],
//!     "nodes": [{"id": 0, "op": {"kind": "add_plain", "constant": 1}, "inputs": [0], "output": 1, "partition": "P"}]
//! }"#).unwrap();
//! let program = load_program(&artifact).unwrap();
//! let ctx = Context::create(ContextOptions::default()).unwrap();
//!
//! let inputs = program.encrypt_inputs(&ctx, &[6]).unwrap();
//! let outputs = program.call(&ctx, inputs).unwrap();
//! assert_eq!(program.decrypt_outputs(&ctx, &outputs).unwrap(), vec![7]);
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod abi;
mod arena;
pub mod backend;
mod context;
mod error;
mod graph;
mod primitives;
mod program;
pub mod remote;
mod scheduler;
mod trace;
mod tracing_mutex;
mod value;

pub use arena::{ArenaStats, BufferArena};
pub use backend::{
    select_backend, AcceleratorBackend, AcceleratorDevice, AcceleratorStats, BackendDecision,
    BackendTarget, CpuBackend, EmulatedDevice, ExecutionMode, SelectionPolicy, SimulationBackend,
};
pub use context::{Context, ContextBuilder, ContextOptions};
pub use error::{DeviceError, PrimitiveError, Result, RuntimeError};
pub use graph::{OpKind, TaskGraph, TaskNode};
pub use primitives::{node_nonce, trivial_ciphertext, OpKeys, Primitives, ReferencePrimitives};
pub use program::{
    load_program, ArtifactInput, ArtifactNode, ArtifactOp, ArtifactPartition, CallOptions,
    Program, ProgramArtifact,
};
pub use remote::{RemoteWorker, RemoteWorkerOptions, RemoteWorkerStats};
pub use scheduler::{CancellationToken, ExecutionOptions};
pub use trace::{BackendKind, ExecutionTrace, NodeRecord};
pub use tracing_mutex::TracingMutex;
pub use value::{
    BufferData, DeviceBuffer, DeviceHandle, DeviceId, Location, NodeId, SimValue, Value,
    ValueBuffer, ValueId,
};
