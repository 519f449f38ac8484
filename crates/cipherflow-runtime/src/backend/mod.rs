// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Execution Backends
//!
//! Nodes run on one of three local strategies (CPU, accelerator, simulation) or on a
//! remote worker. The strategy is a tagged choice made per node from the context's
//! execution mode and the node's capability tag; there is no backend object hierarchy.

mod accelerator;
mod cpu;
mod simulation;

pub use accelerator::{
    AcceleratorBackend, AcceleratorDevice, AcceleratorStats, EmulatedDevice, SelectionPolicy,
};
pub use cpu::CpuBackend;
pub use simulation::{SimulationBackend, NOISE_MARGIN_WARNING};

use crate::error::RuntimeError;
use crate::graph::TaskNode;

/// Context-wide execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Real ciphertexts on the CPU worker pool
    #[default]
    Cpu,
    /// Real ciphertexts; eligible nodes offloaded to accelerator devices
    Accelerator,
    /// Approximate values, no key material
    Simulation,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Cpu => write!(f, "CPU"),
            ExecutionMode::Accelerator => write!(f, "Accelerator"),
            ExecutionMode::Simulation => write!(f, "Simulation"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(ExecutionMode::Cpu),
            "accelerator" | "gpu" => Ok(ExecutionMode::Accelerator),
            "simulation" | "sim" => Ok(ExecutionMode::Simulation),
            _ => Err(RuntimeError::Initialization(format!(
                "unknown execution mode '{}'",
                s
            ))),
        }
    }
}

/// Where a node will be dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTarget {
    Cpu,
    Accelerator,
    Simulation,
    Remote(usize),
}

/// Backend selection decision with rationale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDecision {
    pub target: BackendTarget,
    pub reason: &'static str,
}

/// Choose the backend for one node
///
/// Selection priority:
/// 1. Simulation mode runs everything in simulation
/// 2. Nodes assigned to a remote worker go there
/// 3. Accelerator-eligible nodes go to a device when one is available
/// 4. Everything else runs on the CPU
pub fn select_backend(
    node: &TaskNode,
    mode: ExecutionMode,
    devices_available: bool,
    remote_worker: Option<usize>,
) -> BackendDecision {
    if mode == ExecutionMode::Simulation {
        return BackendDecision {
            target: BackendTarget::Simulation,
            reason: "simulation mode",
        };
    }

    if let Some(worker) = remote_worker {
        return BackendDecision {
            target: BackendTarget::Remote(worker),
            reason: "assigned to remote worker",
        };
    }

    if mode == ExecutionMode::Accelerator {
        if !node.accelerator_eligible {
            return BackendDecision {
                target: BackendTarget::Cpu,
                reason: "node not accelerator-eligible",
            };
        }
        if !devices_available {
            return BackendDecision {
                target: BackendTarget::Cpu,
                reason: "no accelerator device available",
            };
        }
        return BackendDecision {
            target: BackendTarget::Accelerator,
            reason: "accelerator-eligible node",
        };
    }

    BackendDecision {
        target: BackendTarget::Cpu,
        reason: "CPU mode",
    }
}
