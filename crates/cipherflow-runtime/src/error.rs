// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Runtime error taxonomy
//!
//! Node-level failures are captured at the node boundary and surface to callers as
//! [`RuntimeError::GraphCancelled`] carrying the original cause.

use cipherflow_keys::KeyError;
use thiserror::Error;

use crate::value::{DeviceId, NodeId, ValueId};

/// Accelerator device failures
///
/// Recoverable through CPU fallback when the context allows it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device {device} out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        available: usize,
    },

    #[error("Device {device} has no buffer {handle}")]
    InvalidHandle { device: DeviceId, handle: u64 },

    #[error("Device {device} faulted: {reason}")]
    Faulted { device: DeviceId, reason: String },

    #[error("Device {device} kernel failed: {reason}")]
    Kernel { device: DeviceId, reason: String },

    #[error("No accelerator device available")]
    NoDevice,
}

/// Failures inside a primitive operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrimitiveError {
    #[error("Operation {op} takes {expected} inputs, got {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Ciphertext has {actual} words, expected {expected}")]
    Shape { expected: usize, actual: usize },

    #[error("Lookup table of {len} entries does not fit plaintext modulus {modulus}")]
    LookupTable { len: usize, modulus: u64 },

    #[error("Missing key set for {0}")]
    MissingKeys(&'static str),

    #[error("Expected {expected} input, got {actual}")]
    ValueKind {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Runtime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Invalid partition '{partition}': {reason}")]
    InvalidPartition { partition: String, reason: String },

    #[error("Key generation failed for partition '{partition}': {reason}")]
    KeyGeneration { partition: String, reason: String },

    #[error("Buffer shape mismatch for {what}: expected {expected}, got {actual}")]
    BufferShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Value {value} must be a {expected} value, got {actual}")]
    ValueKind {
        value: ValueId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Node {node} failed: {reason}")]
    NodeExecution { node: NodeId, reason: String },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Graph cancelled after {skipped} unstarted nodes were skipped: {cause}")]
    GraphCancelled {
        cause: Box<RuntimeError>,
        failed_node: Option<NodeId>,
        skipped: usize,
    },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Value {0} is neither produced nor a program argument")]
    UnknownValue(ValueId),

    #[error("No value supplied for program argument {0}")]
    MissingArgument(ValueId),

    #[error("Invalid program artifact: {0}")]
    InvalidArtifact(String),

    #[error("Remote worker {worker} error: {reason}")]
    Remote { worker: usize, reason: String },

    #[error("Context is shut down")]
    ContextShutDown,

    #[error("Runtime initialization failed: {0}")]
    Initialization(String),
}

impl RuntimeError {
    /// Innermost cause, looking through graph cancellation
    pub fn root_cause(&self) -> &RuntimeError {
        match self {
            RuntimeError::GraphCancelled { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Whether CPU fallback may recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RuntimeError::Device(_))
    }
}

impl From<KeyError> for RuntimeError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidPartition { partition, reason } => {
                RuntimeError::InvalidPartition { partition, reason }
            }
            KeyError::KeyGeneration { partition, reason } => {
                RuntimeError::KeyGeneration { partition, reason }
            }
            KeyError::UnknownPartition(name) => RuntimeError::UnknownPartition(name),
            KeyError::CiphertextShape {
                partition,
                expected,
                actual,
            } => RuntimeError::BufferShapeMismatch {
                what: format!("ciphertext of partition '{}'", partition),
                expected,
                actual,
            },
            KeyError::Blob(blob) => RuntimeError::KeyGeneration {
                partition: String::new(),
                reason: blob.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_cancellation() {
        let err = RuntimeError::GraphCancelled {
            cause: Box::new(RuntimeError::NodeExecution {
                node: NodeId(3),
                reason: "boom".to_string(),
            }),
            failed_node: Some(NodeId(3)),
            skipped: 2,
        };
        assert!(matches!(
            err.root_cause(),
            RuntimeError::NodeExecution { node: NodeId(3), .. }
        ));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_key_error_conversion() {
        let err: RuntimeError = KeyError::InvalidPartition {
            partition: "P".to_string(),
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(
            err,
            RuntimeError::InvalidPartition {
                partition: "P".to_string(),
                reason: "bad".to_string()
            }
        );

        let err: RuntimeError = KeyError::CiphertextShape {
            partition: "P".to_string(),
            expected: 5,
            actual: 4,
        }
        .into();
        assert!(matches!(
            err,
            RuntimeError::BufferShapeMismatch {
                expected: 5,
                actual: 4,
                ..
            }
        ));
    }
}
