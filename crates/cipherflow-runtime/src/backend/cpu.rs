// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # CPU Backend
//!
//! Runs primitives on the calling worker thread. Wraps the configured primitive
//! implementation and converts its failures into node-level errors.

use cipherflow_keys::Ciphertext;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::graph::TaskNode;
use crate::primitives::{OpKeys, Primitives, ReferencePrimitives};

/// CPU backend over a primitive library
#[derive(Clone)]
pub struct CpuBackend {
    primitives: Arc<dyn Primitives>,
}

impl CpuBackend {
    pub fn new(primitives: Arc<dyn Primitives>) -> Self {
        Self { primitives }
    }

    pub fn backend_name(&self) -> &str {
        self.primitives.name()
    }

    pub fn primitives(&self) -> &Arc<dyn Primitives> {
        &self.primitives
    }

    /// Execute one node on host ciphertexts
    pub fn execute(
        &self,
        node: &TaskNode,
        inputs: &[&[u64]],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<Ciphertext, RuntimeError> {
        self.primitives
            .execute(&node.op, inputs, keys, nonce)
            .map_err(|e| RuntimeError::NodeExecution {
                node: node.id,
                reason: format!("{} ({})", e, node.op.name()),
            })
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new(Arc::new(ReferencePrimitives))
    }
}

impl std::fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBackend")
            .field("primitives", &self.primitives.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::value::{NodeId, ValueId};
    use cipherflow_keys::{KeySeed, KeySet, Partition, PartitionId};

    #[test]
    fn test_primitive_failure_becomes_node_error() {
        let partition = Arc::new(Partition::builder("P", 1, 1, 256).build().unwrap());
        let keys = KeySet::generate(partition, KeySeed::default()).unwrap();
        let node = TaskNode::new(
            4,
            OpKind::ApplyLookupTable(vec![0; 5]),
            vec![ValueId(0)],
            ValueId(1),
            PartitionId(0),
        );
        let input = keys.encrypt(1, 0);

        let backend = CpuBackend::default();
        let result = backend.execute(
            &node,
            &[input.as_slice()],
            &OpKeys {
                output: &keys,
                input: None,
            },
            0,
        );
        match result {
            Err(RuntimeError::NodeExecution { node, reason }) => {
                assert_eq!(node, NodeId(4));
                assert!(reason.contains("apply_lookup_table"));
            }
            other => panic!("expected node failure, got {:?}", other),
        }
        assert_eq!(backend.backend_name(), "reference-lwe");
    }
}
