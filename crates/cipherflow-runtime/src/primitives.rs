// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Primitive Operations
//!
//! [`Primitives`] is the seam to the cryptographic primitive library: the runtime decides
//! when, where and with which keys an operation runs, and delegates the arithmetic here.
//!
//! [`ReferencePrimitives`] implements every operation kind on LWE ciphertexts. Linear
//! operations work directly on the ciphertext words. Lookup tables and partition changes
//! are computed by decrypting with the bound key set and re-encrypting, which makes the
//! results exact but offers no security; it exists for tests and the emulated device.

use cipherflow_keys::{fnv1a, Ciphertext, KeySet, Partition};

use crate::error::PrimitiveError;
use crate::graph::OpKind;
use crate::value::NodeId;

/// Key sets bound to one operation
#[derive(Debug, Clone, Copy)]
pub struct OpKeys<'a> {
    /// Keys of the node's (output) partition
    pub output: &'a KeySet,
    /// Keys of the source partition for `ChangePartition`
    pub input: Option<&'a KeySet>,
}

/// Executes one primitive operation on ciphertexts
pub trait Primitives: Send + Sync {
    /// Implementation name for logging
    fn name(&self) -> &str;

    /// Run `op` on `inputs` with the bound keys
    ///
    /// Must be a pure function of its arguments; `nonce` seeds any fresh encryption.
    fn execute(
        &self,
        op: &OpKind,
        inputs: &[&[u64]],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<Ciphertext, PrimitiveError>;
}

/// Deterministic nonce for a node execution, derived from the node id and its inputs
pub fn node_nonce(node: NodeId, inputs: &[&[u64]]) -> u64 {
    let mut bytes = Vec::with_capacity(4 + inputs.iter().map(|i| i.len() * 8).sum::<usize>());
    bytes.extend_from_slice(&node.0.to_le_bytes());
    for input in inputs {
        for word in input.iter() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
    }
    fnv1a(&bytes)
}

/// A lookup table covers either the full plaintext space or the message space
pub(crate) fn check_lookup_table(
    table: &[u64],
    partition: &Partition,
) -> Result<(), PrimitiveError> {
    let len = table.len() as u64;
    let modulus = partition.plaintext_modulus();
    if len == 0 || (len != modulus && len != partition.message_modulus) {
        return Err(PrimitiveError::LookupTable {
            len: table.len(),
            modulus,
        });
    }
    Ok(())
}

/// Noiseless encryption of a cleartext: zero mask, encoded body
pub fn trivial_ciphertext(partition: &Partition, message: u64) -> Ciphertext {
    let mut ciphertext = vec![0u64; partition.ciphertext_len()];
    let modulus = partition.plaintext_modulus().max(1);
    if let Some(body) = ciphertext.last_mut() {
        *body = (message % modulus).wrapping_mul(partition.delta());
    }
    ciphertext
}

/// Exact reference implementation of every operation kind
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferencePrimitives;

impl ReferencePrimitives {
    fn check_shapes(inputs: &[&[u64]], expected: usize) -> Result<(), PrimitiveError> {
        for input in inputs {
            if input.len() != expected {
                return Err(PrimitiveError::Shape {
                    expected,
                    actual: input.len(),
                });
            }
        }
        Ok(())
    }
}

impl Primitives for ReferencePrimitives {
    fn name(&self) -> &str {
        "reference-lwe"
    }

    fn execute(
        &self,
        op: &OpKind,
        inputs: &[&[u64]],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<Ciphertext, PrimitiveError> {
        if inputs.len() != op.arity() {
            return Err(PrimitiveError::Arity {
                op: op.name(),
                expected: op.arity(),
                actual: inputs.len(),
            });
        }

        let output_keys = keys.output;
        let partition = output_keys.partition();
        let source_keys = match op {
            OpKind::ChangePartition { .. } => {
                keys.input.ok_or(PrimitiveError::MissingKeys("source partition"))?
            }
            _ => output_keys,
        };
        Self::check_shapes(inputs, source_keys.partition().ciphertext_len())?;

        let ciphertext = match op {
            OpKind::Add => inputs[0]
                .iter()
                .zip(inputs[1])
                .map(|(a, b)| a.wrapping_add(*b))
                .collect(),
            OpKind::Sub => inputs[0]
                .iter()
                .zip(inputs[1])
                .map(|(a, b)| a.wrapping_sub(*b))
                .collect(),
            OpKind::Neg => inputs[0].iter().map(|a| a.wrapping_neg()).collect(),
            OpKind::AddPlain(constant) => {
                let mut ciphertext = inputs[0].to_vec();
                if let Some(body) = ciphertext.last_mut() {
                    *body = body.wrapping_add(output_keys.encode(*constant));
                }
                ciphertext
            }
            OpKind::MulPlain(constant) => inputs[0]
                .iter()
                .map(|a| a.wrapping_mul(*constant))
                .collect(),
            OpKind::ApplyLookupTable(table) => {
                let modulus = partition.plaintext_modulus();
                check_lookup_table(table, partition)?;
                let len = table.len() as u64;
                let message = output_keys.decrypt(inputs[0])?;
                let entry = table[(message % len) as usize];
                output_keys.encrypt(entry % modulus, nonce)
            }
            OpKind::ChangePartition { .. } => {
                let message = source_keys.decrypt(inputs[0])?;
                output_keys.encrypt(message % partition.plaintext_modulus(), nonce)
            }
            OpKind::Identity => inputs[0].to_vec(),
        };

        Ok(ciphertext)
    }
}
