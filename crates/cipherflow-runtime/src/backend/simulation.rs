// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Simulation Backend
//!
//! Propagates a cleartext shadow and a noise-variance estimate through the graph instead
//! of ciphertexts. Needs no key material, so whole programs can be iterated on quickly.
//! Variances are squared torus fractions, the same unit as the partition's noise std devs.

use cipherflow_keys::Partition;
use tracing::warn;

use crate::error::RuntimeError;
use crate::graph::{OpKind, TaskNode};
use crate::primitives::check_lookup_table;
use crate::value::SimValue;

/// Warn when fewer standard deviations than this fit inside the decoding margin
pub const NOISE_MARGIN_WARNING: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationBackend;

impl SimulationBackend {
    pub fn new() -> Self {
        Self
    }

    /// Simulated value of a fresh encryption
    pub fn fresh(&self, partition: &Partition, message: u64) -> SimValue {
        SimValue::new(
            message % partition.plaintext_modulus(),
            partition.encryption_noise_std_dev().powi(2),
        )
    }

    /// Variance added by one keyswitch
    fn keyswitch_variance(partition: &Partition) -> f64 {
        partition.ks_level as f64 * partition.lwe_noise_std_dev.powi(2)
    }

    /// Distance to a decoding error, in standard deviations
    pub fn noise_margin(&self, value: &SimValue, partition: &Partition) -> f64 {
        let half_step = 0.5 / (2.0 * partition.plaintext_modulus() as f64);
        let std_dev = value.std_dev();
        if std_dev == 0.0 {
            f64::INFINITY
        } else {
            half_step / std_dev
        }
    }

    /// Execute one node on simulated inputs
    pub fn execute(
        &self,
        node: &TaskNode,
        inputs: &[SimValue],
        partition: &Partition,
        input_partition: &Partition,
    ) -> Result<SimValue, RuntimeError> {
        if inputs.len() != node.op.arity() {
            return Err(RuntimeError::NodeExecution {
                node: node.id,
                reason: format!(
                    "{} takes {} inputs, got {}",
                    node.op.name(),
                    node.op.arity(),
                    inputs.len()
                ),
            });
        }

        let modulus = partition.plaintext_modulus();
        let out = match &node.op {
            OpKind::Add => SimValue::new(
                inputs[0].shadow.wrapping_add(inputs[1].shadow) % modulus,
                inputs[0].variance + inputs[1].variance,
            ),
            OpKind::Sub => SimValue::new(
                (inputs[0].shadow % modulus + modulus - inputs[1].shadow % modulus) % modulus,
                inputs[0].variance + inputs[1].variance,
            ),
            OpKind::Neg => SimValue::new(
                (modulus - inputs[0].shadow % modulus) % modulus,
                inputs[0].variance,
            ),
            OpKind::AddPlain(constant) => SimValue::new(
                inputs[0].shadow.wrapping_add(*constant) % modulus,
                inputs[0].variance,
            ),
            OpKind::MulPlain(constant) => SimValue::new(
                inputs[0].shadow.wrapping_mul(*constant) % modulus,
                inputs[0].variance * (*constant as f64).powi(2),
            ),
            OpKind::ApplyLookupTable(table) => {
                check_lookup_table(table, partition).map_err(|e| RuntimeError::NodeExecution {
                    node: node.id,
                    reason: e.to_string(),
                })?;
                let entry = table[(inputs[0].shadow % table.len() as u64) as usize];
                // Bootstrapping resets the noise
                SimValue::new(
                    entry % modulus,
                    partition.encryption_noise_std_dev().powi(2)
                        + Self::keyswitch_variance(partition),
                )
            }
            OpKind::ChangePartition { .. } => SimValue::new(
                inputs[0].shadow % modulus,
                inputs[0].variance + Self::keyswitch_variance(input_partition),
            ),
            OpKind::Identity => inputs[0],
        };

        let margin = self.noise_margin(&out, partition);
        if margin < NOISE_MARGIN_WARNING {
            warn!(
                node = %node.id,
                op = node.op.name(),
                margin,
                "Simulated noise close to decoding bound"
            );
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NodeId, ValueId};
    use cipherflow_keys::PartitionId;

    fn partition() -> Partition {
        Partition::builder("P", 1, 1, 1024).build().unwrap()
    }

    fn run(op: OpKind, inputs: &[SimValue]) -> SimValue {
        let p = partition();
        let ids = (0..op.arity() as u32).map(ValueId).collect();
        let node = TaskNode::new(0, op, ids, ValueId(9), PartitionId(0));
        SimulationBackend.execute(&node, inputs, &p, &p).unwrap()
    }

    #[test]
    fn test_shadow_arithmetic_matches_modular_semantics() {
        let sim = SimulationBackend::new();
        let p = partition();
        let a = sim.fresh(&p, 5);
        let b = sim.fresh(&p, 9);

        assert_eq!(run(OpKind::Add, &[a, b]).shadow, 14);
        assert_eq!(run(OpKind::Sub, &[a, b]).shadow, 12);
        assert_eq!(run(OpKind::Neg, &[a]).shadow, 11);
        assert_eq!(run(OpKind::MulPlain(3), &[a]).shadow, 15);
        assert_eq!(run(OpKind::AddPlain(12), &[a]).shadow, 1);
    }

    #[test]
    fn test_variance_propagation() {
        let sim = SimulationBackend::new();
        let p = partition();
        let a = sim.fresh(&p, 1);

        let sum = run(OpKind::Add, &[a, a]);
        assert_eq!(sum.variance, 2.0 * a.variance);

        let scaled = run(OpKind::MulPlain(4), &[a]);
        assert_eq!(scaled.variance, 16.0 * a.variance);

        let table: Vec<u64> = (0..16).collect();
        let refreshed = run(OpKind::ApplyLookupTable(table.clone()), &[scaled]);
        // Bootstrapped noise does not depend on the input noise
        assert_eq!(refreshed.variance, run(OpKind::ApplyLookupTable(table), &[a]).variance);
        assert!(sim.noise_margin(&refreshed, &p) > NOISE_MARGIN_WARNING);
    }

    #[test]
    fn test_lookup_table_length_matches_primitives() {
        let p = partition();
        let a = SimulationBackend.fresh(&p, 6);
        let node = |table: Vec<u64>| {
            TaskNode::new(
                0,
                OpKind::ApplyLookupTable(table),
                vec![ValueId(0)],
                ValueId(9),
                PartitionId(0),
            )
        };

        // Message-space table: 6 mod 4 selects entry 2
        let out = SimulationBackend.execute(&node(vec![10, 11, 12, 13]), &[a], &p, &p).unwrap();
        assert_eq!(out.shadow, 12);

        for bad in [vec![], vec![1, 2, 3], vec![0; 7]] {
            assert!(matches!(
                SimulationBackend.execute(&node(bad), &[a], &p, &p),
                Err(RuntimeError::NodeExecution { node: NodeId(0), .. })
            ));
        }
    }
}
