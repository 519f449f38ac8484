// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Compiled Programs
//!
//! A [`ProgramArtifact`] is the JSON form a compiler emits for one circuit: partitions
//! by name, program arguments, requested outputs and the node list. [`load_program`]
//! validates it once into a [`Program`] whose graph is re-instantiated on every call.

use ahash::AHashMap;
use cipherflow_keys::{EncryptionKeyChoice, Partition, PartitionId, PartitionRegistry};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::{ExecutionMode, SimulationBackend};
use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::graph::{OpKind, TaskGraph, TaskNode};
use crate::scheduler::{CancellationToken, ExecutionOptions};
use crate::trace::ExecutionTrace;
use crate::value::{NodeId, Value, ValueId};

/// Partition entry of an artifact; unset fields take the builder defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPartition {
    pub name: String,
    pub lwe_dim: usize,
    pub glwe_dim: usize,
    pub poly_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lwe_noise_std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glwe_noise_std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbs_decomposition: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ks_decomposition: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carry_modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_choice: Option<EncryptionKeyChoice>,
}

impl ArtifactPartition {
    pub fn new(name: impl Into<String>, lwe_dim: usize, glwe_dim: usize, poly_size: usize) -> Self {
        Self {
            name: name.into(),
            lwe_dim,
            glwe_dim,
            poly_size,
            lwe_noise_std_dev: None,
            glwe_noise_std_dev: None,
            pbs_decomposition: None,
            ks_decomposition: None,
            message_modulus: None,
            carry_modulus: None,
            encryption_key_choice: None,
        }
    }

    fn to_partition(&self) -> Result<Partition> {
        let mut builder =
            Partition::builder(self.name.clone(), self.lwe_dim, self.glwe_dim, self.poly_size);
        if let Some(std_dev) = self.lwe_noise_std_dev {
            builder = builder.lwe_noise_std_dev(std_dev);
        }
        if let Some(std_dev) = self.glwe_noise_std_dev {
            builder = builder.glwe_noise_std_dev(std_dev);
        }
        if let Some((base_log, level)) = self.pbs_decomposition {
            builder = builder.pbs_decomposition(base_log, level);
        }
        if let Some((base_log, level)) = self.ks_decomposition {
            builder = builder.ks_decomposition(base_log, level);
        }
        if let Some(modulus) = self.message_modulus {
            builder = builder.message_modulus(modulus);
        }
        if let Some(modulus) = self.carry_modulus {
            builder = builder.carry_modulus(modulus);
        }
        if let Some(choice) = self.encryption_key_choice {
            builder = builder.encryption_key_choice(choice);
        }
        Ok(builder.build()?)
    }
}

/// Operation of an artifact node; partitions are referenced by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactOp {
    Add,
    Sub,
    Neg,
    AddPlain { constant: u64 },
    MulPlain { constant: u64 },
    ApplyLookupTable { table: Vec<u64> },
    ChangePartition { from: String },
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInput {
    pub value: u32,
    pub partition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactNode {
    pub id: u32,
    pub op: ArtifactOp,
    pub inputs: Vec<u32>,
    pub output: u32,
    pub partition: String,
    /// Overrides the operation's default accelerator eligibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_eligible: Option<bool>,
}

/// Serialized compiled circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramArtifact {
    pub name: String,
    pub partitions: Vec<ArtifactPartition>,
    pub inputs: Vec<ArtifactInput>,
    pub outputs: Vec<u32>,
    pub nodes: Vec<ArtifactNode>,
}

impl ProgramArtifact {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RuntimeError::InvalidArtifact(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RuntimeError::InvalidArtifact(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::InvalidArtifact(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}

/// Validate an artifact into a callable program
pub fn load_program(artifact: &ProgramArtifact) -> Result<Program> {
    let mut partitions = PartitionRegistry::new();
    for partition in &artifact.partitions {
        partitions.register(partition.to_partition()?)?;
    }
    let resolve = |name: &str| -> Result<PartitionId> {
        partitions
            .id_of(name)
            .ok_or_else(|| RuntimeError::UnknownPartition(name.to_string()))
    };

    let mut nodes = Vec::with_capacity(artifact.nodes.len());
    for node in &artifact.nodes {
        let op = match &node.op {
            ArtifactOp::Add => OpKind::Add,
            ArtifactOp::Sub => OpKind::Sub,
            ArtifactOp::Neg => OpKind::Neg,
            ArtifactOp::AddPlain { constant } => OpKind::AddPlain(*constant),
            ArtifactOp::MulPlain { constant } => OpKind::MulPlain(*constant),
            ArtifactOp::ApplyLookupTable { table } => OpKind::ApplyLookupTable(table.clone()),
            ArtifactOp::ChangePartition { from } => OpKind::ChangePartition {
                from: resolve(from)?,
            },
            ArtifactOp::Identity => OpKind::Identity,
        };
        let mut task = TaskNode::new(
            node.id,
            op,
            node.inputs.iter().copied().map(ValueId).collect(),
            ValueId(node.output),
            resolve(&node.partition)?,
        );
        if let Some(eligible) = node.accelerator_eligible {
            task = task.with_accelerator_eligible(eligible);
        }
        nodes.push(task);
    }

    let inputs = artifact
        .inputs
        .iter()
        .map(|input| Ok((ValueId(input.value), resolve(&input.partition)?)))
        .collect::<Result<Vec<_>>>()?;
    let graph = TaskGraph::new(nodes, inputs.clone())?;

    let outputs: Vec<ValueId> = artifact.outputs.iter().copied().map(ValueId).collect();
    if outputs.is_empty() {
        return Err(RuntimeError::InvalidArtifact(format!(
            "program '{}' requests no outputs",
            artifact.name
        )));
    }
    for &output in &outputs {
        if graph.value_slot(output).is_none() {
            return Err(RuntimeError::UnknownValue(output));
        }
    }

    info!(
        program = %artifact.name,
        nodes = graph.len(),
        partitions = partitions.len(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        "Program loaded"
    );

    Ok(Program {
        name: artifact.name.clone(),
        partitions,
        graph,
        inputs,
        outputs,
    })
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Subset of values to return instead of the program outputs
    pub outputs: Option<Vec<ValueId>>,
    /// Overrides the context's deterministic order setting
    pub deterministic_order: Option<bool>,
    pub remote_assignment: AHashMap<NodeId, usize>,
    /// Defaults to a token linked to the context
    pub cancellation: Option<CancellationToken>,
}

/// Loaded program; immutable and callable any number of times
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    partitions: PartitionRegistry,
    graph: TaskGraph,
    inputs: Vec<(ValueId, PartitionId)>,
    outputs: Vec<ValueId>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn partitions(&self) -> &PartitionRegistry {
        &self.partitions
    }

    pub fn partition(&self, name: &str) -> Option<&Arc<Partition>> {
        self.partitions.get_by_name(name)
    }

    pub fn inputs(&self) -> &[(ValueId, PartitionId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Run the program; inputs are positional, outputs follow the artifact order
    pub fn call(&self, ctx: &Context, inputs: Vec<Value>) -> Result<Vec<Value>> {
        self.call_traced(ctx, inputs).0
    }

    pub fn call_traced(&self, ctx: &Context, inputs: Vec<Value>) -> (Result<Vec<Value>>, ExecutionTrace) {
        self.call_with(ctx, inputs, CallOptions::default())
    }

    pub fn call_with(
        &self,
        ctx: &Context,
        inputs: Vec<Value>,
        options: CallOptions,
    ) -> (Result<Vec<Value>>, ExecutionTrace) {
        if inputs.len() != self.inputs.len() {
            return (
                Err(RuntimeError::BufferShapeMismatch {
                    what: format!("inputs of program '{}'", self.name),
                    expected: self.inputs.len(),
                    actual: inputs.len(),
                }),
                ExecutionTrace::default(),
            );
        }
        for &worker in options.remote_assignment.values() {
            if worker >= ctx.remote_count() {
                return (
                    Err(RuntimeError::Remote {
                        worker,
                        reason: "no such remote worker".to_string(),
                    }),
                    ExecutionTrace::default(),
                );
            }
        }

        let requested = options.outputs.unwrap_or_else(|| self.outputs.clone());
        let arguments = self
            .inputs
            .iter()
            .map(|&(value, _)| value)
            .zip(inputs)
            .collect();
        let execution = ExecutionOptions {
            requested_outputs: requested.clone(),
            deterministic_order: options
                .deterministic_order
                .unwrap_or(ctx.options().deterministic_order),
            elide_dead_nodes: ctx.options().elide_dead_nodes,
            remote_assignment: options.remote_assignment,
        };
        let cancel = options
            .cancellation
            .unwrap_or_else(|| ctx.cancellation_token());

        let (result, trace) = ctx.execute(&self.graph, &self.partitions, arguments, &execution, cancel);
        let result = result.and_then(|mut values| {
            requested
                .iter()
                .map(|value| values.remove(value).ok_or(RuntimeError::UnknownValue(*value)))
                .collect()
        });
        (result, trace)
    }

    /// Encrypt cleartext arguments under the context's keys
    ///
    /// In simulation mode the values are fresh simulated encryptions instead.
    pub fn encrypt_inputs(&self, ctx: &Context, messages: &[u64]) -> Result<Vec<Value>> {
        if messages.len() != self.inputs.len() {
            return Err(RuntimeError::BufferShapeMismatch {
                what: format!("inputs of program '{}'", self.name),
                expected: self.inputs.len(),
                actual: messages.len(),
            });
        }
        self.inputs
            .iter()
            .zip(messages)
            .enumerate()
            .map(|(index, (&(_, partition_id), &message))| {
                let partition = self.partition_by_id(partition_id)?;
                if ctx.mode() == ExecutionMode::Simulation {
                    Ok(Value::Simulated(SimulationBackend::new().fresh(partition, message)))
                } else {
                    let keys = ctx.key_set(partition)?;
                    Ok(Value::Ciphertext(keys.encrypt(message, index as u64)))
                }
            })
            .collect()
    }

    /// Decrypt values returned for the program outputs
    pub fn decrypt_outputs(&self, ctx: &Context, values: &[Value]) -> Result<Vec<u64>> {
        if values.len() != self.outputs.len() {
            return Err(RuntimeError::BufferShapeMismatch {
                what: format!("outputs of program '{}'", self.name),
                expected: self.outputs.len(),
                actual: values.len(),
            });
        }
        self.outputs
            .iter()
            .zip(values)
            .map(|(&output, value)| self.decrypt_value(ctx, output, value))
            .collect()
    }

    /// Decrypt one value of the graph
    pub fn decrypt_value(&self, ctx: &Context, value_id: ValueId, value: &Value) -> Result<u64> {
        let slot = self
            .graph
            .value_slot(value_id)
            .ok_or(RuntimeError::UnknownValue(value_id))?;
        let partition = self.partition_by_id(self.graph.slot_partition(slot))?;
        match value {
            Value::Ciphertext(ciphertext) => Ok(ctx.key_set(partition)?.decrypt(ciphertext)?),
            Value::Simulated(simulated) => Ok(simulated.shadow % partition.plaintext_modulus()),
            Value::Cleartext(message) => Ok(message % partition.plaintext_modulus()),
        }
    }

    fn partition_by_id(&self, id: PartitionId) -> Result<&Arc<Partition>> {
        self.partitions
            .get(id)
            .ok_or_else(|| RuntimeError::UnknownPartition(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;

    fn node(id: u32, op: ArtifactOp, inputs: Vec<u32>, output: u32) -> ArtifactNode {
        ArtifactNode {
            id,
            op,
            inputs,
            output,
            partition: "P".to_string(),
            accelerator_eligible: None,
        }
    }

    /// out = (a + b) * 2, with an unused negation of `a`
    fn artifact() -> ProgramArtifact {
        ProgramArtifact {
            name: "double_sum".to_string(),
            partitions: vec![ArtifactPartition::new("P", 1, 1, 256)],
            inputs: vec![
                ArtifactInput { value: 0, partition: "P".to_string() },
                ArtifactInput { value: 1, partition: "P".to_string() },
            ],
            outputs: vec![3],
            nodes: vec![
                node(0, ArtifactOp::Add, vec![0, 1], 2),
                node(1, ArtifactOp::MulPlain { constant: 2 }, vec![2], 3),
                node(2, ArtifactOp::Neg, vec![0], 4),
            ],
        }
    }

    #[test]
    fn test_artifact_json_format() {
        let json = artifact().to_json().unwrap();
        assert!(json.contains("\"kind\": \"mul_plain\""));
        assert!(json.contains("\"constant\": 2"));
        assert!(!json.contains("accelerator_eligible"));
        assert_eq!(ProgramArtifact::from_json(&json).unwrap(), artifact());

        let err = ProgramArtifact::from_json("{\"name\": 1}").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArtifact(_)));
    }

    #[test]
    fn test_call_encrypted_program() {
        let program = load_program(&artifact()).unwrap();
        let ctx = Context::create(ContextOptions {
            parallelism: 2,
            deterministic_order: true,
            ..ContextOptions::default()
        })
        .unwrap();

        let inputs = program.encrypt_inputs(&ctx, &[3, 2]).unwrap();
        let (result, trace) = program.call_traced(&ctx, inputs);
        let outputs = result.unwrap();
        assert_eq!(program.decrypt_outputs(&ctx, &outputs).unwrap(), vec![10]);
        assert_eq!(trace.started, vec![NodeId(0), NodeId(1)]);
        assert_eq!(trace.elided, vec![NodeId(2)]);
    }

    #[test]
    fn test_call_with_intermediate_output() {
        let program = load_program(&artifact()).unwrap();
        let ctx = Context::create(ContextOptions::default()).unwrap();

        let inputs = program.encrypt_inputs(&ctx, &[5, 1]).unwrap();
        let (result, trace) = program.call_with(
            &ctx,
            inputs,
            CallOptions {
                outputs: Some(vec![ValueId(2), ValueId(4)]),
                ..CallOptions::default()
            },
        );
        let values = result.unwrap();
        assert_eq!(program.decrypt_value(&ctx, ValueId(2), &values[0]).unwrap(), 6);
        // -5 mod 16
        assert_eq!(program.decrypt_value(&ctx, ValueId(4), &values[1]).unwrap(), 11);
        assert_eq!(trace.elided, vec![NodeId(1)]);
    }

    #[test]
    fn test_simulation_inputs() {
        let program = load_program(&artifact()).unwrap();
        let ctx = Context::create(ContextOptions {
            enable_simulation: true,
            ..ContextOptions::default()
        })
        .unwrap();

        let inputs = program.encrypt_inputs(&ctx, &[4, 3]).unwrap();
        assert!(inputs.iter().all(|value| value.as_simulated().is_some()));
        let outputs = program.call(&ctx, inputs).unwrap();
        assert_eq!(program.decrypt_outputs(&ctx, &outputs).unwrap(), vec![14]);
        assert!(ctx.key_manager().is_empty());
    }

    #[test]
    fn test_load_rejects_invalid_artifacts() {
        let mut unknown = artifact();
        unknown.nodes[0].partition = "Q".to_string();
        assert_eq!(
            load_program(&unknown).unwrap_err(),
            RuntimeError::UnknownPartition("Q".to_string())
        );

        let mut cyclic = artifact();
        cyclic.nodes[0].inputs = vec![0, 3];
        assert!(matches!(
            load_program(&cyclic),
            Err(RuntimeError::InvalidGraph(_))
        ));

        let mut no_outputs = artifact();
        no_outputs.outputs.clear();
        assert!(matches!(
            load_program(&no_outputs),
            Err(RuntimeError::InvalidArtifact(_))
        ));

        let mut bad_partition = artifact();
        bad_partition.partitions[0].poly_size = 100;
        assert!(matches!(
            load_program(&bad_partition),
            Err(RuntimeError::InvalidPartition { .. })
        ));
    }

    #[test]
    fn test_input_count_mismatch() {
        let program = load_program(&artifact()).unwrap();
        let ctx = Context::create(ContextOptions::default()).unwrap();
        let err = program.call(&ctx, vec![Value::Cleartext(1)]).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::BufferShapeMismatch {
                what: "inputs of program 'double_sum'".to_string(),
                expected: 2,
                actual: 1,
            }
        );
    }
}
