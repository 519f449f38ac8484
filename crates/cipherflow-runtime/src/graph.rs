// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Task Graph
//!
//! Immutable DAG of homomorphic operations. Built and validated once per compiled
//! circuit, then instantiated with fresh buffers on every invocation.
//!
//! Values are mapped to dense slots at construction so the buffer arena and the
//! scheduler work on plain indices.

use ahash::AHashMap;
use cipherflow_keys::PartitionId;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{Result, RuntimeError};
use crate::value::{NodeId, ValueId};

/// Primitive operation kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Add,
    Sub,
    Neg,
    AddPlain(u64),
    MulPlain(u64),
    /// Programmable bootstrap followed by keyswitch
    ApplyLookupTable(Vec<u64>),
    /// Keyswitch from another partition into the node's partition
    ChangePartition { from: PartitionId },
    Identity,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Neg => "neg",
            OpKind::AddPlain(_) => "add_plain",
            OpKind::MulPlain(_) => "mul_plain",
            OpKind::ApplyLookupTable(_) => "apply_lookup_table",
            OpKind::ChangePartition { .. } => "change_partition",
            OpKind::Identity => "identity",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            OpKind::Add | OpKind::Sub => 2,
            _ => 1,
        }
    }

    /// Whether nodes of this kind run on accelerators unless tagged otherwise
    pub fn default_accelerator_eligible(&self) -> bool {
        !matches!(self, OpKind::ChangePartition { .. } | OpKind::Identity)
    }
}

/// One homomorphic operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    pub op: OpKind,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
    /// Partition of the output (and of the inputs, except for `ChangePartition`)
    pub partition: PartitionId,
    pub accelerator_eligible: bool,
}

impl TaskNode {
    pub fn new(
        id: u32,
        op: OpKind,
        inputs: Vec<ValueId>,
        output: ValueId,
        partition: PartitionId,
    ) -> Self {
        let accelerator_eligible = op.default_accelerator_eligible();
        Self {
            id: NodeId(id),
            op,
            inputs,
            output,
            partition,
            accelerator_eligible,
        }
    }

    pub fn with_accelerator_eligible(mut self, eligible: bool) -> Self {
        self.accelerator_eligible = eligible;
        self
    }

    /// Partition every input must belong to
    pub fn input_partition(&self) -> PartitionId {
        match self.op {
            OpKind::ChangePartition { from } => from,
            _ => self.partition,
        }
    }
}

/// Validated task graph
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Sorted by id; position is the node index
    nodes: Vec<TaskNode>,
    index: AHashMap<NodeId, usize>,
    arguments: Vec<(ValueId, PartitionId)>,
    value_slots: AHashMap<ValueId, usize>,
    slot_values: Vec<ValueId>,
    slot_partitions: Vec<PartitionId>,
    /// Producing node index per slot; `None` for program arguments
    producers: Vec<Option<usize>>,
    input_slots: Vec<Vec<usize>>,
    output_slots: Vec<usize>,
    /// Consumer node index per input edge of the producer's output
    dependents: Vec<Vec<usize>>,
    dependency_counts: Vec<usize>,
}

impl TaskGraph {
    /// Validate and index a set of nodes and program arguments
    ///
    /// Rejects duplicate node ids, wrong arities, values with more than one producer,
    /// inputs that are neither produced nor arguments, partition mismatches along edges,
    /// and cycles.
    pub fn new(mut nodes: Vec<TaskNode>, arguments: Vec<(ValueId, PartitionId)>) -> Result<Self> {
        nodes.sort_by_key(|node| node.id);

        let mut index = AHashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if index.insert(node.id, position).is_some() {
                return Err(RuntimeError::InvalidGraph(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            if node.inputs.len() != node.op.arity() {
                return Err(RuntimeError::InvalidGraph(format!(
                    "node {} ({}) has {} inputs, expected {}",
                    node.id,
                    node.op.name(),
                    node.inputs.len(),
                    node.op.arity()
                )));
            }
        }

        let mut value_slots = AHashMap::new();
        let mut slot_values = Vec::new();
        let mut slot_partitions = Vec::new();
        let mut producers: Vec<Option<usize>> = Vec::new();

        for &(value, partition) in &arguments {
            if value_slots.contains_key(&value) {
                return Err(RuntimeError::InvalidGraph(format!(
                    "argument {} declared twice",
                    value
                )));
            }
            value_slots.insert(value, slot_values.len());
            slot_values.push(value);
            slot_partitions.push(partition);
            producers.push(None);
        }

        let mut output_slots = Vec::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if let Some(&slot) = value_slots.get(&node.output) {
                let existing = match producers[slot] {
                    Some(producer) => format!("node {}", nodes[producer].id),
                    None => "a program argument".to_string(),
                };
                return Err(RuntimeError::InvalidGraph(format!(
                    "value {} produced by node {} is already produced by {}",
                    node.output, node.id, existing
                )));
            }
            let slot = slot_values.len();
            value_slots.insert(node.output, slot);
            slot_values.push(node.output);
            slot_partitions.push(node.partition);
            producers.push(Some(position));
            output_slots.push(slot);
        }

        let mut input_slots = Vec::with_capacity(nodes.len());
        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut dependency_counts = vec![0usize; nodes.len()];
        for (position, node) in nodes.iter().enumerate() {
            let mut slots = Vec::with_capacity(node.inputs.len());
            for &input in &node.inputs {
                let slot = *value_slots
                    .get(&input)
                    .ok_or(RuntimeError::UnknownValue(input))?;
                if slot_partitions[slot] != node.input_partition() {
                    return Err(RuntimeError::InvalidGraph(format!(
                        "node {} reads {} from {} but expects {}",
                        node.id,
                        input,
                        slot_partitions[slot],
                        node.input_partition()
                    )));
                }
                if let Some(producer) = producers[slot] {
                    dependents[producer].push(position);
                    dependency_counts[position] += 1;
                }
                slots.push(slot);
            }
            input_slots.push(slots);
        }

        let graph = Self {
            nodes,
            index,
            arguments,
            value_slots,
            slot_values,
            slot_partitions,
            producers,
            input_slots,
            output_slots,
            dependents,
            dependency_counts,
        };

        let all = vec![true; graph.len()];
        if graph.dispatch_order(&all).len() != graph.len() {
            return Err(RuntimeError::InvalidGraph(
                "graph contains a cycle".to_string(),
            ));
        }

        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &TaskNode {
        &self.nodes[index]
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&TaskNode> {
        self.index.get(&id).map(|&index| &self.nodes[index])
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn arguments(&self) -> &[(ValueId, PartitionId)] {
        &self.arguments
    }

    pub fn value_count(&self) -> usize {
        self.slot_values.len()
    }

    pub fn value_slot(&self, value: ValueId) -> Option<usize> {
        self.value_slots.get(&value).copied()
    }

    pub fn slot_value(&self, slot: usize) -> ValueId {
        self.slot_values[slot]
    }

    pub fn slot_partition(&self, slot: usize) -> PartitionId {
        self.slot_partitions[slot]
    }

    pub fn producer(&self, slot: usize) -> Option<usize> {
        self.producers[slot]
    }

    pub fn input_slots(&self, index: usize) -> &[usize] {
        &self.input_slots[index]
    }

    pub fn output_slot(&self, index: usize) -> usize {
        self.output_slots[index]
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Unresolved produced-input count of a node at load time
    pub fn dependency_count(&self, index: usize) -> usize {
        self.dependency_counts[index]
    }

    /// Nodes contributing to any of the requested value slots
    pub fn live_nodes(&self, requested_slots: &[usize]) -> Vec<bool> {
        let mut live = vec![false; self.len()];
        let mut stack: Vec<usize> = requested_slots
            .iter()
            .filter_map(|&slot| self.producers[slot])
            .collect();
        while let Some(index) = stack.pop() {
            if live[index] {
                continue;
            }
            live[index] = true;
            for &slot in &self.input_slots[index] {
                if let Some(producer) = self.producers[slot] {
                    if !live[producer] {
                        stack.push(producer);
                    }
                }
            }
        }
        live
    }

    /// Kahn topological order over `live` nodes, lowest ready node id first
    pub fn dispatch_order(&self, live: &[bool]) -> Vec<usize> {
        let mut pending = self.dependency_counts.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..self.len())
            .filter(|&index| live[index] && pending[index] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &self.dependents[index] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 && live[dependent] {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: PartitionId = PartitionId(0);

    fn diamond() -> TaskGraph {
        // a, b -> n0:add -> v10; a -> n1:neg -> v11; v10, v11 -> n2:sub -> v12
        TaskGraph::new(
            vec![
                TaskNode::new(2, OpKind::Sub, vec![ValueId(10), ValueId(11)], ValueId(12), P),
                TaskNode::new(0, OpKind::Add, vec![ValueId(0), ValueId(1)], ValueId(10), P),
                TaskNode::new(1, OpKind::Neg, vec![ValueId(0)], ValueId(11), P),
            ],
            vec![(ValueId(0), P), (ValueId(1), P)],
        )
        .unwrap()
    }

    #[test]
    fn test_nodes_sorted_and_counted() {
        let graph = diamond();
        let ids: Vec<u32> = graph.nodes().iter().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(graph.dependency_count(0), 0);
        assert_eq!(graph.dependency_count(2), 2);
        assert_eq!(graph.dependents(0), &[2]);
        assert_eq!(graph.value_count(), 5);
    }

    #[test]
    fn test_dispatch_order_is_min_id_kahn() {
        let graph = diamond();
        assert_eq!(graph.dispatch_order(&[true, true, true]), vec![0, 1, 2]);
    }

    #[test]
    fn test_live_nodes_skip_unused_branch() {
        let graph = diamond();
        let v11 = graph.value_slot(ValueId(11)).unwrap();
        assert_eq!(graph.live_nodes(&[v11]), vec![false, true, false]);

        let v12 = graph.value_slot(ValueId(12)).unwrap();
        assert_eq!(graph.live_nodes(&[v12]), vec![true, true, true]);
    }

    #[test]
    fn test_rejects_cycle() {
        let result = TaskGraph::new(
            vec![
                TaskNode::new(0, OpKind::Neg, vec![ValueId(2)], ValueId(1), P),
                TaskNode::new(1, OpKind::Neg, vec![ValueId(1)], ValueId(2), P),
            ],
            vec![],
        );
        match result {
            Err(RuntimeError::InvalidGraph(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_second_producer() {
        let result = TaskGraph::new(
            vec![
                TaskNode::new(0, OpKind::Neg, vec![ValueId(0)], ValueId(1), P),
                TaskNode::new(1, OpKind::Identity, vec![ValueId(0)], ValueId(1), P),
            ],
            vec![(ValueId(0), P)],
        );
        assert!(matches!(result, Err(RuntimeError::InvalidGraph(_))));
    }

    #[test]
    fn test_rejects_unknown_input_and_bad_arity() {
        let unknown = TaskGraph::new(
            vec![TaskNode::new(0, OpKind::Neg, vec![ValueId(7)], ValueId(1), P)],
            vec![],
        );
        assert_eq!(unknown.unwrap_err(), RuntimeError::UnknownValue(ValueId(7)));

        let arity = TaskGraph::new(
            vec![TaskNode::new(0, OpKind::Add, vec![ValueId(0)], ValueId(1), P)],
            vec![(ValueId(0), P)],
        );
        assert!(matches!(arity, Err(RuntimeError::InvalidGraph(_))));
    }

    #[test]
    fn test_partition_must_match_along_edges() {
        let q = PartitionId(1);
        let mismatch = TaskGraph::new(
            vec![TaskNode::new(0, OpKind::Neg, vec![ValueId(0)], ValueId(1), q)],
            vec![(ValueId(0), P)],
        );
        assert!(matches!(mismatch, Err(RuntimeError::InvalidGraph(_))));

        let switched = TaskGraph::new(
            vec![TaskNode::new(
                0,
                OpKind::ChangePartition { from: P },
                vec![ValueId(0)],
                ValueId(1),
                q,
            )],
            vec![(ValueId(0), P)],
        );
        assert!(switched.is_ok());
    }

    #[test]
    fn test_same_value_read_twice_counts_twice() {
        let graph = TaskGraph::new(
            vec![
                TaskNode::new(0, OpKind::Neg, vec![ValueId(0)], ValueId(1), P),
                TaskNode::new(1, OpKind::Add, vec![ValueId(1), ValueId(1)], ValueId(2), P),
            ],
            vec![(ValueId(0), P)],
        )
        .unwrap();
        assert_eq!(graph.dependency_count(1), 2);
        assert_eq!(graph.dependents(0), &[1, 1]);
    }
}
