// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! End-to-end circuit scenarios through the umbrella crate.
//!
//! These tests exercise key generation, scheduling order, dead-node elision and failure
//! containment together, the way a harness drives a loaded program.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cipherflow::keys::Ciphertext;
use cipherflow::prelude::*;
use cipherflow::runtime::{
    ArtifactInput, ArtifactNode, ArtifactOp, ArtifactPartition, ContextBuilder, NodeId, OpKeys,
    PrimitiveError, Primitives, ReferencePrimitives,
};

fn node(id: u32, op: ArtifactOp, inputs: Vec<u32>, output: u32, partition: &str) -> ArtifactNode {
    ArtifactNode {
        id,
        op,
        inputs,
        output,
        partition: partition.to_string(),
        accelerator_eligible: None,
    }
}

fn input(value: u32, partition: &str) -> ArtifactInput {
    ArtifactInput {
        value,
        partition: partition.to_string(),
    }
}

/// A = x * 2, B = y + 3, C = A + B over P1 = {lweDim 1, glweDim 1, polySize 1024}
fn fan_in_program() -> Program {
    load_program(&ProgramArtifact {
        name: "fan_in".to_string(),
        partitions: vec![ArtifactPartition::new("P1", 1, 1, 1024)],
        inputs: vec![input(0, "P1"), input(1, "P1")],
        outputs: vec![4],
        nodes: vec![
            node(0, ArtifactOp::MulPlain { constant: 2 }, vec![0], 2, "P1"),
            node(1, ArtifactOp::AddPlain { constant: 3 }, vec![1], 3, "P1"),
            node(2, ArtifactOp::Add, vec![2, 3], 4, "P1"),
        ],
    })
    .unwrap()
}

#[test]
fn test_fan_in_scenario_on_p1() {
    let program = fan_in_program();
    let ctx = Context::create(ContextOptions {
        parallelism: 4,
        deterministic_order: true,
        key_seed: KeySeed::new(41, 42),
        ..ContextOptions::default()
    })
    .unwrap();

    let p1 = program.partition("P1").unwrap().clone();
    assert_eq!(p1.ciphertext_len(), 1025);

    let inputs = program.encrypt_inputs(&ctx, &[5, 4]).unwrap();
    let (result, trace) = program.call_traced(&ctx, inputs);
    let outputs = result.unwrap();

    assert_eq!(trace.started, vec![NodeId(0), NodeId(1), NodeId(2)]);
    // C starts only after both producers completed
    let c_start = trace.record_for(NodeId(2)).unwrap().started_at;
    for producer in [NodeId(0), NodeId(1)] {
        let record = trace.record_for(producer).unwrap();
        assert!(record.started_at + record.elapsed <= c_start);
    }

    // 5 * 2 + (4 + 3) = 17 = 1 mod 16
    assert_eq!(program.decrypt_outputs(&ctx, &outputs).unwrap(), vec![1]);

    // Composition matches applying the primitives by hand
    let keys = ctx.key_set(&p1).unwrap();
    let x = keys.encrypt(5, 0);
    let y = keys.encrypt(4, 1);
    let a: Vec<u64> = x.iter().map(|w| w.wrapping_mul(2)).collect();
    let mut b = y.clone();
    let last = b.len() - 1;
    b[last] = b[last].wrapping_add(keys.encode(3));
    let c: Vec<u64> = a.iter().zip(&b).map(|(a, b)| a.wrapping_add(*b)).collect();
    assert_eq!(outputs[0], Value::Ciphertext(c));

    // One generation for the whole run, however many nodes used the key set
    let stats = ctx.key_manager().stats();
    assert_eq!(stats.generations, 1);
    assert!(stats.hits >= 3);
}

#[test]
fn test_unused_branch_is_never_executed() {
    let artifact = ProgramArtifact {
        name: "side_branch".to_string(),
        partitions: vec![ArtifactPartition::new("P", 1, 1, 256)],
        inputs: vec![input(0, "P")],
        outputs: vec![2],
        nodes: vec![
            node(0, ArtifactOp::AddPlain { constant: 1 }, vec![0], 1, "P"),
            node(1, ArtifactOp::MulPlain { constant: 3 }, vec![1], 2, "P"),
            // Side branch nothing requests
            node(2, ArtifactOp::Neg, vec![1], 3, "P"),
            node(3, ArtifactOp::AddPlain { constant: 9 }, vec![3], 4, "P"),
        ],
    };
    let program = load_program(&artifact).unwrap();
    let ctx = Context::create(ContextOptions::default()).unwrap();

    let inputs = program.encrypt_inputs(&ctx, &[2]).unwrap();
    let (result, trace) = program.call_traced(&ctx, inputs);
    assert_eq!(program.decrypt_outputs(&ctx, &result.unwrap()).unwrap(), vec![9]);

    assert_eq!(trace.executed(), 2);
    assert_eq!(trace.elided, vec![NodeId(2), NodeId(3)]);
    assert!(trace.record_for(NodeId(2)).is_none());

    // Without elision every node runs
    let eager = Context::create(ContextOptions {
        elide_dead_nodes: false,
        ..ContextOptions::default()
    })
    .unwrap();
    let inputs = program.encrypt_inputs(&eager, &[2]).unwrap();
    let (result, trace) = program.call_traced(&eager, inputs);
    assert!(result.is_ok());
    assert_eq!(trace.executed(), 4);
    assert!(trace.elided.is_empty());
}

/// Delays every plain multiplication so a sibling can fail while it runs
struct SlowMultiply;

impl Primitives for SlowMultiply {
    fn name(&self) -> &str {
        "slow-multiply"
    }

    fn execute(
        &self,
        op: &OpKind,
        inputs: &[&[u64]],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<Ciphertext, PrimitiveError> {
        if let OpKind::MulPlain(_) = op {
            thread::sleep(Duration::from_millis(300));
        }
        ReferencePrimitives.execute(op, inputs, keys, nonce)
    }
}

#[test]
fn test_failure_skips_unstarted_siblings_and_context_survives() {
    // n0 (slow) and n1 (invalid table) start together on two workers; n2, n3 and the
    // join n4 must never start
    let artifact = ProgramArtifact {
        name: "containment".to_string(),
        partitions: vec![ArtifactPartition::new("P", 1, 1, 256)],
        inputs: vec![input(0, "P")],
        outputs: vec![10],
        nodes: vec![
            node(0, ArtifactOp::MulPlain { constant: 1 }, vec![0], 1, "P"),
            node(1, ArtifactOp::ApplyLookupTable { table: vec![0; 7] }, vec![0], 2, "P"),
            node(2, ArtifactOp::Neg, vec![0], 3, "P"),
            node(3, ArtifactOp::AddPlain { constant: 1 }, vec![0], 4, "P"),
            node(4, ArtifactOp::Add, vec![1, 2], 5, "P"),
            node(5, ArtifactOp::Add, vec![3, 4], 6, "P"),
            node(6, ArtifactOp::Add, vec![5, 6], 10, "P"),
        ],
    };
    let program = load_program(&artifact).unwrap();
    let ctx = ContextBuilder::new(ContextOptions {
        parallelism: 2,
        ..ContextOptions::default()
    })
    .with_primitives(Arc::new(SlowMultiply))
    .build()
    .unwrap();

    let inputs = program.encrypt_inputs(&ctx, &[3]).unwrap();
    let (result, trace) = program.call_traced(&ctx, inputs);

    let err = result.unwrap_err();
    match &err {
        RuntimeError::GraphCancelled {
            failed_node,
            skipped,
            ..
        } => {
            assert_eq!(*failed_node, Some(NodeId(1)));
            assert_eq!(*skipped, 5);
        }
        other => panic!("expected graph cancellation, got {:?}", other),
    }
    assert!(matches!(err.root_cause(), RuntimeError::NodeExecution { node: NodeId(1), .. }));
    assert_eq!(trace.failed, Some(NodeId(1)));
    // The running sibling finished, but its result was thrown away
    assert_eq!(trace.discarded, vec![NodeId(0)]);
    assert_eq!(
        trace.skipped,
        vec![NodeId(2), NodeId(3), NodeId(4), NodeId(5), NodeId(6)]
    );

    // The same context serves an independent program afterwards
    let healthy = fan_in_program();
    let inputs = healthy.encrypt_inputs(&ctx, &[1, 1]).unwrap();
    let outputs = healthy.call(&ctx, inputs).unwrap();
    assert_eq!(healthy.decrypt_outputs(&ctx, &outputs).unwrap(), vec![6]);
}

#[test]
fn test_concurrent_requesters_share_one_generation() {
    let ctx = Arc::new(Context::create(ContextOptions::default()).unwrap());
    let partition = Arc::new(Partition::builder("P1", 1, 1, 1024).build().unwrap());
    let requesters = 16;
    let barrier = Arc::new(Barrier::new(requesters));

    let handles: Vec<_> = (0..requesters)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let partition = Arc::clone(&partition);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ctx.key_set(&partition).unwrap()
            })
        })
        .collect();
    let key_sets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(key_sets.iter().all(|keys| Arc::ptr_eq(keys, &key_sets[0])));
    let stats = ctx.key_manager().stats();
    assert_eq!(stats.generations, 1);
    assert_eq!(stats.hits + stats.waits, requesters as u64 - 1);
}

#[test]
fn test_repeated_calls_are_reproducible() {
    let program = fan_in_program();
    let ctx = Context::create(ContextOptions {
        deterministic_order: true,
        ..ContextOptions::default()
    })
    .unwrap();

    let inputs = program.encrypt_inputs(&ctx, &[7, 2]).unwrap();
    let first = program.call_traced(&ctx, inputs.clone());
    let second = program.call_traced(&ctx, inputs);
    assert_eq!(first.0.unwrap(), second.0.unwrap());
    assert_eq!(first.1.started, second.1.started);
    assert_eq!(ctx.key_manager().stats().generations, 1);
}
