// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Scheduler Throughput Benchmarks
//!
//! Wide graphs (independent chains joined by a reduction) across worker counts and
//! backends, to see how far ready-node parallelism scales before lock contention and
//! buffer traffic dominate.

use std::time::Duration;

use cipherflow_runtime::{
    load_program, ArtifactInput, ArtifactNode, ArtifactOp, ArtifactPartition, Context,
    ContextOptions, Program, ProgramArtifact,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// `width` chains of `depth` plain multiplications, summed pairwise into one output
fn wide_program(width: u32, depth: u32) -> Program {
    let node = |id: u32, op: ArtifactOp, inputs: Vec<u32>, output: u32| ArtifactNode {
        id,
        op,
        inputs,
        output,
        partition: "P".to_string(),
        accelerator_eligible: None,
    };

    let mut nodes = Vec::new();
    let mut next_value = width;
    let mut heads: Vec<u32> = (0..width).collect();
    for _ in 0..depth {
        for head in heads.iter_mut() {
            nodes.push(node(nodes.len() as u32, ArtifactOp::MulPlain { constant: 1 }, vec![*head], next_value));
            *head = next_value;
            next_value += 1;
        }
    }
    while heads.len() > 1 {
        let mut reduced = Vec::with_capacity(heads.len() / 2 + 1);
        for pair in heads.chunks(2) {
            if let [lhs, rhs] = pair {
                nodes.push(node(nodes.len() as u32, ArtifactOp::Add, vec![*lhs, *rhs], next_value));
                reduced.push(next_value);
                next_value += 1;
            } else {
                reduced.push(pair[0]);
            }
        }
        heads = reduced;
    }

    let artifact = ProgramArtifact {
        name: format!("wide_{}x{}", width, depth),
        partitions: vec![ArtifactPartition::new("P", 1, 1, 512)],
        inputs: (0..width)
            .map(|value| ArtifactInput {
                value,
                partition: "P".to_string(),
            })
            .collect(),
        outputs: heads,
        nodes,
    };
    load_program(&artifact).expect("benchmark program is valid")
}

fn bench_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_workers");
    group.sample_size(20);
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_secs(3));

    let program = wide_program(32, 8);
    group.throughput(Throughput::Elements(program.graph().len() as u64));

    for workers in [1usize, 2, 4, 8] {
        let ctx = Context::create(ContextOptions {
            parallelism: workers,
            ..ContextOptions::default()
        })
        .expect("context");
        let inputs = program.encrypt_inputs(&ctx, &vec![0; 32]).expect("inputs");

        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| black_box(program.call(&ctx, black_box(inputs.clone())).expect("call")));
        });
    }

    group.finish();
}

fn bench_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("backends");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(3));

    let program = wide_program(16, 4);
    let configurations = [
        ("cpu", ContextOptions::default()),
        (
            "accelerator",
            ContextOptions {
                enable_accelerator: true,
                device_count: 2,
                ..ContextOptions::default()
            },
        ),
        (
            "simulation",
            ContextOptions {
                enable_simulation: true,
                ..ContextOptions::default()
            },
        ),
        (
            "deterministic",
            ContextOptions {
                deterministic_order: true,
                ..ContextOptions::default()
            },
        ),
    ];

    for (name, options) in configurations {
        let ctx = Context::create(options).expect("context");
        let inputs = program.encrypt_inputs(&ctx, &vec![1; 16]).expect("inputs");
        group.bench_function(name, |b| {
            b.iter(|| black_box(program.call(&ctx, black_box(inputs.clone())).expect("call")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_workers, bench_backends);
criterion_main!(benches);
