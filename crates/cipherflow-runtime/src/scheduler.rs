// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Dataflow Scheduler
//!
//! Executes one instantiation of a [`TaskGraph`] on the context's worker pool.
//!
//! ## Algorithm
//! 1. Liveness: with dead-node elision on, only nodes some requested output depends on run.
//! 2. Every live node starts with its unresolved produced-input count; nodes at zero are
//!    ready. Arguments are bound into the buffer arena before any worker starts.
//! 3. Workers pop the ready node with the lowest id, execute it on the selected backend
//!    outside the lock, store the output, and decrement dependents. There is no barrier
//!    between independent branches.
//! 4. In deterministic mode workers only take the next node of the precomputed Kahn
//!    order, so the start sequence is identical across runs and backends.
//!
//! ## Failure
//! The first failed node (or a cancellation) stops all further dispatch. Nodes already
//! running finish and their outputs are discarded; unstarted live nodes are reported as
//! skipped. The invocation's buffers are released before returning, leaving the context
//! ready for the next call.

use ahash::AHashMap;
use cipherflow_keys::{Ciphertext, KeyManager, KeySeed, KeySet, Partition, PartitionId, PartitionRegistry};
use parking_lot::Condvar;
use rayon::ThreadPool;
use std::any::Any;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use crate::arena::BufferArena;
use crate::backend::{
    select_backend, AcceleratorBackend, BackendTarget, CpuBackend, ExecutionMode,
    SimulationBackend,
};
use crate::error::{DeviceError, Result, RuntimeError};
use crate::graph::{OpKind, TaskGraph, TaskNode};
use crate::primitives::{node_nonce, trivial_ciphertext, OpKeys};
use crate::remote::RemoteWorker;
use crate::trace::{BackendKind, ExecutionTrace, NodeRecord, TraceRecorder};
use crate::tracing_mutex::TracingMutex;
use crate::value::{BufferData, DeviceId, NodeId, Value, ValueBuffer, ValueId};

/// Idle workers re-check cancellation at this interval
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Per-invocation execution options
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub requested_outputs: Vec<ValueId>,
    pub deterministic_order: bool,
    pub elide_dead_nodes: bool,
    /// Nodes to run on remote workers, by worker index
    pub remote_assignment: AHashMap<NodeId, usize>,
}

impl ExecutionOptions {
    pub fn new(requested_outputs: Vec<ValueId>) -> Self {
        Self {
            requested_outputs,
            deterministic_order: false,
            elide_dead_nodes: true,
            remote_assignment: AHashMap::new(),
        }
    }
}

/// Cancels one invocation
///
/// A token created by a context also observes the context's teardown and
/// `cancel_in_flight` calls made after the token was created.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    observed_epoch: u64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::linked(Arc::new(AtomicU64::new(0)))
    }

    pub(crate) fn linked(epoch: Arc<AtomicU64>) -> Self {
        let observed_epoch = epoch.load(Ordering::SeqCst);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            epoch,
            observed_epoch,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.epoch.load(Ordering::SeqCst) != self.observed_epoch
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an invocation borrows from its context
pub(crate) struct ExecutionEnv<'a> {
    pub partitions: &'a PartitionRegistry,
    pub keys: &'a KeyManager,
    pub key_seed: KeySeed,
    pub mode: ExecutionMode,
    pub cpu: &'a CpuBackend,
    pub accelerator: Option<&'a AcceleratorBackend>,
    pub simulation: &'a SimulationBackend,
    pub remotes: &'a [RemoteWorker],
    pub cpu_fallback: bool,
    pub pool: &'a ThreadPool,
    pub cancel: CancellationToken,
}

struct Failure {
    error: RuntimeError,
    node: Option<NodeId>,
}

struct DispatchState {
    ready: BinaryHeap<Reverse<usize>>,
    pending: Vec<usize>,
    started: Vec<bool>,
    /// Position in the deterministic order
    cursor: usize,
    running: usize,
    /// Live nodes not yet completed
    remaining: usize,
    failure: Option<Failure>,
}

struct Invocation<'a> {
    graph: &'a TaskGraph,
    options: &'a ExecutionOptions,
    env: &'a ExecutionEnv<'a>,
    requested: Vec<(ValueId, usize)>,
    live: Vec<bool>,
    consumers: Vec<usize>,
    /// Outputs that stay on the device for accelerator consumers
    resident: Vec<bool>,
    order: Vec<usize>,
    arena: BufferArena,
    recorder: TraceRecorder,
    state: TracingMutex<DispatchState>,
    wake: Condvar,
}

/// Execute `graph` with `arguments`, returning the requested outputs and the trace
pub(crate) fn execute_graph(
    graph: &TaskGraph,
    arguments: AHashMap<ValueId, Value>,
    options: &ExecutionOptions,
    env: &ExecutionEnv<'_>,
) -> (Result<AHashMap<ValueId, Value>>, ExecutionTrace) {
    let invocation = match Invocation::prepare(graph, options, env) {
        Ok(invocation) => invocation,
        Err(e) => return (Err(e), ExecutionTrace::default()),
    };

    let bound = invocation.bind_arguments(arguments);
    let remaining = invocation.state.lock().remaining;
    if bound.is_ok() && remaining > 0 {
        let workers = env.pool.current_num_threads().clamp(1, remaining);
        debug!(
            nodes = graph.len(),
            live = remaining,
            workers,
            mode = %env.mode,
            deterministic = options.deterministic_order,
            "Executing task graph"
        );
        let shared = &invocation;
        env.pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move |_| shared.worker());
            }
        });
    }

    invocation.finish(bound.err())
}

impl<'a> Invocation<'a> {
    fn prepare(
        graph: &'a TaskGraph,
        options: &'a ExecutionOptions,
        env: &'a ExecutionEnv<'a>,
    ) -> Result<Self> {
        let mut requested = Vec::with_capacity(options.requested_outputs.len());
        for &value in &options.requested_outputs {
            let slot = graph
                .value_slot(value)
                .ok_or(RuntimeError::UnknownValue(value))?;
            if !requested.iter().any(|&(_, s)| s == slot) {
                requested.push((value, slot));
            }
        }
        let requested_slots: Vec<usize> = requested.iter().map(|&(_, slot)| slot).collect();

        let live = if options.elide_dead_nodes {
            graph.live_nodes(&requested_slots)
        } else {
            vec![true; graph.len()]
        };

        let mut consumers = vec![0usize; graph.value_count()];
        for index in (0..graph.len()).filter(|&index| live[index]) {
            for &slot in graph.input_slots(index) {
                consumers[slot] += 1;
            }
        }
        for &slot in &requested_slots {
            consumers[slot] += 1;
        }

        let accelerating = env.mode == ExecutionMode::Accelerator
            && env.accelerator.map_or(false, |accelerator| accelerator.has_devices());
        let on_device = |index: usize| {
            let node = graph.node(index);
            node.accelerator_eligible && !options.remote_assignment.contains_key(&node.id)
        };
        let resident = (0..graph.len())
            .map(|index| {
                accelerating
                    && live[index]
                    && on_device(index)
                    && !requested_slots.contains(&graph.output_slot(index))
                    && graph
                        .dependents(index)
                        .iter()
                        .filter(|&&dependent| live[dependent])
                        .all(|&dependent| on_device(dependent))
            })
            .collect();

        let order = if options.deterministic_order {
            graph.dispatch_order(&live)
        } else {
            Vec::new()
        };

        let pending: Vec<usize> = (0..graph.len())
            .map(|index| graph.dependency_count(index))
            .collect();
        let ready = (0..graph.len())
            .filter(|&index| live[index] && pending[index] == 0)
            .map(Reverse)
            .collect();
        let remaining = live.iter().filter(|&&is_live| is_live).count();

        Ok(Self {
            graph,
            options,
            env,
            requested,
            arena: BufferArena::new(consumers.clone()),
            consumers,
            live,
            resident,
            order,
            recorder: TraceRecorder::new(),
            state: TracingMutex::new(
                DispatchState {
                    ready,
                    pending,
                    started: vec![false; graph.len()],
                    cursor: 0,
                    running: 0,
                    remaining,
                    failure: None,
                },
                "scheduler-state",
            ),
            wake: Condvar::new(),
        })
    }

    /// Place program arguments into the arena in the backend's value representation
    fn bind_arguments(&self, mut arguments: AHashMap<ValueId, Value>) -> Result<()> {
        for &(value, partition_id) in self.graph.arguments() {
            let slot = self
                .graph
                .value_slot(value)
                .ok_or(RuntimeError::UnknownValue(value))?;
            if self.consumers[slot] == 0 {
                continue;
            }
            let supplied = arguments
                .remove(&value)
                .ok_or(RuntimeError::MissingArgument(value))?;
            let partition = self.partition(partition_id)?;

            let bound = match (self.env.mode, supplied) {
                (ExecutionMode::Simulation, Value::Cleartext(message)) => {
                    Value::Simulated(self.env.simulation.fresh(partition, message))
                }
                (ExecutionMode::Simulation, Value::Simulated(simulated)) => {
                    Value::Simulated(simulated)
                }
                (ExecutionMode::Simulation, other) => {
                    return Err(RuntimeError::ValueKind {
                        value,
                        expected: "cleartext or simulated",
                        actual: other.kind(),
                    })
                }
                (_, Value::Cleartext(message)) => {
                    Value::Ciphertext(trivial_ciphertext(partition, message))
                }
                (_, Value::Ciphertext(ciphertext)) => {
                    if ciphertext.len() != partition.ciphertext_len() {
                        return Err(RuntimeError::BufferShapeMismatch {
                            what: format!("argument {}", value),
                            expected: partition.ciphertext_len(),
                            actual: ciphertext.len(),
                        });
                    }
                    Value::Ciphertext(ciphertext)
                }
                (_, other) => {
                    return Err(RuntimeError::ValueKind {
                        value,
                        expected: "ciphertext or cleartext",
                        actual: other.kind(),
                    })
                }
            };
            self.arena
                .store(slot, ValueBuffer::host(value, partition_id, bound));
        }
        Ok(())
    }

    fn worker(&self) {
        while let Some(index) = self.next_node() {
            let (result, record) = self.run_node(index);
            self.complete(index, result, record);
        }
    }

    /// Block until a node may start; `None` once the invocation is done or failed
    fn next_node(&self) -> Option<usize> {
        let mut state = self.state.lock();
        loop {
            if state.failure.is_none() && self.env.cancel.is_cancelled() {
                warn!("Invocation cancelled, no further nodes will start");
                state.failure = Some(Failure {
                    error: RuntimeError::Cancelled,
                    node: None,
                });
                self.wake.notify_all();
            }
            if state.failure.is_some() || state.remaining == 0 {
                return None;
            }

            let candidate = if self.options.deterministic_order {
                match self.order.get(state.cursor) {
                    Some(&index) if state.pending[index] == 0 => {
                        state.cursor += 1;
                        Some(index)
                    }
                    _ => None,
                }
            } else {
                state.ready.pop().map(|Reverse(index)| index)
            };

            if let Some(index) = candidate {
                state.started[index] = true;
                state.running += 1;
                self.recorder.started(self.graph.node(index).id);
                return Some(index);
            }
            self.wake.wait_for(&mut state, CANCEL_POLL);
        }
    }

    fn run_node(&self, index: usize) -> (Result<ValueBuffer>, NodeRecord) {
        let node = self.graph.node(index);
        let started_at = self.recorder.offset();
        let timer = Instant::now();
        let mut backend = BackendKind::Cpu;
        let mut fell_back = false;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(index, &mut backend, &mut fell_back)
        }))
        .unwrap_or_else(|payload| {
            Err(RuntimeError::NodeExecution {
                node: node.id,
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            })
        });

        for &slot in self.graph.input_slots(index) {
            self.arena.release(slot);
        }

        let record = NodeRecord {
            node: node.id,
            backend,
            fell_back,
            started_at,
            elapsed: timer.elapsed(),
        };
        (result, record)
    }

    fn dispatch(
        &self,
        index: usize,
        backend: &mut BackendKind,
        fell_back: &mut bool,
    ) -> Result<ValueBuffer> {
        let node = self.graph.node(index);
        let partition = self.partition(node.partition)?;
        let inputs = self
            .graph
            .input_slots(index)
            .iter()
            .map(|&slot| {
                self.arena.get(slot).ok_or_else(|| {
                    RuntimeError::InvalidGraph(format!(
                        "{} read {} before it was produced",
                        node.id,
                        self.graph.slot_value(slot)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let decision = select_backend(
            node,
            self.env.mode,
            self.env
                .accelerator
                .map_or(false, |accelerator| accelerator.has_devices()),
            self.options.remote_assignment.get(&node.id).copied(),
        );
        trace!(
            node = %node.id,
            op = node.op.name(),
            target = ?decision.target,
            reason = decision.reason,
            "Dispatching node"
        );

        let data = match decision.target {
            BackendTarget::Simulation => {
                *backend = BackendKind::Simulation;
                self.run_simulated(node, partition, &inputs)?
            }
            BackendTarget::Cpu => self.run_cpu(node, partition, &inputs)?,
            BackendTarget::Accelerator => {
                match self.run_accelerator(index, node, partition, &inputs) {
                    Ok((data, device)) => {
                        *backend = BackendKind::Accelerator(device);
                        data
                    }
                    Err(RuntimeError::Device(e)) if self.env.cpu_fallback => {
                        warn!(node = %node.id, error = %e, "Device failed, falling back to CPU");
                        if let Some(accelerator) = self.env.accelerator {
                            accelerator.record_fallback();
                        }
                        *fell_back = true;
                        self.run_cpu(node, partition, &inputs)?
                    }
                    Err(e) => return Err(e),
                }
            }
            BackendTarget::Remote(worker) => {
                *backend = BackendKind::Remote(worker);
                self.run_remote(worker, node, partition, &inputs)?
            }
        };

        Ok(ValueBuffer {
            value_id: node.output,
            partition: node.partition,
            data,
        })
    }

    fn run_simulated(
        &self,
        node: &TaskNode,
        partition: &Partition,
        inputs: &[Arc<ValueBuffer>],
    ) -> Result<BufferData> {
        let simulated = inputs
            .iter()
            .map(|buffer| match buffer.host_value() {
                Some(Value::Simulated(value)) => Ok(*value),
                other => Err(RuntimeError::ValueKind {
                    value: buffer.value_id,
                    expected: "simulated",
                    actual: other.map_or("device-resident", Value::kind),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        let input_partition = self.partition(node.input_partition())?;
        let out = self
            .env
            .simulation
            .execute(node, &simulated, partition, input_partition)?;
        Ok(BufferData::Host(Value::Simulated(out)))
    }

    fn run_cpu(
        &self,
        node: &TaskNode,
        partition: &Arc<Partition>,
        inputs: &[Arc<ValueBuffer>],
    ) -> Result<BufferData> {
        let ciphertexts = self.host_ciphertexts(inputs)?;
        let views: Vec<&[u64]> = ciphertexts.iter().map(|c| c.as_ref()).collect();
        let nonce = node_nonce(node.id, &views);
        let (output_keys, input_keys) = self.keys_for(node, partition)?;
        let out = self.env.cpu.execute(
            node,
            &views,
            &OpKeys {
                output: &output_keys,
                input: input_keys.as_deref(),
            },
            nonce,
        )?;
        Ok(BufferData::Host(Value::Ciphertext(out)))
    }

    fn run_accelerator(
        &self,
        index: usize,
        node: &TaskNode,
        partition: &Arc<Partition>,
        inputs: &[Arc<ValueBuffer>],
    ) -> Result<(BufferData, DeviceId)> {
        let accelerator = self
            .env
            .accelerator
            .ok_or(RuntimeError::Device(DeviceError::NoDevice))?;
        // Device-resident inputs do not contribute to the nonce
        let host_views: Vec<&[u64]> = inputs
            .iter()
            .filter_map(|buffer| buffer.host_value().and_then(Value::as_ciphertext))
            .map(|ciphertext| ciphertext.as_slice())
            .collect();
        let nonce = node_nonce(node.id, &host_views);
        let (output_keys, input_keys) = self.keys_for(node, partition)?;
        let buffers: Vec<&ValueBuffer> = inputs.iter().map(|buffer| buffer.as_ref()).collect();

        Ok(accelerator.execute(
            &node.op,
            &buffers,
            &OpKeys {
                output: &output_keys,
                input: input_keys.as_deref(),
            },
            nonce,
            self.resident[index],
        )?)
    }

    fn run_remote(
        &self,
        worker: usize,
        node: &TaskNode,
        partition: &Partition,
        inputs: &[Arc<ValueBuffer>],
    ) -> Result<BufferData> {
        let remote = self.env.remotes.get(worker).ok_or(RuntimeError::Remote {
            worker,
            reason: "no such worker".to_string(),
        })?;
        let ciphertexts: Vec<Ciphertext> = self
            .host_ciphertexts(inputs)?
            .into_iter()
            .map(Cow::into_owned)
            .collect();
        let views: Vec<&[u64]> = ciphertexts.iter().map(Vec::as_slice).collect();
        let nonce = node_nonce(node.id, &views);
        let input_partition = match node.op {
            OpKind::ChangePartition { from } => Some(&**self.partition(from)?),
            _ => None,
        };

        let out = remote.execute(
            node,
            partition,
            input_partition,
            self.env.key_seed,
            ciphertexts,
            nonce,
        )?;
        Ok(BufferData::Host(Value::Ciphertext(out)))
    }

    /// Host views of ciphertext inputs, downloading device-resident ones
    fn host_ciphertexts<'b>(&self, inputs: &'b [Arc<ValueBuffer>]) -> Result<Vec<Cow<'b, [u64]>>> {
        inputs
            .iter()
            .map(|buffer| match &buffer.data {
                BufferData::Host(Value::Ciphertext(ciphertext)) => {
                    Ok(Cow::Borrowed(ciphertext.as_slice()))
                }
                BufferData::Host(other) => Err(RuntimeError::ValueKind {
                    value: buffer.value_id,
                    expected: "ciphertext",
                    actual: other.kind(),
                }),
                BufferData::Device(_) => {
                    let accelerator = self
                        .env
                        .accelerator
                        .ok_or(RuntimeError::Device(DeviceError::NoDevice))?;
                    match accelerator.to_host(buffer)? {
                        Value::Ciphertext(words) => Ok(Cow::Owned(words)),
                        other => Err(RuntimeError::ValueKind {
                            value: buffer.value_id,
                            expected: "ciphertext",
                            actual: other.kind(),
                        }),
                    }
                }
            })
            .collect()
    }

    /// Key sets for a node, fetched lazily through the key manager
    fn keys_for(
        &self,
        node: &TaskNode,
        partition: &Arc<Partition>,
    ) -> Result<(Arc<KeySet>, Option<Arc<KeySet>>)> {
        let output = self.env.keys.get_or_create(partition, self.env.key_seed)?;
        let input = match node.op {
            OpKind::ChangePartition { from } => Some(
                self.env
                    .keys
                    .get_or_create(self.partition(from)?, self.env.key_seed)?,
            ),
            _ => None,
        };
        Ok((output, input))
    }

    fn partition(&self, id: PartitionId) -> Result<&'a Arc<Partition>> {
        self.env
            .partitions
            .get(id)
            .ok_or_else(|| RuntimeError::UnknownPartition(id.to_string()))
    }

    fn complete(&self, index: usize, result: Result<ValueBuffer>, record: NodeRecord) {
        let node = self.graph.node(index);
        let mut state = self.state.lock();
        state.running -= 1;

        match result {
            Ok(buffer) if state.failure.is_none() => {
                self.arena.store(self.graph.output_slot(index), buffer);
                self.recorder.finished(record, false);
                state.remaining -= 1;
                for &dependent in self.graph.dependents(index) {
                    state.pending[dependent] -= 1;
                    if state.pending[dependent] == 0
                        && self.live[dependent]
                        && !self.options.deterministic_order
                    {
                        state.ready.push(Reverse(dependent));
                    }
                }
            }
            Ok(buffer) => {
                debug!(node = %node.id, "Discarding result of node finished after failure");
                drop(buffer);
                self.recorder.finished(record, true);
            }
            Err(error) => {
                error!(node = %node.id, op = node.op.name(), error = %error, "Node failed");
                self.recorder.failed(node.id, Some(record));
                if state.failure.is_none() {
                    state.failure = Some(Failure {
                        error,
                        node: Some(node.id),
                    });
                }
            }
        }
        self.wake.notify_all();
    }

    fn collect_outputs(&self) -> Result<AHashMap<ValueId, Value>> {
        let mut outputs = AHashMap::with_capacity(self.requested.len());
        for &(value, slot) in &self.requested {
            let buffer = self.arena.take(slot).ok_or_else(|| {
                RuntimeError::InvalidGraph(format!("requested value {} was never produced", value))
            })?;
            let host = match &buffer.data {
                BufferData::Host(host) => host.clone(),
                BufferData::Device(_) => self
                    .env
                    .accelerator
                    .ok_or(RuntimeError::Device(DeviceError::NoDevice))?
                    .to_host(&buffer)?,
            };
            outputs.insert(value, host);
        }
        Ok(outputs)
    }

    fn finish(self, bind_error: Option<RuntimeError>) -> (Result<AHashMap<ValueId, Value>>, ExecutionTrace) {
        let (failure, started) = {
            let mut state = self.state.lock();
            (state.failure.take(), std::mem::take(&mut state.started))
        };

        let node_ids = |keep: &dyn Fn(usize) -> bool| -> Vec<NodeId> {
            (0..self.graph.len())
                .filter(|&index| keep(index))
                .map(|index| self.graph.node(index).id)
                .collect()
        };
        let skipped = node_ids(&|index| self.live[index] && !started[index]);
        let elided = node_ids(&|index| !self.live[index]);

        let result = match (bind_error, failure) {
            (Some(error), _) => Err(error),
            (None, Some(failure)) => Err(RuntimeError::GraphCancelled {
                cause: Box::new(failure.error),
                failed_node: failure.node,
                skipped: skipped.len(),
            }),
            (None, None) => self.collect_outputs(),
        };

        let peak = self.arena.stats().peak_live;
        let released = self.arena.clear();
        let trace = self.recorder.finish(elided, skipped, peak);

        match &result {
            Ok(_) => debug!(
                executed = trace.executed(),
                elided = trace.elided.len(),
                fallbacks = trace.fallbacks,
                elapsed_us = trace.total.as_micros() as u64,
                "Task graph completed"
            ),
            Err(e) => warn!(
                error = %e,
                skipped = trace.skipped.len(),
                discarded = trace.discarded.len(),
                released,
                "Task graph failed"
            ),
        }
        (result, trace)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
