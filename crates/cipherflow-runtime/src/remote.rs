// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Remote Workers
//!
//! A remote worker executes nodes assigned to it away from the context's pool. Requests and
//! completions travel as bincode-encoded [`WireFrame`]s over a crossbeam channel pair, so the
//! worker sees only serialized buffers, partitions and key seeds; it derives key material
//! with its own [`KeyManager`].
//!
//! ## Delivery
//! - Every dispatch carries a `delivery_id`. A dispatch that is not acknowledged within the
//!   ack timeout is retransmitted with the same id.
//! - The worker executes each `delivery_id` at most once and answers retransmissions from
//!   its completion cache.
//! - The scheduler side accepts exactly one completion per `delivery_id`; late duplicates
//!   are dropped as stale.

use cipherflow_keys::{Ciphertext, KeyManager, KeySeed, Partition};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use ahash::AHashMap;

use crate::error::{Result, RuntimeError};
use crate::graph::{OpKind, TaskNode};
use crate::primitives::{OpKeys, Primitives, ReferencePrimitives};
use crate::value::NodeId;

/// Completed deliveries remembered by a worker for answering retransmissions
const DELIVERY_MEMORY: usize = 1024;

/// Messages exchanged with a remote worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireFrame {
    Dispatch(DispatchFrame),
    Completion(CompletionFrame),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchFrame {
    pub delivery_id: u64,
    pub node: NodeId,
    pub op: OpKind,
    pub partition: Partition,
    /// Source partition of a `ChangePartition`
    pub input_partition: Option<Partition>,
    pub seed: KeySeed,
    pub inputs: Vec<Ciphertext>,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFrame {
    pub delivery_id: u64,
    pub node: NodeId,
    pub result: std::result::Result<Ciphertext, String>,
}

impl WireFrame {
    pub fn encode(&self) -> std::result::Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}

#[derive(Clone)]
pub struct RemoteWorkerOptions {
    /// Primitive implementation the worker executes with
    pub primitives: Arc<dyn Primitives>,
    pub key_cache_capacity: usize,
    pub channel_capacity: usize,
    /// Wait this long for a completion before retransmitting
    pub ack_timeout: Duration,
    pub max_retransmits: u32,
    /// Simulated link delay applied before each fresh completion is sent
    pub link_latency: Duration,
}

impl Default for RemoteWorkerOptions {
    fn default() -> Self {
        Self {
            primitives: Arc::new(ReferencePrimitives),
            key_cache_capacity: 8,
            channel_capacity: 64,
            ack_timeout: Duration::from_secs(5),
            max_retransmits: 3,
            link_latency: Duration::ZERO,
        }
    }
}

impl std::fmt::Debug for RemoteWorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorkerOptions")
            .field("primitives", &self.primitives.name())
            .field("key_cache_capacity", &self.key_cache_capacity)
            .field("channel_capacity", &self.channel_capacity)
            .field("ack_timeout", &self.ack_timeout)
            .field("max_retransmits", &self.max_retransmits)
            .field("link_latency", &self.link_latency)
            .finish()
    }
}

/// Delivery counters for one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteWorkerStats {
    pub dispatched: u64,
    pub retransmits: u64,
    /// Dispatches the worker actually executed
    pub executed: u64,
    /// Retransmitted dispatches the worker answered from its cache
    pub duplicates_dropped: u64,
    pub accepted: u64,
    /// Completions discarded because their delivery was already settled
    pub stale_completions: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    retransmits: AtomicU64,
    executed: AtomicU64,
    duplicates_dropped: AtomicU64,
    accepted: AtomicU64,
    stale_completions: AtomicU64,
}

struct Link {
    requests: Sender<Vec<u8>>,
    completions: Receiver<Vec<u8>>,
}

/// Handle to one remote worker
pub struct RemoteWorker {
    index: usize,
    name: String,
    options: RemoteWorkerOptions,
    // One outstanding delivery per worker
    link: Mutex<Link>,
    next_delivery: AtomicU64,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RemoteWorker {
    pub fn spawn(index: usize, name: impl Into<String>, options: RemoteWorkerOptions) -> Result<Self> {
        let name = name.into();
        let (request_tx, request_rx) = channel::bounded::<Vec<u8>>(options.channel_capacity.max(1));
        // The worker must never block on completions nobody reads
        let (completion_tx, completion_rx) = channel::unbounded::<Vec<u8>>();
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_loop = WorkerLoop {
            name: name.clone(),
            keys: KeyManager::new(options.key_cache_capacity),
            primitives: Arc::clone(&options.primitives),
            link_latency: options.link_latency,
            completed: AHashMap::new(),
            completed_order: VecDeque::new(),
            counters: Arc::clone(&counters),
            shutdown: Arc::clone(&shutdown),
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop.run(request_rx, completion_tx))
            .map_err(|e| {
                RuntimeError::Initialization(format!("failed to spawn remote worker: {}", e))
            })?;

        info!(
            worker = %name,
            index,
            primitives = options.primitives.name(),
            "Remote worker started"
        );

        Ok(Self {
            index,
            name,
            options,
            link: Mutex::new(Link {
                requests: request_tx,
                completions: completion_rx,
            }),
            next_delivery: AtomicU64::new(1),
            counters,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute one node on the worker and wait for its accepted completion
    pub fn execute(
        &self,
        node: &TaskNode,
        partition: &Partition,
        input_partition: Option<&Partition>,
        seed: KeySeed,
        inputs: Vec<Ciphertext>,
        nonce: u64,
    ) -> Result<Ciphertext> {
        let link = self.link.lock();
        let delivery_id = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        let frame = WireFrame::Dispatch(DispatchFrame {
            delivery_id,
            node: node.id,
            op: node.op.clone(),
            partition: partition.clone(),
            input_partition: input_partition.cloned(),
            seed,
            inputs,
            nonce,
        })
        .encode()
        .map_err(|reason| self.error(reason))?;

        self.send(&link, frame.clone())?;
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let mut retransmits = 0;
        loop {
            match link.completions.recv_timeout(self.options.ack_timeout) {
                Ok(bytes) => {
                    let completion = match WireFrame::decode(&bytes) {
                        Ok(WireFrame::Completion(completion)) => completion,
                        Ok(other) => {
                            warn!(worker = %self.name, frame = ?other, "Unexpected frame from worker");
                            continue;
                        }
                        Err(e) => {
                            warn!(worker = %self.name, error = %e, "Undecodable completion");
                            continue;
                        }
                    };
                    if completion.delivery_id != delivery_id {
                        self.counters.stale_completions.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            worker = %self.name,
                            delivery_id = completion.delivery_id,
                            "Dropped stale completion"
                        );
                        continue;
                    }
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    return completion.result.map_err(|reason| self.error(reason));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if retransmits >= self.options.max_retransmits {
                        return Err(self.error(format!(
                            "delivery {} unacknowledged after {} retransmits",
                            delivery_id, retransmits
                        )));
                    }
                    retransmits += 1;
                    self.counters.retransmits.fetch_add(1, Ordering::Relaxed);
                    debug!(worker = %self.name, delivery_id, retransmits, "Retransmitting dispatch");
                    self.send(&link, frame.clone())?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.error("completion channel closed".to_string()));
                }
            }
        }
    }

    pub fn stats(&self) -> RemoteWorkerStats {
        RemoteWorkerStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            retransmits: self.counters.retransmits.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates_dropped.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            stale_completions: self.counters.stale_completions.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker thread and wait for it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(frame) = WireFrame::Shutdown.encode() {
            let _ = self.link.lock().requests.try_send(frame);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "Remote worker thread panicked");
            } else {
                info!(worker = %self.name, "Remote worker stopped");
            }
        }
    }

    fn send(&self, link: &Link, frame: Vec<u8>) -> Result<()> {
        link.requests
            .send(frame)
            .map_err(|_| self.error("request channel closed".to_string()))
    }

    fn error(&self, reason: String) -> RuntimeError {
        RuntimeError::Remote {
            worker: self.index,
            reason,
        }
    }
}

impl Drop for RemoteWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RemoteWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWorker")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// State owned by the worker thread
struct WorkerLoop {
    name: String,
    keys: KeyManager,
    primitives: Arc<dyn Primitives>,
    link_latency: Duration,
    completed: AHashMap<u64, CompletionFrame>,
    completed_order: VecDeque<u64>,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerLoop {
    fn run(mut self, requests: Receiver<Vec<u8>>, completions: Sender<Vec<u8>>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let bytes = match requests.recv_timeout(Duration::from_millis(100)) {
                Ok(bytes) => bytes,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let dispatch = match WireFrame::decode(&bytes) {
                Ok(WireFrame::Dispatch(dispatch)) => dispatch,
                Ok(WireFrame::Shutdown) => break,
                Ok(WireFrame::Completion(_)) => {
                    warn!(worker = %self.name, "Ignoring completion frame sent to worker");
                    continue;
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Undecodable dispatch");
                    continue;
                }
            };

            let completion = match self.completed.get(&dispatch.delivery_id) {
                Some(completion) => {
                    self.counters
                        .duplicates_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    completion.clone()
                }
                None => {
                    let completion = CompletionFrame {
                        delivery_id: dispatch.delivery_id,
                        node: dispatch.node,
                        result: self.execute(&dispatch),
                    };
                    self.counters.executed.fetch_add(1, Ordering::Relaxed);
                    self.remember(completion.clone());
                    if !self.link_latency.is_zero() {
                        thread::sleep(self.link_latency);
                    }
                    completion
                }
            };

            match WireFrame::Completion(completion).encode() {
                Ok(frame) => {
                    if completions.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => error!(worker = %self.name, error = %e, "Failed to encode completion"),
            }
        }
        debug!(worker = %self.name, "Remote worker loop exited");
    }

    fn execute(&self, dispatch: &DispatchFrame) -> std::result::Result<Ciphertext, String> {
        let partition = Arc::new(dispatch.partition.clone());
        let output = self
            .keys
            .get_or_create(&partition, dispatch.seed)
            .map_err(|e| e.to_string())?;
        let input = match &dispatch.input_partition {
            Some(source) => Some(
                self.keys
                    .get_or_create(&Arc::new(source.clone()), dispatch.seed)
                    .map_err(|e| e.to_string())?,
            ),
            None => None,
        };

        let views: Vec<&[u64]> = dispatch.inputs.iter().map(Vec::as_slice).collect();
        self.primitives
            .execute(
                &dispatch.op,
                &views,
                &OpKeys {
                    output: &output,
                    input: input.as_deref(),
                },
                dispatch.nonce,
            )
            .map_err(|e| format!("{} ({})", e, dispatch.op.name()))
    }

    fn remember(&mut self, completion: CompletionFrame) {
        if self.completed_order.len() >= DELIVERY_MEMORY {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
        self.completed_order.push_back(completion.delivery_id);
        self.completed.insert(completion.delivery_id, completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueId;
    use cipherflow_keys::{KeySet, PartitionId};

    fn partition() -> Partition {
        Partition::builder("P", 1, 1, 256).build().unwrap()
    }

    fn add_node() -> TaskNode {
        TaskNode::new(
            3,
            OpKind::Add,
            vec![ValueId(0), ValueId(1)],
            ValueId(2),
            PartitionId(0),
        )
    }

    #[test]
    fn test_remote_execution() {
        let partition = partition();
        let seed = KeySeed::new(5, 6);
        let keys = KeySet::generate(Arc::new(partition.clone()), seed).unwrap();
        let worker = RemoteWorker::spawn(0, "remote-0", RemoteWorkerOptions::default()).unwrap();

        let out = worker
            .execute(
                &add_node(),
                &partition,
                None,
                seed,
                vec![keys.encrypt(2, 0), keys.encrypt(7, 1)],
                9,
            )
            .unwrap();
        assert_eq!(keys.decrypt(&out).unwrap(), 9);

        let stats = worker.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.executed, 1);
    }

    #[test]
    fn test_retransmissions_execute_once() {
        let partition = partition();
        let seed = KeySeed::new(1, 1);
        let keys = KeySet::generate(Arc::new(partition.clone()), seed).unwrap();
        let worker = RemoteWorker::spawn(
            0,
            "slow-link",
            RemoteWorkerOptions {
                ack_timeout: Duration::from_millis(10),
                max_retransmits: 50,
                link_latency: Duration::from_millis(60),
                ..RemoteWorkerOptions::default()
            },
        )
        .unwrap();

        for message in [3u64, 4] {
            let out = worker
                .execute(
                    &add_node(),
                    &partition,
                    None,
                    seed,
                    vec![keys.encrypt(message, 0), keys.encrypt(1, 1)],
                    0,
                )
                .unwrap();
            assert_eq!(keys.decrypt(&out).unwrap(), message + 1);
        }

        let stats = worker.stats();
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.accepted, 2);
        assert!(stats.retransmits >= 1);
        // Cached answers to the first delivery's retransmissions arrive before the second
        // delivery's completion and are discarded.
        assert!(stats.duplicates_dropped >= 1);
        assert!(stats.stale_completions >= 1);
    }

    #[test]
    fn test_worker_error_is_reported() {
        let partition = partition();
        let worker = RemoteWorker::spawn(1, "remote-1", RemoteWorkerOptions::default()).unwrap();
        let result = worker.execute(
            &add_node(),
            &partition,
            None,
            KeySeed::default(),
            vec![vec![0; 3], vec![0; 3]],
            0,
        );
        assert!(matches!(result, Err(RuntimeError::Remote { worker: 1, .. })));
    }

    /// Reference primitives that count their executions
    struct CountingPrimitives(AtomicU64);

    impl Primitives for CountingPrimitives {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(
            &self,
            op: &OpKind,
            inputs: &[&[u64]],
            keys: &OpKeys<'_>,
            nonce: u64,
        ) -> std::result::Result<Ciphertext, crate::error::PrimitiveError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ReferencePrimitives.execute(op, inputs, keys, nonce)
        }
    }

    #[test]
    fn test_worker_executes_with_configured_primitives() {
        let partition = partition();
        let seed = KeySeed::new(2, 3);
        let keys = KeySet::generate(Arc::new(partition.clone()), seed).unwrap();
        let primitives = Arc::new(CountingPrimitives(AtomicU64::new(0)));
        let worker = RemoteWorker::spawn(
            0,
            "counting",
            RemoteWorkerOptions {
                primitives: primitives.clone(),
                ..RemoteWorkerOptions::default()
            },
        )
        .unwrap();

        let out = worker
            .execute(
                &add_node(),
                &partition,
                None,
                seed,
                vec![keys.encrypt(4, 0), keys.encrypt(5, 1)],
                0,
            )
            .unwrap();
        assert_eq!(keys.decrypt(&out).unwrap(), 9);
        assert_eq!(primitives.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wire_frame_encoding() {
        let frame = WireFrame::Completion(CompletionFrame {
            delivery_id: 4,
            node: NodeId(2),
            result: Err("boom".to_string()),
        });
        let bytes = frame.encode().unwrap();
        assert_eq!(WireFrame::decode(&bytes).unwrap(), frame);
        assert!(WireFrame::decode(&[0xff; 3]).is_err());
    }
}
