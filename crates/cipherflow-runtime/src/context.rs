// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Execution Context
//!
//! One context per loaded program instance. It exclusively owns the key manager, the
//! worker pool, the device inventory and any remote workers, and is never shared across
//! programs. Teardown cancels in-flight invocations, joins remote workers and clears the
//! key cache; key sets still referenced by a running node stay alive until it drops them.

use cipherflow_config::CipherflowConfig;
use cipherflow_keys::{KeyManager, KeySeed, KeySet, Partition, PartitionId, PartitionRegistry};
use parking_lot::RwLock;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ahash::AHashMap;

use crate::backend::{
    AcceleratorBackend, AcceleratorDevice, AcceleratorStats, CpuBackend, EmulatedDevice,
    ExecutionMode, SelectionPolicy, SimulationBackend,
};
use crate::error::{Result, RuntimeError};
use crate::graph::{OpKind, TaskGraph, TaskNode};
use crate::primitives::{Primitives, ReferencePrimitives};
use crate::remote::{RemoteWorker, RemoteWorkerOptions, RemoteWorkerStats};
use crate::scheduler::{execute_graph, CancellationToken, ExecutionEnv, ExecutionOptions};
use crate::trace::ExecutionTrace;
use crate::value::{DeviceId, Value, ValueId};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Context creation options
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Worker pool size (0 = hardware concurrency, or device count in accelerator mode)
    pub parallelism: usize,
    pub enable_accelerator: bool,
    pub enable_simulation: bool,
    pub key_cache_capacity: usize,
    pub deterministic_order: bool,
    pub elide_dead_nodes: bool,
    pub key_seed: KeySeed,
    pub accelerator_selection: SelectionPolicy,
    pub cpu_fallback: bool,
    pub device_count: usize,
    pub device_memory_bytes: usize,
    pub remote_workers: usize,
    pub channel_capacity: usize,
    pub remote_ack_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            parallelism: 0,
            enable_accelerator: false,
            enable_simulation: false,
            key_cache_capacity: 32,
            deterministic_order: false,
            elide_dead_nodes: true,
            key_seed: KeySeed::default(),
            accelerator_selection: SelectionPolicy::RoundRobin,
            cpu_fallback: true,
            device_count: 1,
            device_memory_bytes: 256 * 1024 * 1024,
            remote_workers: 0,
            channel_capacity: 64,
            remote_ack_timeout: Duration::from_secs(5),
        }
    }
}

impl ContextOptions {
    /// Options from a loaded configuration
    pub fn from_config(config: &CipherflowConfig) -> Result<Self> {
        Ok(Self {
            parallelism: config.runtime.parallelism,
            enable_accelerator: config.accelerator.enabled,
            enable_simulation: config.simulation.enabled,
            key_cache_capacity: config.keys.cache_capacity,
            deterministic_order: config.runtime.deterministic_order,
            elide_dead_nodes: config.runtime.elide_dead_nodes,
            key_seed: KeySeed::new(config.keys.secret_seed, config.keys.encryption_seed),
            accelerator_selection: config.accelerator.selection.parse()?,
            cpu_fallback: config.accelerator.cpu_fallback,
            device_count: config.accelerator.device_count,
            device_memory_bytes: usize::try_from(config.accelerator.device_memory_bytes)
                .unwrap_or(usize::MAX),
            remote_workers: config.distributed.remote_workers,
            channel_capacity: config.distributed.channel_capacity,
            remote_ack_timeout: Duration::from_millis(config.distributed.ack_timeout_ms),
            ..Self::default()
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.enable_simulation {
            ExecutionMode::Simulation
        } else if self.enable_accelerator {
            ExecutionMode::Accelerator
        } else {
            ExecutionMode::Cpu
        }
    }

    fn validate(&self) -> Result<()> {
        if self.enable_accelerator && self.enable_simulation {
            return Err(RuntimeError::Initialization(
                "accelerator and simulation modes are mutually exclusive".to_string(),
            ));
        }
        if self.key_cache_capacity == 0 {
            return Err(RuntimeError::Initialization(
                "key cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for contexts with custom devices or primitives
pub struct ContextBuilder {
    options: ContextOptions,
    devices: Vec<Arc<dyn AcceleratorDevice>>,
    primitives: Option<Arc<dyn Primitives>>,
}

impl ContextBuilder {
    pub fn new(options: ContextOptions) -> Self {
        Self {
            options,
            devices: Vec::new(),
            primitives: None,
        }
    }

    /// Register a device; replaces the emulated inventory
    pub fn with_device(mut self, device: Arc<dyn AcceleratorDevice>) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_primitives(mut self, primitives: Arc<dyn Primitives>) -> Self {
        self.primitives = Some(primitives);
        self
    }

    pub fn build(self) -> Result<Context> {
        let options = self.options;
        options.validate()?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mode = options.mode();
        let primitives = self
            .primitives
            .unwrap_or_else(|| Arc::new(ReferencePrimitives));

        let accelerator = if mode == ExecutionMode::Accelerator {
            let devices = if self.devices.is_empty() {
                (0..options.device_count)
                    .map(|index| {
                        Arc::new(EmulatedDevice::with_primitives(
                            DeviceId(index as u32),
                            options.device_memory_bytes,
                            Arc::clone(&primitives),
                        )) as Arc<dyn AcceleratorDevice>
                    })
                    .collect()
            } else {
                self.devices
            };
            if devices.is_empty() {
                warn!(context = id, "Accelerator enabled without devices, nodes run on the CPU");
            }
            Some(AcceleratorBackend::new(devices, options.accelerator_selection))
        } else {
            None
        };

        let threads = match options.parallelism {
            0 => match &accelerator {
                Some(accelerator) if accelerator.has_devices() => accelerator.devices().len(),
                _ => std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            },
            n => n,
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("cipherflow-ctx{}-worker-{}", id, index))
            .build()
            .map_err(|e| RuntimeError::Initialization(format!("worker pool: {}", e)))?;

        let remotes = (0..options.remote_workers)
            .map(|index| {
                RemoteWorker::spawn(
                    index,
                    format!("cipherflow-ctx{}-remote-{}", id, index),
                    RemoteWorkerOptions {
                        primitives: Arc::clone(&primitives),
                        key_cache_capacity: options.key_cache_capacity,
                        channel_capacity: options.channel_capacity,
                        ack_timeout: options.remote_ack_timeout,
                        ..RemoteWorkerOptions::default()
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            context = id,
            mode = %mode,
            workers = threads,
            devices = accelerator.as_ref().map_or(0, |a| a.devices().len()),
            remotes = remotes.len(),
            primitives = primitives.name(),
            "Execution context created"
        );

        Ok(Context {
            id,
            mode,
            keys: KeyManager::new(options.key_cache_capacity),
            partitions: RwLock::new(PartitionRegistry::new()),
            pool,
            cpu: CpuBackend::new(primitives),
            accelerator,
            simulation: SimulationBackend::new(),
            remotes,
            epoch: Arc::new(AtomicU64::new(0)),
            torn_down: false,
            options,
        })
    }
}

/// Process-local execution context
pub struct Context {
    id: u64,
    options: ContextOptions,
    mode: ExecutionMode,
    keys: KeyManager,
    /// Partitions registered through the ABI
    partitions: RwLock<PartitionRegistry>,
    pool: ThreadPool,
    cpu: CpuBackend,
    accelerator: Option<AcceleratorBackend>,
    simulation: SimulationBackend,
    remotes: Vec<RemoteWorker>,
    epoch: Arc<AtomicU64>,
    torn_down: bool,
}

impl Context {
    pub fn create(options: ContextOptions) -> Result<Self> {
        ContextBuilder::new(options).build()
    }

    pub fn builder(options: ContextOptions) -> ContextBuilder {
        ContextBuilder::new(options)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    /// Key set of `partition` under the context's seed
    pub fn key_set(&self, partition: &Arc<Partition>) -> Result<Arc<KeySet>> {
        Ok(self.keys.get_or_create(partition, self.options.key_seed)?)
    }

    pub fn accelerator_stats(&self) -> Option<AcceleratorStats> {
        self.accelerator.as_ref().map(AcceleratorBackend::stats)
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn remote_stats(&self) -> Vec<RemoteWorkerStats> {
        self.remotes.iter().map(RemoteWorker::stats).collect()
    }

    pub fn register_partition(&self, partition: Partition) -> Result<PartitionId> {
        Ok(self.partitions.write().register(partition)?)
    }

    pub fn partition(&self, id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions.read().get(id).cloned()
    }

    pub fn partition_id(&self, name: &str) -> Option<PartitionId> {
        self.partitions.read().id_of(name)
    }

    /// Token observing this context's cancellation
    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken::linked(Arc::clone(&self.epoch))
    }

    /// Cancel every invocation currently running on this context
    ///
    /// Running nodes finish; nothing new starts. Later invocations are unaffected.
    pub fn cancel_in_flight(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(context = self.id, epoch, "Cancelling in-flight invocations");
    }

    /// Run a graph whose partition ids refer to `partitions`
    pub(crate) fn execute(
        &self,
        graph: &TaskGraph,
        partitions: &PartitionRegistry,
        arguments: AHashMap<ValueId, Value>,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> (Result<AHashMap<ValueId, Value>>, ExecutionTrace) {
        if self.torn_down {
            return (Err(RuntimeError::ContextShutDown), ExecutionTrace::default());
        }
        let env = ExecutionEnv {
            partitions,
            keys: &self.keys,
            key_seed: self.options.key_seed,
            mode: self.mode,
            cpu: &self.cpu,
            accelerator: self.accelerator.as_ref(),
            simulation: &self.simulation,
            remotes: &self.remotes,
            cpu_fallback: self.options.cpu_fallback,
            pool: &self.pool,
            cancel,
        };
        execute_graph(graph, arguments, options, &env)
    }

    /// Run a single operation on values of a registered partition
    pub fn run_op(&self, op: OpKind, partition: PartitionId, inputs: Vec<Value>) -> Result<Value> {
        let output = ValueId(inputs.len() as u32);
        let node = TaskNode::new(
            0,
            op,
            (0..inputs.len() as u32).map(ValueId).collect(),
            output,
            partition,
        );
        let input_partition = node.input_partition();
        let arguments: Vec<(ValueId, PartitionId)> = node
            .inputs
            .iter()
            .map(|&value| (value, input_partition))
            .collect();
        let values = node.inputs.iter().copied().zip(inputs).collect();
        let graph = TaskGraph::new(vec![node], arguments)?;

        let options = ExecutionOptions {
            deterministic_order: true,
            ..ExecutionOptions::new(vec![output])
        };
        let registry = self.partitions.read();
        let (result, _) = self.execute(
            &graph,
            &registry,
            values,
            &options,
            self.cancellation_token(),
        );
        result?
            .remove(&output)
            .ok_or(RuntimeError::UnknownValue(output))
    }

    /// Cancel, join remote workers and release key material
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let remotes = self.remotes.len();
        self.remotes.clear();
        let released = self.keys.clear();
        info!(
            context = self.id,
            remotes,
            released_key_sets = released,
            "Execution context shut down"
        );
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("workers", &self.pool.current_num_threads())
            .field("accelerator", &self.accelerator)
            .field("remotes", &self.remotes.len())
            .field("keys", &self.keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_context() -> Context {
        Context::create(ContextOptions {
            parallelism: 2,
            ..ContextOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_run_op_on_registered_partition() {
        let ctx = cpu_context();
        let id = ctx
            .register_partition(Partition::builder("P", 1, 1, 256).build().unwrap())
            .unwrap();
        let keys = ctx.key_set(&ctx.partition(id).unwrap()).unwrap();

        let out = ctx
            .run_op(
                OpKind::Add,
                id,
                vec![
                    Value::Ciphertext(keys.encrypt(6, 0)),
                    Value::Ciphertext(keys.encrypt(5, 1)),
                ],
            )
            .unwrap();
        assert_eq!(keys.decrypt(out.as_ciphertext().unwrap()).unwrap(), 11);
        assert_eq!(ctx.key_manager().stats().generations, 1);
    }

    #[test]
    fn test_unknown_partition() {
        let ctx = cpu_context();
        let err = ctx
            .run_op(OpKind::Neg, PartitionId(9), vec![Value::Cleartext(1)])
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownPartition("partition#9".to_string()));
    }

    #[test]
    fn test_invalid_option_combinations() {
        let both = ContextOptions {
            enable_accelerator: true,
            enable_simulation: true,
            ..ContextOptions::default()
        };
        assert!(matches!(
            Context::create(both),
            Err(RuntimeError::Initialization(_))
        ));

        let no_cache = ContextOptions {
            key_cache_capacity: 0,
            ..ContextOptions::default()
        };
        assert!(Context::create(no_cache).is_err());
    }

    #[test]
    fn test_accelerator_pool_sized_to_devices() {
        let ctx = Context::create(ContextOptions {
            enable_accelerator: true,
            device_count: 3,
            ..ContextOptions::default()
        })
        .unwrap();
        assert_eq!(ctx.mode(), ExecutionMode::Accelerator);
        assert_eq!(ctx.worker_count(), 3);
        assert_eq!(ctx.accelerator_stats(), Some(AcceleratorStats::default()));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = CipherflowConfig::default();
        config.runtime.deterministic_order = true;
        config.accelerator.selection = "least_loaded".to_string();
        config.keys.secret_seed = 7;
        config.distributed.ack_timeout_ms = 150;

        let options = ContextOptions::from_config(&config).unwrap();
        assert!(options.deterministic_order);
        assert_eq!(options.accelerator_selection, SelectionPolicy::LeastLoaded);
        assert_eq!(options.key_seed, KeySeed::new(7, 0));
        assert_eq!(options.remote_ack_timeout, Duration::from_millis(150));

        config.accelerator.selection = "fastest".to_string();
        assert!(ContextOptions::from_config(&config).is_err());
    }

    #[test]
    fn test_shutdown_clears_keys_and_cancels_tokens() {
        let ctx = cpu_context();
        let partition = Arc::new(Partition::builder("P", 1, 1, 256).build().unwrap());
        let held = ctx.key_set(&partition).unwrap();
        let token = ctx.cancellation_token();
        assert_eq!(ctx.key_manager().len(), 1);

        ctx.cancel_in_flight();
        assert!(token.is_cancelled());
        assert!(!ctx.cancellation_token().is_cancelled());

        ctx.shutdown();
        // Key material outlives the cache while still referenced
        assert_eq!(held.partition().name, "P");
    }
}
