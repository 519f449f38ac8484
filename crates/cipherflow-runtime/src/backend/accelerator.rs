// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Accelerator Backend
//!
//! Offloads accelerator-eligible nodes to devices. Every host/device movement is an
//! explicit `upload` or `download` at a node boundary; device allocations are owned by
//! [`DeviceBuffer`]s and released when the last reference drops.
//!
//! [`EmulatedDevice`] is the built-in device: host memory with a fixed byte capacity, so
//! exhaustion and fallback behave as on real hardware.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{DeviceError, RuntimeError};
use crate::graph::OpKind;
use crate::primitives::{OpKeys, Primitives, ReferencePrimitives};
use crate::value::{BufferData, DeviceBuffer, DeviceHandle, DeviceId, Value, ValueBuffer};

/// One accelerator device
pub trait AcceleratorDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    fn name(&self) -> &str;

    /// Copy host words into a new device allocation
    fn upload(&self, words: &[u64]) -> Result<DeviceHandle, DeviceError>;

    /// Copy a device allocation back to the host
    fn download(&self, handle: DeviceHandle) -> Result<Vec<u64>, DeviceError>;

    /// Run `op` on resident inputs, producing a new resident output
    fn execute(
        &self,
        op: &OpKind,
        inputs: &[DeviceHandle],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<DeviceHandle, DeviceError>;

    /// Release an allocation; unknown handles are ignored
    fn free(&self, handle: DeviceHandle);

    /// Bytes currently allocated
    fn load_bytes(&self) -> usize;

    fn capacity_bytes(&self) -> usize;
}

#[derive(Default)]
struct DeviceMemory {
    buffers: AHashMap<u64, Vec<u64>>,
    next_slot: u64,
    used_bytes: usize,
}

/// Host-memory device with a byte capacity
pub struct EmulatedDevice {
    id: DeviceId,
    name: String,
    capacity_bytes: usize,
    primitives: Arc<dyn Primitives>,
    memory: Mutex<DeviceMemory>,
    faulted: AtomicBool,
}

impl EmulatedDevice {
    pub fn new(id: DeviceId, capacity_bytes: usize) -> Self {
        Self::with_primitives(id, capacity_bytes, Arc::new(ReferencePrimitives))
    }

    pub fn with_primitives(
        id: DeviceId,
        capacity_bytes: usize,
        primitives: Arc<dyn Primitives>,
    ) -> Self {
        Self {
            id,
            name: format!("emulated-{}", id.0),
            capacity_bytes,
            primitives,
            memory: Mutex::new(DeviceMemory::default()),
            faulted: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail until cleared
    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::Relaxed);
    }

    /// Number of live allocations
    pub fn allocations(&self) -> usize {
        self.memory.lock().buffers.len()
    }

    fn check_fault(&self) -> Result<(), DeviceError> {
        if self.faulted.load(Ordering::Relaxed) {
            return Err(DeviceError::Faulted {
                device: self.id,
                reason: "device marked faulted".to_string(),
            });
        }
        Ok(())
    }

    fn allocate(&self, words: Vec<u64>) -> Result<DeviceHandle, DeviceError> {
        let bytes = words.len() * std::mem::size_of::<u64>();
        let mut memory = self.memory.lock();
        let available = self.capacity_bytes.saturating_sub(memory.used_bytes);
        if bytes > available {
            return Err(DeviceError::OutOfMemory {
                device: self.id,
                requested: bytes,
                available,
            });
        }
        let slot = memory.next_slot;
        memory.next_slot += 1;
        memory.used_bytes += bytes;
        let handle = DeviceHandle {
            device: self.id,
            slot,
            words: words.len(),
        };
        memory.buffers.insert(slot, words);
        Ok(handle)
    }

    fn read(&self, handle: DeviceHandle) -> Result<Vec<u64>, DeviceError> {
        self.memory
            .lock()
            .buffers
            .get(&handle.slot)
            .cloned()
            .ok_or(DeviceError::InvalidHandle {
                device: self.id,
                handle: handle.slot,
            })
    }
}

impl AcceleratorDevice for EmulatedDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn upload(&self, words: &[u64]) -> Result<DeviceHandle, DeviceError> {
        self.check_fault()?;
        self.allocate(words.to_vec())
    }

    fn download(&self, handle: DeviceHandle) -> Result<Vec<u64>, DeviceError> {
        self.check_fault()?;
        self.read(handle)
    }

    fn execute(
        &self,
        op: &OpKind,
        inputs: &[DeviceHandle],
        keys: &OpKeys<'_>,
        nonce: u64,
    ) -> Result<DeviceHandle, DeviceError> {
        self.check_fault()?;
        let resident = inputs
            .iter()
            .map(|&handle| self.read(handle))
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<&[u64]> = resident.iter().map(|words| words.as_slice()).collect();

        let output = self
            .primitives
            .execute(op, &views, keys, nonce)
            .map_err(|e| DeviceError::Kernel {
                device: self.id,
                reason: e.to_string(),
            })?;
        self.allocate(output)
    }

    fn free(&self, handle: DeviceHandle) {
        let mut memory = self.memory.lock();
        if let Some(words) = memory.buffers.remove(&handle.slot) {
            memory.used_bytes -= words.len() * std::mem::size_of::<u64>();
        }
    }

    fn load_bytes(&self) -> usize {
        self.memory.lock().used_bytes
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

/// Device selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    /// Device with the fewest resident bytes; ties go to the lowest id
    LeastLoaded,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(SelectionPolicy::RoundRobin),
            "least_loaded" | "least-loaded" => Ok(SelectionPolicy::LeastLoaded),
            _ => Err(RuntimeError::Initialization(format!(
                "unknown device selection policy '{}'",
                s
            ))),
        }
    }
}

/// Snapshot of accelerator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceleratorStats {
    pub uploads: u64,
    pub downloads: u64,
    pub bytes_to_device: u64,
    pub bytes_to_host: u64,
    pub executions: u64,
    pub cpu_fallbacks: u64,
}

/// Device inventory plus dispatch policy for one context
pub struct AcceleratorBackend {
    devices: Vec<Arc<dyn AcceleratorDevice>>,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
    uploads: AtomicU64,
    downloads: AtomicU64,
    bytes_to_device: AtomicU64,
    bytes_to_host: AtomicU64,
    executions: AtomicU64,
    cpu_fallbacks: AtomicU64,
}

impl AcceleratorBackend {
    pub fn new(devices: Vec<Arc<dyn AcceleratorDevice>>, policy: SelectionPolicy) -> Self {
        Self {
            devices,
            policy,
            cursor: AtomicUsize::new(0),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            bytes_to_device: AtomicU64::new(0),
            bytes_to_host: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            cpu_fallbacks: AtomicU64::new(0),
        }
    }

    /// Inventory of `count` emulated devices with `capacity_bytes` each
    pub fn emulated(count: usize, capacity_bytes: usize, policy: SelectionPolicy) -> Self {
        let devices = (0..count)
            .map(|index| {
                Arc::new(EmulatedDevice::new(DeviceId(index as u32), capacity_bytes))
                    as Arc<dyn AcceleratorDevice>
            })
            .collect();
        Self::new(devices, policy)
    }

    pub fn devices(&self) -> &[Arc<dyn AcceleratorDevice>] {
        &self.devices
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn select_device(&self) -> Result<Arc<dyn AcceleratorDevice>, DeviceError> {
        if self.devices.is_empty() {
            return Err(DeviceError::NoDevice);
        }
        let device = match self.policy {
            SelectionPolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.devices.len();
                &self.devices[index]
            }
            SelectionPolicy::LeastLoaded => self
                .devices
                .iter()
                .min_by_key(|device| (device.load_bytes(), device.id()))
                .ok_or(DeviceError::NoDevice)?,
        };
        Ok(Arc::clone(device))
    }

    /// Run one node on a selected device
    ///
    /// Host inputs are uploaded and inputs resident on another device are moved through the
    /// host. With `keep_resident` the output stays on the device; otherwise it is downloaded
    /// and the device copy released.
    pub fn execute(
        &self,
        op: &OpKind,
        inputs: &[&ValueBuffer],
        keys: &OpKeys<'_>,
        nonce: u64,
        keep_resident: bool,
    ) -> Result<(BufferData, DeviceId), DeviceError> {
        let device = self.select_device()?;
        let mut staged: Vec<DeviceBuffer> = Vec::new();
        let mut handles = Vec::with_capacity(inputs.len());

        for input in inputs {
            match &input.data {
                BufferData::Device(buffer) if buffer.handle().device == device.id() => {
                    handles.push(buffer.handle());
                }
                BufferData::Device(buffer) => {
                    let words = self.download(buffer)?;
                    let staged_buffer = self.upload(&device, &words)?;
                    handles.push(staged_buffer.handle());
                    staged.push(staged_buffer);
                }
                BufferData::Host(Value::Ciphertext(words)) => {
                    let staged_buffer = self.upload(&device, words)?;
                    handles.push(staged_buffer.handle());
                    staged.push(staged_buffer);
                }
                BufferData::Host(other) => {
                    return Err(DeviceError::Kernel {
                        device: device.id(),
                        reason: format!("cannot upload a {} value", other.kind()),
                    });
                }
            }
        }

        let output = device.execute(op, &handles, keys, nonce)?;
        self.executions.fetch_add(1, Ordering::Relaxed);
        let output = DeviceBuffer::new(output, Arc::clone(&device));
        drop(staged);

        trace!(device = %device.id(), op = op.name(), keep_resident, "Device execution");

        if keep_resident {
            Ok((BufferData::Device(output), device.id()))
        } else {
            let words = self.download(&output)?;
            Ok((BufferData::Host(Value::Ciphertext(words)), device.id()))
        }
    }

    /// Host copy of a buffer, downloading it if resident
    pub fn to_host(&self, buffer: &ValueBuffer) -> Result<Value, DeviceError> {
        match &buffer.data {
            BufferData::Host(value) => Ok(value.clone()),
            BufferData::Device(resident) => Ok(Value::Ciphertext(self.download(resident)?)),
        }
    }

    pub fn record_fallback(&self) {
        self.cpu_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AcceleratorStats {
        AcceleratorStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            cpu_fallbacks: self.cpu_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn upload(
        &self,
        device: &Arc<dyn AcceleratorDevice>,
        words: &[u64],
    ) -> Result<DeviceBuffer, DeviceError> {
        let handle = device.upload(words)?;
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_device
            .fetch_add(handle.size_bytes() as u64, Ordering::Relaxed);
        Ok(DeviceBuffer::new(handle, Arc::clone(device)))
    }

    fn download(&self, buffer: &DeviceBuffer) -> Result<Vec<u64>, DeviceError> {
        let words = buffer.device().download(buffer.handle())?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_host
            .fetch_add(buffer.handle().size_bytes() as u64, Ordering::Relaxed);
        Ok(words)
    }
}

impl std::fmt::Debug for AcceleratorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorBackend")
            .field("devices", &self.devices.len())
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for AcceleratorBackend {
    fn drop(&mut self) {
        for device in &self.devices {
            let resident = device.load_bytes();
            if resident > 0 {
                debug!(device = %device.id(), resident, "Device memory still allocated at teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueId;
    use cipherflow_keys::{KeySeed, KeySet, Partition, PartitionId};

    fn keys() -> KeySet {
        let partition = Arc::new(Partition::builder("P", 1, 1, 256).build().unwrap());
        KeySet::generate(partition, KeySeed::new(1, 1)).unwrap()
    }

    fn host(keys: &KeySet, message: u64) -> ValueBuffer {
        ValueBuffer::host(
            ValueId(0),
            PartitionId(0),
            Value::Ciphertext(keys.encrypt(message, message)),
        )
    }

    fn op_keys(keys: &KeySet) -> OpKeys<'_> {
        OpKeys {
            output: keys,
            input: None,
        }
    }

    #[test]
    fn test_execute_downloads_and_frees() {
        let keys = keys();
        let backend = AcceleratorBackend::emulated(1, 1 << 20, SelectionPolicy::RoundRobin);
        let (a, b) = (host(&keys, 2), host(&keys, 3));

        let (data, device) = backend
            .execute(&OpKind::Add, &[&a, &b], &op_keys(&keys), 0, false)
            .unwrap();
        assert_eq!(device, DeviceId(0));

        match data {
            BufferData::Host(Value::Ciphertext(words)) => {
                assert_eq!(keys.decrypt(&words).unwrap(), 5)
            }
            other => panic!("expected host ciphertext, got {:?}", other),
        }

        let stats = backend.stats();
        assert_eq!(stats.uploads, 2);
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.executions, 1);
        // Staged inputs and the downloaded output are released
        assert_eq!(backend.devices()[0].load_bytes(), 0);
    }

    #[test]
    fn test_resident_output_reused_without_upload() {
        let keys = keys();
        let backend = AcceleratorBackend::emulated(1, 1 << 20, SelectionPolicy::RoundRobin);
        let a = host(&keys, 4);

        let (data, _) = backend
            .execute(&OpKind::Neg, &[&a], &op_keys(&keys), 0, true)
            .unwrap();
        let resident = ValueBuffer {
            value_id: ValueId(1),
            partition: PartitionId(0),
            data,
        };
        assert!(backend.devices()[0].load_bytes() > 0);

        let (data, _) = backend
            .execute(&OpKind::Neg, &[&resident], &op_keys(&keys), 0, false)
            .unwrap();
        assert_eq!(backend.stats().uploads, 1);
        if let BufferData::Host(Value::Ciphertext(words)) = data {
            assert_eq!(keys.decrypt(&words).unwrap(), 4);
        } else {
            panic!("expected host output");
        }

        drop(resident);
        assert_eq!(backend.devices()[0].load_bytes(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let keys = keys();
        // Room for one ciphertext of 257 words, not two
        let backend = AcceleratorBackend::emulated(1, 257 * 8 + 8, SelectionPolicy::RoundRobin);
        let (a, b) = (host(&keys, 1), host(&keys, 1));

        let result = backend.execute(&OpKind::Add, &[&a, &b], &op_keys(&keys), 0, false);
        assert!(matches!(result, Err(DeviceError::OutOfMemory { .. })));
        // The partially staged upload was released
        assert_eq!(backend.devices()[0].load_bytes(), 0);
    }

    #[test]
    fn test_round_robin_and_least_loaded() {
        let round_robin = AcceleratorBackend::emulated(3, 1024, SelectionPolicy::RoundRobin);
        let picked: Vec<u32> = (0..4)
            .map(|_| round_robin.select_device().unwrap().id().0)
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0]);

        let least_loaded = AcceleratorBackend::emulated(2, 1024, SelectionPolicy::LeastLoaded);
        let held = least_loaded.devices()[0].upload(&[1, 2, 3]).unwrap();
        assert_eq!(least_loaded.select_device().unwrap().id(), DeviceId(1));
        least_loaded.devices()[0].free(held);
        assert_eq!(least_loaded.select_device().unwrap().id(), DeviceId(0));
    }

    #[test]
    fn test_faulted_device() {
        let device = EmulatedDevice::new(DeviceId(0), 1024);
        device.set_faulted(true);
        assert!(matches!(
            device.upload(&[1]),
            Err(DeviceError::Faulted { .. })
        ));
        device.set_faulted(false);
        assert!(device.upload(&[1]).is_ok());
        assert_eq!(device.allocations(), 1);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "least_loaded".parse::<SelectionPolicy>().unwrap(),
            SelectionPolicy::LeastLoaded
        );
        assert!("random".parse::<SelectionPolicy>().is_err());
    }
}
