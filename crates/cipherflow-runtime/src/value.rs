// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Identifiers, values and value buffers

use cipherflow_keys::{Ciphertext, PartitionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::backend::AcceleratorDevice;

/// Task node identifier; also the deterministic tie-break key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Value (edge) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Accelerator device index within one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Approximate value propagated by the simulation backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimValue {
    /// Cleartext the ciphertext would decrypt to
    pub shadow: u64,
    /// Noise variance as a squared torus fraction
    pub variance: f64,
}

impl SimValue {
    pub fn new(shadow: u64, variance: f64) -> Self {
        Self { shadow, variance }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Host-side value supplied to or returned from a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Ciphertext(Ciphertext),
    Cleartext(u64),
    Simulated(SimValue),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Ciphertext(_) => "ciphertext",
            Value::Cleartext(_) => "cleartext",
            Value::Simulated(_) => "simulated",
        }
    }

    pub fn as_ciphertext(&self) -> Option<&Ciphertext> {
        match self {
            Value::Ciphertext(ciphertext) => Some(ciphertext),
            _ => None,
        }
    }

    pub fn as_simulated(&self) -> Option<SimValue> {
        match self {
            Value::Simulated(value) => Some(*value),
            _ => None,
        }
    }

    /// Size of the payload in u64 words
    pub fn words(&self) -> usize {
        match self {
            Value::Ciphertext(ciphertext) => ciphertext.len(),
            Value::Cleartext(_) => 1,
            Value::Simulated(_) => 2,
        }
    }
}

/// Raw handle to a buffer resident on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub device: DeviceId,
    pub slot: u64,
    pub words: usize,
}

impl DeviceHandle {
    pub fn size_bytes(&self) -> usize {
        self.words * std::mem::size_of::<u64>()
    }
}

/// Owned device allocation, freed on the device when dropped
pub struct DeviceBuffer {
    handle: DeviceHandle,
    device: Arc<dyn AcceleratorDevice>,
}

impl DeviceBuffer {
    pub fn new(handle: DeviceHandle, device: Arc<dyn AcceleratorDevice>) -> Self {
        Self { handle, device }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn device(&self) -> &Arc<dyn AcceleratorDevice> {
        &self.device
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.free(self.handle);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Where a buffer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    Device(DeviceId),
}

/// Buffer payload: host value or device allocation
#[derive(Debug)]
pub enum BufferData {
    Host(Value),
    Device(DeviceBuffer),
}

/// Materialized value produced by exactly one node (or bound as an argument)
#[derive(Debug)]
pub struct ValueBuffer {
    pub value_id: ValueId,
    pub partition: PartitionId,
    pub data: BufferData,
}

impl ValueBuffer {
    pub fn host(value_id: ValueId, partition: PartitionId, value: Value) -> Self {
        Self {
            value_id,
            partition,
            data: BufferData::Host(value),
        }
    }

    pub fn location(&self) -> Location {
        match &self.data {
            BufferData::Host(_) => Location::Host,
            BufferData::Device(buffer) => Location::Device(buffer.handle().device),
        }
    }

    pub fn host_value(&self) -> Option<&Value> {
        match &self.data {
            BufferData::Host(value) => Some(value),
            BufferData::Device(_) => None,
        }
    }

    pub fn words(&self) -> usize {
        match &self.data {
            BufferData::Host(value) => value.words(),
            BufferData::Device(buffer) => buffer.handle().words,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        let ciphertext = Value::Ciphertext(vec![1, 2, 3]);
        assert_eq!(ciphertext.kind(), "ciphertext");
        assert_eq!(ciphertext.words(), 3);
        assert!(ciphertext.as_simulated().is_none());

        let simulated = Value::Simulated(SimValue::new(4, 0.25));
        assert_eq!(simulated.as_simulated().unwrap().std_dev(), 0.5);
    }

    #[test]
    fn test_host_buffer_location() {
        let buffer = ValueBuffer::host(ValueId(1), PartitionId(0), Value::Cleartext(9));
        assert_eq!(buffer.location(), Location::Host);
        assert_eq!(buffer.host_value(), Some(&Value::Cleartext(9)));
        assert_eq!(format!("{}", buffer.value_id), "v1");
    }
}
