// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Execution trace of one graph invocation

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::value::{DeviceId, NodeId};

/// Backend that executed a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Accelerator(DeviceId),
    Simulation,
    Remote(usize),
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "CPU"),
            BackendKind::Accelerator(device) => write!(f, "Accelerator({})", device),
            BackendKind::Simulation => write!(f, "Simulation"),
            BackendKind::Remote(worker) => write!(f, "Remote({})", worker),
        }
    }
}

/// Timing and placement of one executed node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub node: NodeId,
    pub backend: BackendKind,
    /// Device attempt failed and the node ran on the CPU instead
    pub fell_back: bool,
    /// Offset from the start of the invocation
    pub started_at: Duration,
    pub elapsed: Duration,
}

/// Outcome of one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionTrace {
    /// Nodes in the order they were dispatched
    pub started: Vec<NodeId>,
    /// Nodes in the order they finished successfully
    pub completed: Vec<NodeId>,
    /// Completed after the graph failed; results discarded
    pub discarded: Vec<NodeId>,
    /// Live nodes never started because the graph failed or was cancelled
    pub skipped: Vec<NodeId>,
    /// Nodes unreachable from the requested outputs
    pub elided: Vec<NodeId>,
    pub failed: Option<NodeId>,
    pub records: Vec<NodeRecord>,
    pub fallbacks: usize,
    pub peak_live_buffers: usize,
    pub total: Duration,
}

impl ExecutionTrace {
    /// Number of nodes whose operation actually ran
    pub fn executed(&self) -> usize {
        self.records.len()
    }

    pub fn record_for(&self, node: NodeId) -> Option<&NodeRecord> {
        self.records.iter().find(|record| record.node == node)
    }
}

/// Thread-safe trace builder used while an invocation runs
pub(crate) struct TraceRecorder {
    origin: Instant,
    trace: Mutex<ExecutionTrace>,
}

impl TraceRecorder {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            trace: Mutex::new(ExecutionTrace::default()),
        }
    }

    pub(crate) fn offset(&self) -> Duration {
        self.origin.elapsed()
    }

    pub(crate) fn started(&self, node: NodeId) {
        self.trace.lock().started.push(node);
    }

    pub(crate) fn finished(&self, record: NodeRecord, discarded: bool) {
        let mut trace = self.trace.lock();
        if record.fell_back {
            trace.fallbacks += 1;
        }
        if discarded {
            trace.discarded.push(record.node);
        }
        trace.completed.push(record.node);
        trace.records.push(record);
    }

    pub(crate) fn failed(&self, node: NodeId, record: Option<NodeRecord>) {
        let mut trace = self.trace.lock();
        if trace.failed.is_none() {
            trace.failed = Some(node);
        }
        if let Some(record) = record {
            if record.fell_back {
                trace.fallbacks += 1;
            }
            trace.records.push(record);
        }
    }

    pub(crate) fn finish(
        self,
        elided: Vec<NodeId>,
        skipped: Vec<NodeId>,
        peak_live_buffers: usize,
    ) -> ExecutionTrace {
        let total = self.origin.elapsed();
        let mut trace = self.trace.into_inner();
        trace.elided = elided;
        trace.skipped = skipped;
        trace.peak_live_buffers = peak_live_buffers;
        trace.total = total;
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: u32, fell_back: bool) -> NodeRecord {
        NodeRecord {
            node: NodeId(node),
            backend: BackendKind::Cpu,
            fell_back,
            started_at: Duration::ZERO,
            elapsed: Duration::from_micros(5),
        }
    }

    #[test]
    fn test_recorder_collects_outcomes() {
        let recorder = TraceRecorder::new();
        recorder.started(NodeId(0));
        recorder.started(NodeId(1));
        recorder.finished(record(0, true), false);
        recorder.failed(NodeId(1), None);

        let trace = recorder.finish(vec![NodeId(5)], vec![NodeId(2)], 3);
        assert_eq!(trace.started, vec![NodeId(0), NodeId(1)]);
        assert_eq!(trace.completed, vec![NodeId(0)]);
        assert_eq!(trace.failed, Some(NodeId(1)));
        assert_eq!(trace.fallbacks, 1);
        assert_eq!(trace.executed(), 1);
        assert_eq!(trace.elided, vec![NodeId(5)]);
        assert!(trace.record_for(NodeId(0)).is_some());
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(
            BackendKind::Accelerator(DeviceId(2)).to_string(),
            "Accelerator(dev2)"
        );
        assert_eq!(BackendKind::Remote(1).to_string(), "Remote(1)");
    }
}
