// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation buffer arena
//!
//! One slot per graph value. Each slot carries the number of reads still owed to it
//! (one per consuming input edge, plus one if the value is a requested output); the
//! buffer is dropped when that count reaches zero.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::value::ValueBuffer;

struct Slot {
    buffer: Option<Arc<ValueBuffer>>,
    remaining: usize,
}

/// Arena counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub stored: usize,
    pub freed: usize,
    pub peak_live: usize,
}

pub struct BufferArena {
    slots: Mutex<Vec<Slot>>,
    stats: Mutex<ArenaStats>,
}

impl BufferArena {
    /// Create an arena with the given outstanding read count per slot
    pub fn new(consumer_counts: Vec<usize>) -> Self {
        let slots = consumer_counts
            .into_iter()
            .map(|remaining| Slot {
                buffer: None,
                remaining,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            stats: Mutex::new(ArenaStats::default()),
        }
    }

    /// Store a freshly produced buffer
    ///
    /// A buffer nobody will read is dropped immediately.
    pub fn store(&self, slot: usize, buffer: ValueBuffer) {
        let mut slots = self.slots.lock();
        let mut stats = self.stats.lock();
        stats.stored += 1;
        if slots[slot].remaining == 0 {
            stats.freed += 1;
            return;
        }
        slots[slot].buffer = Some(Arc::new(buffer));
        let live = slots.iter().filter(|s| s.buffer.is_some()).count();
        stats.peak_live = stats.peak_live.max(live);
    }

    /// Shared read access to a stored buffer
    pub fn get(&self, slot: usize) -> Option<Arc<ValueBuffer>> {
        self.slots.lock()[slot].buffer.clone()
    }

    /// Record one completed read; frees the buffer after its last read
    pub fn release(&self, slot: usize) {
        let freed = {
            let mut slots = self.slots.lock();
            let entry = &mut slots[slot];
            entry.remaining = entry.remaining.saturating_sub(1);
            if entry.remaining == 0 {
                entry.buffer.take()
            } else {
                None
            }
        };
        if freed.is_some() {
            self.stats.lock().freed += 1;
        }
        // Dropping the last Arc releases host memory or the device allocation
        drop(freed);
    }

    /// Remove a requested output, consuming its final read
    pub fn take(&self, slot: usize) -> Option<Arc<ValueBuffer>> {
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot];
        entry.remaining = entry.remaining.saturating_sub(1);
        entry.buffer.take()
    }

    /// Number of buffers currently held
    pub fn live(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.buffer.is_some())
            .count()
    }

    /// Drop every remaining buffer, returning how many were released
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<ValueBuffer>> = self
            .slots
            .lock()
            .iter_mut()
            .filter_map(|slot| slot.buffer.take())
            .collect();
        let count = drained.len();
        self.stats.lock().freed += count;
        count
    }

    pub fn stats(&self) -> ArenaStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueId};
    use cipherflow_keys::PartitionId;

    fn buffer(value: u64) -> ValueBuffer {
        ValueBuffer::host(ValueId(0), PartitionId(0), Value::Cleartext(value))
    }

    #[test]
    fn test_freed_after_last_consumer() {
        let arena = BufferArena::new(vec![2]);
        arena.store(0, buffer(7));

        let held = arena.get(0).unwrap();
        arena.release(0);
        assert_eq!(arena.live(), 1);
        arena.release(0);
        assert_eq!(arena.live(), 0);

        // Readers keep their shared reference after the arena lets go
        assert_eq!(held.host_value(), Some(&Value::Cleartext(7)));
        assert_eq!(arena.stats().freed, 1);
    }

    #[test]
    fn test_unread_buffer_dropped_on_store() {
        let arena = BufferArena::new(vec![0]);
        arena.store(0, buffer(1));
        assert!(arena.get(0).is_none());
        assert_eq!(arena.stats().freed, 1);
    }

    #[test]
    fn test_take_output_and_clear() {
        let arena = BufferArena::new(vec![1, 3]);
        arena.store(0, buffer(1));
        arena.store(1, buffer(2));
        assert_eq!(arena.stats().peak_live, 2);

        assert!(arena.take(0).is_some());
        assert_eq!(arena.clear(), 1);
        assert_eq!(arena.live(), 0);
    }
}
