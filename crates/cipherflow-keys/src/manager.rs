// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Key Manager: per-context key cache
//!
//! Entries are keyed by partition (name + parameter fingerprint) and [`KeySeed`].
//! Generation is single-flight: the first requester of a missing key generates it outside
//! the cache lock while later requesters of the same key block on the flight and share its
//! result. Ready entries are bounded by `capacity` and evicted least-recently-used first.

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{KeyBlob, KeyError, KeySeed, KeySet, Partition, Result};

/// Cache key for one key set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub partition: String,
    pub fingerprint: u64,
    pub seed: KeySeed,
}

impl KeyId {
    pub fn new(partition: &Partition, seed: KeySeed) -> Self {
        Self {
            partition: partition.name.clone(),
            fingerprint: partition.fingerprint(),
            seed,
        }
    }
}

/// Snapshot of key manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyManagerStats {
    /// Key generations actually performed
    pub generations: u64,
    pub hits: u64,
    pub misses: u64,
    /// Requests that blocked on an in-flight generation
    pub waits: u64,
    pub evictions: u64,
    /// Ready entries currently cached
    pub cached: usize,
}

/// One in-progress generation
struct Flight {
    result: Mutex<Option<Result<Arc<KeySet>>>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<KeySet>> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut guard);
        }
    }

    fn complete(&self, result: Result<Arc<KeySet>>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

enum Slot {
    Ready { keys: Arc<KeySet>, last_used: u64 },
    InFlight(Arc<Flight>),
}

enum Lookup {
    Hit(Arc<KeySet>),
    Wait(Arc<Flight>),
    Miss(Arc<Flight>),
}

#[derive(Default)]
struct CacheState {
    slots: AHashMap<KeyId, Slot>,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    fn least_recently_used(&self) -> Option<KeyId> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready { last_used, .. } => Some((id, *last_used)),
                Slot::InFlight(_) => None,
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(id, _)| id.clone())
    }
}

/// Thread-safe key cache owned by one execution context
pub struct KeyManager {
    state: Mutex<CacheState>,
    capacity: usize,
    generations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
    evictions: AtomicU64,
}

impl KeyManager {
    /// Create a manager holding at most `capacity` ready key sets (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
            generations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the cached key set for `(partition, seed)`, generating it on first use
    ///
    /// Concurrent callers for the same key block until the single generation finishes and
    /// receive the same `Arc`. A failed generation is returned to every waiter and not
    /// cached.
    pub fn get_or_create(&self, partition: &Arc<Partition>, seed: KeySeed) -> Result<Arc<KeySet>> {
        partition.validate()?;
        self.single_flight(KeyId::new(partition, seed), seed, || {
            KeySet::generate(Arc::clone(partition), seed)
        })
    }

    fn single_flight(
        &self,
        id: KeyId,
        seed: KeySeed,
        generate: impl FnOnce() -> Result<KeySet>,
    ) -> Result<Arc<KeySet>> {
        let lookup = {
            let mut state = self.state.lock();
            let now = state.tick();
            match state.slots.get_mut(&id) {
                Some(Slot::Ready { keys, last_used }) => {
                    *last_used = now;
                    Lookup::Hit(Arc::clone(keys))
                }
                Some(Slot::InFlight(flight)) => Lookup::Wait(Arc::clone(flight)),
                None => {
                    let flight = Arc::new(Flight::new());
                    state
                        .slots
                        .insert(id.clone(), Slot::InFlight(Arc::clone(&flight)));
                    Lookup::Miss(flight)
                }
            }
        };

        let flight = match lookup {
            Lookup::Hit(keys) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(keys);
            }
            Lookup::Wait(flight) => {
                self.waits.fetch_add(1, Ordering::Relaxed);
                debug!(partition = %id.partition, "Waiting on in-flight key generation");
                return flight.wait();
            }
            Lookup::Miss(flight) => flight,
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let started = std::time::Instant::now();
        // A panicking generator must still settle the flight, or its waiters block forever
        let result = panic::catch_unwind(AssertUnwindSafe(generate))
            .unwrap_or_else(|_| {
                Err(KeyError::KeyGeneration {
                    partition: id.partition.clone(),
                    reason: "key generation panicked".to_string(),
                })
            })
            .map(Arc::new);
        self.generations.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(keys) => {
                info!(
                    partition = %id.partition,
                    secret_seed = seed.secret,
                    bytes = keys.size_bytes(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "Generated key set"
                );
                self.insert_ready(id, Arc::clone(keys));
            }
            Err(e) => {
                warn!(partition = %id.partition, error = %e, "Key generation failed");
                self.state.lock().slots.remove(&id);
            }
        }

        flight.complete(result.clone());
        result
    }

    /// Seed the cache with externally supplied key material
    ///
    /// Replaces any ready entry for the same key.
    pub fn import(&self, blob: &KeyBlob) -> Result<Arc<KeySet>> {
        let keys = Arc::new(blob.to_keyset()?);
        let id = KeyId::new(keys.partition(), keys.seed());
        info!(partition = %id.partition, "Imported key set");
        self.insert_ready(id, Arc::clone(&keys));
        Ok(keys)
    }

    /// Export the key set for `(partition, seed)`, generating it if needed
    pub fn export(&self, partition: &Arc<Partition>, seed: KeySeed) -> Result<KeyBlob> {
        let keys = self.get_or_create(partition, seed)?;
        Ok(KeyBlob::from_keyset(&keys))
    }

    /// Load a key blob file and import it
    pub fn import_file<P: AsRef<Path>>(&self, path: P) -> Result<Arc<KeySet>> {
        let blob = KeyBlob::load(path)?;
        self.import(&blob)
    }

    /// Export a key set to a key blob file
    pub fn export_file<P: AsRef<Path>>(
        &self,
        partition: &Arc<Partition>,
        seed: KeySeed,
        path: P,
    ) -> Result<()> {
        self.export(partition, seed)?.save(path)?;
        Ok(())
    }

    /// Drop every ready entry of a partition, returning how many were removed
    ///
    /// Key sets still referenced by running work stay alive until those references drop.
    pub fn evict(&self, partition: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|id, slot| {
            id.partition != partition || matches!(slot, Slot::InFlight(_))
        });
        let removed = before - state.slots.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(partition, removed, "Evicted key sets");
        }
        removed
    }

    /// Drop every ready entry
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state
            .slots
            .retain(|_, slot| matches!(slot, Slot::InFlight(_)));
        let removed = before - state.slots.len();
        if removed > 0 {
            debug!(removed, "Cleared key cache");
        }
        removed
    }

    pub fn contains(&self, partition: &Partition, seed: KeySeed) -> bool {
        matches!(
            self.state.lock().slots.get(&KeyId::new(partition, seed)),
            Some(Slot::Ready { .. })
        )
    }

    /// Number of ready entries
    pub fn len(&self) -> usize {
        self.state.lock().ready_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> KeyManagerStats {
        KeyManagerStats {
            generations: self.generations.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            cached: self.len(),
        }
    }

    fn insert_ready(&self, id: KeyId, keys: Arc<KeySet>) {
        let mut state = self.state.lock();
        let now = state.tick();
        state.slots.insert(
            id,
            Slot::Ready {
                keys,
                last_used: now,
            },
        );

        while state.ready_count() > self.capacity {
            let Some(victim) = state.least_recently_used() else {
                break;
            };
            state.slots.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(partition = %victim.partition, "Evicted least recently used key set");
        }
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
