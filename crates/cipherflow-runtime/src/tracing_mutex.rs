// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Mutex wrapper that reports slow acquisitions of scheduler locks
//!
//! With the `lock-tracing` feature disabled this is a plain `parking_lot::Mutex`. The
//! guard is the ordinary `parking_lot` guard in both cases so it works with `Condvar`.

use parking_lot::{Mutex, MutexGuard};

#[cfg(feature = "lock-tracing")]
use std::time::{Duration, Instant};
#[cfg(feature = "lock-tracing")]
use tracing::{trace, warn};

/// Waits longer than this are logged at warn level
#[cfg(feature = "lock-tracing")]
const SLOW_ACQUIRE: Duration = Duration::from_millis(5);

pub struct TracingMutex<T> {
    inner: Mutex<T>,
    #[cfg(feature = "lock-tracing")]
    name: &'static str,
}

impl<T> TracingMutex<T> {
    /// `name` is only reported when `lock-tracing` is enabled
    pub fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(feature = "lock-tracing")]
            name: _name,
        }
    }

    #[cfg(feature = "lock-tracing")]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let attempt = Instant::now();
        let guard = self.inner.lock();
        let waited = attempt.elapsed();
        if waited > SLOW_ACQUIRE {
            warn!(
                lock = self.name,
                thread = ?std::thread::current().id(),
                wait_ms = waited.as_secs_f64() * 1000.0,
                "Slow lock acquisition"
            );
        } else {
            trace!(lock = self.name, wait_us = waited.as_micros() as u64, "Lock acquired");
        }
        guard
    }

    #[cfg(not(feature = "lock-tracing"))]
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
