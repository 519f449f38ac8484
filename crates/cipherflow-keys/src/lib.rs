// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! # Cipherflow Keys
//!
//! Cryptographic parameter sets ("partitions") and the key material generated for them.
//!
//! ## Components
//! - [`Partition`]: immutable named parameter set, validated at construction
//! - [`PartitionRegistry`]: name to dense [`PartitionId`] mapping for one program
//! - [`KeySet`]: secret key material bound to one partition and a [`KeySeed`]
//! - [`KeyManager`]: per-context cache with single-flight generation and LRU eviction
//! - [`KeyBlob`]: versioned on-disk form of a key set
//!
//! ## Usage
//! ```
//! use cipherflow_keys::{KeyManager, KeySeed, Partition};
//! use std::sync::Arc;
//!
//! let partition = Arc::new(Partition::builder("P1", 1, 1, 1024).build().unwrap());
//! let manager = KeyManager::new(8);
//!
//! let keys = manager.get_or_create(&partition, KeySeed::new(7, 11)).unwrap();
//! let ciphertext = keys.encrypt(3, 0);
//! assert_eq!(keys.decrypt(&ciphertext).unwrap(), 3);
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use thiserror::Error;

mod blob;
mod keyset;
mod manager;
mod partition;

pub use blob::*;
pub use keyset::*;
pub use manager::*;
pub use partition::*;

/// Key material errors
///
/// Cloneable so a failed generation can be handed to every requester waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("Invalid partition '{partition}': {reason}")]
    InvalidPartition { partition: String, reason: String },

    #[error("Key generation failed for partition '{partition}': {reason}")]
    KeyGeneration { partition: String, reason: String },

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error(
        "Ciphertext shape mismatch for partition '{partition}': expected {expected} words, got {actual}"
    )]
    CiphertextShape {
        partition: String,
        expected: usize,
        actual: usize,
    },

    #[error("Key blob error: {0}")]
    Blob(#[from] BlobError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// FNV-1a over a byte slice
///
/// Used for blob checksums, partition fingerprints and encryption nonces.
pub fn fnv1a(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;

    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
