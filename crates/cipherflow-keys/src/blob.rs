// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Key blob persistence
//!
//! ```text
//! [Header]
//! - Magic: "CFKEY" (5 bytes)
//! - Version: u32 LE (4 bytes)
//! - Flags: u8 (1 byte), reserved
//! - Checksum: u64 LE (8 bytes, FNV-1a of the payload)
//! [Payload]
//! - Bincode-serialized BlobPayload
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::{fnv1a, KeySeed, KeySet, Partition};

/// Magic number for key blobs: "CFKEY"
const MAGIC: &[u8; 5] = b"CFKEY";

/// Current format version (increment when format changes)
/// Version 1: partition, seed and one byte per key coefficient
pub const KEY_BLOB_VERSION: u32 = 1;

const HEADER_LEN: usize = 5 + 4 + 1 + 8;

/// Key blob encoding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Version mismatch: blob version {blob_version}, newest supported {supported_version}")]
    VersionMismatch {
        blob_version: u32,
        supported_version: u32,
    },

    #[error("Invalid magic number: expected CFKEY, got {0:?}")]
    InvalidMagic([u8; 5]),

    #[error("Truncated key blob: {0} bytes")]
    Truncated(usize),

    #[error("Checksum mismatch: key blob may be corrupted")]
    ChecksumMismatch,
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io(err.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct BlobPayload {
    partition: Partition,
    seed: KeySeed,
    key_bytes: Vec<u8>,
}

/// Serialized key set: partition identifier plus opaque key bytes
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBlob {
    /// Format version the blob was read with (or will be written as)
    pub version: u32,
    pub partition: Partition,
    pub seed: KeySeed,
    pub key_bytes: Vec<u8>,
}

impl KeyBlob {
    pub fn from_keyset(keys: &KeySet) -> Self {
        Self {
            version: KEY_BLOB_VERSION,
            partition: (**keys.partition()).clone(),
            seed: keys.seed(),
            key_bytes: keys.key_bytes(),
        }
    }

    /// Rebuild the key set, validating the partition and key length
    pub fn to_keyset(&self) -> crate::Result<KeySet> {
        KeySet::from_key_bytes(Arc::new(self.partition.clone()), self.seed, &self.key_bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BlobError> {
        let payload = bincode::serialize(&BlobPayload {
            partition: self.partition.clone(),
            seed: self.seed,
            key_bytes: self.key_bytes.clone(),
        })
        .map_err(|e| BlobError::Serialization(e.to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&KEY_BLOB_VERSION.to_le_bytes());
        bytes.push(0u8);
        bytes.extend_from_slice(&fnv1a(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() < MAGIC.len() {
            return Err(BlobError::Truncated(bytes.len()));
        }
        let mut magic = [0u8; 5];
        magic.copy_from_slice(&bytes[..5]);
        if &magic != MAGIC {
            return Err(BlobError::InvalidMagic(magic));
        }
        if bytes.len() < HEADER_LEN {
            return Err(BlobError::Truncated(bytes.len()));
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&bytes[5..9]);
        let version = u32::from_le_bytes(version_bytes);
        if version == 0 || version > KEY_BLOB_VERSION {
            return Err(BlobError::VersionMismatch {
                blob_version: version,
                supported_version: KEY_BLOB_VERSION,
            });
        }

        // bytes[9] holds flags; none are defined yet
        let mut checksum_bytes = [0u8; 8];
        checksum_bytes.copy_from_slice(&bytes[10..18]);
        let expected_checksum = u64::from_le_bytes(checksum_bytes);

        let payload = &bytes[HEADER_LEN..];
        if fnv1a(payload) != expected_checksum {
            return Err(BlobError::ChecksumMismatch);
        }

        let decoded: BlobPayload = bincode::deserialize(payload)
            .map_err(|e| BlobError::Deserialization(e.to_string()))?;

        Ok(Self {
            version,
            partition: decoded.partition,
            seed: decoded.seed,
            key_bytes: decoded.key_bytes,
        })
    }

    /// Write the blob to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), BlobError> {
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Read a blob from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BlobError> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}
