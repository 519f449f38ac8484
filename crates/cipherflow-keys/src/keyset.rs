// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Key sets and deterministic key generation
//!
//! Secret keys are binary and sampled from a ChaCha8 stream seeded by the partition
//! fingerprint and the secret seed, so `(partition, seed)` always yields the same keys.
//! Encryption randomness comes from a separate stream keyed by the encryption seed and a
//! caller nonce.

use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use rand_core::RngCore;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{KeyError, Partition, Result};

/// LWE ciphertext: `ciphertext_len - 1` mask words followed by the body
pub type Ciphertext = Vec<u64>;

const KEYGEN_DOMAIN: u64 = 0x6b65_7967_656e_0001;
const ENCRYPT_DOMAIN: u64 = 0x656e_6372_7970_0002;

/// Seeds for one key set
///
/// Secret key sampling and encryption randomness are seeded separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySeed {
    pub secret: u64,
    pub encryption: u64,
}

impl KeySeed {
    pub const fn new(secret: u64, encryption: u64) -> Self {
        Self { secret, encryption }
    }
}

/// Secret key material for one partition and seed
///
/// Immutable once generated; shared read-only through `Arc<KeySet>`.
#[derive(Debug, Clone)]
pub struct KeySet {
    partition: Arc<Partition>,
    seed: KeySeed,
    small_key: Vec<u64>,
    big_key: Vec<u64>,
    noise: Normal<f64>,
}

impl KeySet {
    /// Generate key material for `(partition, seed)`
    pub fn generate(partition: Arc<Partition>, seed: KeySeed) -> Result<Self> {
        partition.validate()?;

        let mut rng = derive_rng(KEYGEN_DOMAIN, [partition.fingerprint(), seed.secret, 0]);
        let small_key = sample_binary_key(&mut rng, partition.lwe_dim);
        let big_key = sample_binary_key(&mut rng, partition.big_lwe_dim());

        Self::assemble(partition, seed, small_key, big_key)
    }

    /// Rebuild a key set from previously exported key bytes
    pub fn from_key_bytes(partition: Arc<Partition>, seed: KeySeed, bytes: &[u8]) -> Result<Self> {
        partition.validate()?;

        let expected = partition.lwe_dim + partition.big_lwe_dim();
        if bytes.len() != expected {
            return Err(KeyError::KeyGeneration {
                partition: partition.name.clone(),
                reason: format!(
                    "key material has {} coefficients, partition needs {}",
                    bytes.len(),
                    expected
                ),
            });
        }
        if let Some(position) = bytes.iter().position(|&b| b > 1) {
            return Err(KeyError::KeyGeneration {
                partition: partition.name.clone(),
                reason: format!("coefficient {} is not binary", position),
            });
        }

        let (small, big) = bytes.split_at(partition.lwe_dim);
        let small_key = small.iter().map(|&b| b as u64).collect();
        let big_key = big.iter().map(|&b| b as u64).collect();
        Self::assemble(partition, seed, small_key, big_key)
    }

    fn assemble(
        partition: Arc<Partition>,
        seed: KeySeed,
        small_key: Vec<u64>,
        big_key: Vec<u64>,
    ) -> Result<Self> {
        let noise = Normal::new(0.0, partition.encryption_noise_std_dev()).map_err(|e| {
            KeyError::KeyGeneration {
                partition: partition.name.clone(),
                reason: format!("noise distribution: {}", e),
            }
        })?;

        Ok(Self {
            partition,
            seed,
            small_key,
            big_key,
            noise,
        })
    }

    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    pub fn seed(&self) -> KeySeed {
        self.seed
    }

    pub fn small_key(&self) -> &[u64] {
        &self.small_key
    }

    pub fn big_key(&self) -> &[u64] {
        &self.big_key
    }

    /// Key that fresh ciphertexts of this partition are encrypted under
    pub fn encryption_key(&self) -> &[u64] {
        match self.partition.encryption_key_choice {
            crate::EncryptionKeyChoice::Big => &self.big_key,
            crate::EncryptionKeyChoice::Small => &self.small_key,
        }
    }

    /// Key coefficients as one byte each, small key first
    pub fn key_bytes(&self) -> Vec<u8> {
        self.small_key
            .iter()
            .chain(self.big_key.iter())
            .map(|&c| c as u8)
            .collect()
    }

    /// Resident size of the key material in bytes
    pub fn size_bytes(&self) -> usize {
        (self.small_key.len() + self.big_key.len()) * std::mem::size_of::<u64>()
    }

    /// Encrypt `message` (reduced modulo the plaintext modulus)
    ///
    /// The same `(message, nonce)` always produces the same ciphertext.
    pub fn encrypt(&self, message: u64, nonce: u64) -> Ciphertext {
        let key = self.encryption_key();
        let mut rng = derive_rng(
            ENCRYPT_DOMAIN,
            [self.partition.fingerprint(), self.seed.encryption, nonce],
        );

        let mut ciphertext = Vec::with_capacity(key.len() + 1);
        ciphertext.extend((0..key.len()).map(|_| rng.next_u64()));

        let noise = torus_noise(self.noise.sample(&mut rng));
        let body = dot(&ciphertext, key)
            .wrapping_add(self.encode(message))
            .wrapping_add(noise);
        ciphertext.push(body);
        ciphertext
    }

    /// Decrypt and decode a ciphertext of this partition
    pub fn decrypt(&self, ciphertext: &[u64]) -> Result<u64> {
        Ok(self.decode(self.phase(ciphertext)?))
    }

    /// Noisy torus value `body - <mask, key>`
    pub fn phase(&self, ciphertext: &[u64]) -> Result<u64> {
        let expected = self.partition.ciphertext_len();
        if ciphertext.len() != expected {
            return Err(KeyError::CiphertextShape {
                partition: self.partition.name.clone(),
                expected,
                actual: ciphertext.len(),
            });
        }
        let (mask, body) = ciphertext.split_at(expected - 1);
        Ok(body[0].wrapping_sub(dot(mask, self.encryption_key())))
    }

    /// Scale a plaintext onto the torus
    pub fn encode(&self, message: u64) -> u64 {
        (message % self.partition.plaintext_modulus()).wrapping_mul(self.partition.delta())
    }

    /// Round a torus value to the nearest plaintext
    pub fn decode(&self, phase: u64) -> u64 {
        let delta = self.partition.delta();
        let rounded = phase.wrapping_add(delta / 2) / delta;
        rounded % self.partition.plaintext_modulus()
    }
}

impl PartialEq for KeySet {
    fn eq(&self, other: &Self) -> bool {
        self.partition == other.partition
            && self.seed == other.seed
            && self.small_key == other.small_key
            && self.big_key == other.big_key
    }
}

fn sample_binary_key(rng: &mut ChaCha8Rng, dimension: usize) -> Vec<u64> {
    let mut key = Vec::with_capacity(dimension);
    while key.len() < dimension {
        let word = rng.next_u64();
        let take = (dimension - key.len()).min(64);
        key.extend((0..take).map(|bit| (word >> bit) & 1));
    }
    key
}

fn dot(mask: &[u64], key: &[u64]) -> u64 {
    mask.iter()
        .zip(key)
        .fold(0u64, |acc, (&a, &s)| acc.wrapping_add(a.wrapping_mul(s)))
}

/// Map a real-valued torus fraction to its u64 representation
fn torus_noise(fraction: f64) -> u64 {
    (fraction * 2f64.powi(64)).round() as i64 as u64
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn derive_rng(domain: u64, words: [u64; 3]) -> ChaCha8Rng {
    let mut state = domain;
    for word in words {
        state = splitmix64(state ^ word);
    }
    let mut seed = [0u8; 32];
    for chunk in seed.chunks_exact_mut(8) {
        state = splitmix64(state);
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    ChaCha8Rng::from_seed(seed)
}
