// Copyright 2025 Cipherflow Developers
// SPDX-License-Identifier: Apache-2.0

//! Partition parameter sets
//!
//! A partition is the full parameter set shared by a group of ciphertexts: LWE/GLWE
//! dimensions, noise distributions, bootstrap and keyswitch decompositions, and the
//! message/carry moduli that fix the plaintext encoding.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{fnv1a, KeyError, Result};

/// Upper bound on any single key dimension
pub const MAX_KEY_DIMENSION: usize = 1 << 20;

/// Which secret key encrypts fresh ciphertexts of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionKeyChoice {
    /// GLWE key flattened to dimension `glwe_dim * poly_size`
    Big,
    /// LWE key of dimension `lwe_dim`
    Small,
}

/// Immutable named parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub lwe_dim: usize,
    pub glwe_dim: usize,
    pub poly_size: usize,
    /// Standard deviation of LWE encryption noise, as a fraction of the torus
    pub lwe_noise_std_dev: f64,
    /// Standard deviation of GLWE encryption noise, as a fraction of the torus
    pub glwe_noise_std_dev: f64,
    pub pbs_base_log: u32,
    pub pbs_level: u32,
    pub ks_base_log: u32,
    pub ks_level: u32,
    pub message_modulus: u64,
    pub carry_modulus: u64,
    pub max_noise_level: u32,
    pub log2_p_fail: f64,
    pub encryption_key_choice: EncryptionKeyChoice,
}

impl Partition {
    /// Start a builder with default noise, decomposition and modulus parameters
    pub fn builder(
        name: impl Into<String>,
        lwe_dim: usize,
        glwe_dim: usize,
        poly_size: usize,
    ) -> PartitionBuilder {
        PartitionBuilder {
            partition: Partition {
                name: name.into(),
                lwe_dim,
                glwe_dim,
                poly_size,
                lwe_noise_std_dev: 2f64.powi(-40),
                glwe_noise_std_dev: 2f64.powi(-52),
                pbs_base_log: 23,
                pbs_level: 1,
                ks_base_log: 3,
                ks_level: 5,
                message_modulus: 4,
                carry_modulus: 4,
                max_noise_level: 5,
                log2_p_fail: -40.0,
                encryption_key_choice: EncryptionKeyChoice::Big,
            },
        }
    }

    /// Dimension of the flattened GLWE key
    pub fn big_lwe_dim(&self) -> usize {
        self.glwe_dim.saturating_mul(self.poly_size)
    }

    /// Dimension of the key fresh ciphertexts are encrypted under
    pub fn encryption_key_dim(&self) -> usize {
        match self.encryption_key_choice {
            EncryptionKeyChoice::Big => self.big_lwe_dim(),
            EncryptionKeyChoice::Small => self.lwe_dim,
        }
    }

    /// Ciphertext length in u64 words (mask followed by body)
    pub fn ciphertext_len(&self) -> usize {
        self.encryption_key_dim() + 1
    }

    pub fn plaintext_modulus(&self) -> u64 {
        self.message_modulus.saturating_mul(self.carry_modulus)
    }

    /// Scaling factor between a plaintext and its torus encoding
    ///
    /// The top bit is kept as padding.
    pub fn delta(&self) -> u64 {
        (1u64 << 63) / self.plaintext_modulus().max(1)
    }

    /// Noise standard deviation for fresh encryptions under the encryption key
    pub fn encryption_noise_std_dev(&self) -> f64 {
        match self.encryption_key_choice {
            EncryptionKeyChoice::Big => self.glwe_noise_std_dev,
            EncryptionKeyChoice::Small => self.lwe_noise_std_dev,
        }
    }

    /// Stable hash of every parameter, including the name
    pub fn fingerprint(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.name.len() + 128);
        bytes.extend_from_slice(self.name.as_bytes());
        bytes.push(0);
        for value in [self.lwe_dim as u64, self.glwe_dim as u64, self.poly_size as u64] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for value in [
            self.lwe_noise_std_dev,
            self.glwe_noise_std_dev,
            self.log2_p_fail,
        ] {
            bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        }
        for value in [
            self.pbs_base_log,
            self.pbs_level,
            self.ks_base_log,
            self.ks_level,
            self.max_noise_level,
        ] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(&self.message_modulus.to_le_bytes());
        bytes.extend_from_slice(&self.carry_modulus.to_le_bytes());
        bytes.push(match self.encryption_key_choice {
            EncryptionKeyChoice::Big => 0,
            EncryptionKeyChoice::Small => 1,
        });
        fnv1a(&bytes)
    }

    /// Check every parameter, reporting the first malformed one
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> {
            Err(KeyError::InvalidPartition {
                partition: self.name.clone(),
                reason,
            })
        };

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".to_string());
        }
        for (field, value) in [
            ("lwe_dim", self.lwe_dim),
            ("glwe_dim", self.glwe_dim),
            ("poly_size", self.poly_size),
        ] {
            if value == 0 {
                return invalid(format!("{} must be positive", field));
            }
        }
        if !self.poly_size.is_power_of_two() {
            return invalid(format!(
                "poly_size must be a power of two, got {}",
                self.poly_size
            ));
        }
        if self.lwe_dim > MAX_KEY_DIMENSION || self.big_lwe_dim() > MAX_KEY_DIMENSION {
            return invalid(format!(
                "key dimension exceeds {} (lwe_dim={}, glwe_dim*poly_size={})",
                MAX_KEY_DIMENSION,
                self.lwe_dim,
                self.big_lwe_dim()
            ));
        }
        for (field, value) in [
            ("lwe_noise_std_dev", self.lwe_noise_std_dev),
            ("glwe_noise_std_dev", self.glwe_noise_std_dev),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return invalid(format!("{} must be in (0, 1), got {}", field, value));
            }
        }
        for (name, base_log, level) in [
            ("pbs", self.pbs_base_log, self.pbs_level),
            ("ks", self.ks_base_log, self.ks_level),
        ] {
            if base_log == 0 || level == 0 {
                return invalid(format!("{}_base_log and {}_level must be positive", name, name));
            }
            if base_log.saturating_mul(level) > 64 {
                return invalid(format!(
                    "{} decomposition {}x{} exceeds 64 bits",
                    name, base_log, level
                ));
            }
        }
        for (field, value) in [
            ("message_modulus", self.message_modulus),
            ("carry_modulus", self.carry_modulus),
        ] {
            if !value.is_power_of_two() {
                return invalid(format!("{} must be a power of two, got {}", field, value));
            }
        }
        if self.plaintext_modulus() > 1 << 16 {
            return invalid(format!(
                "message_modulus * carry_modulus must be at most 2^16, got {}",
                self.plaintext_modulus()
            ));
        }
        if self.max_noise_level == 0 {
            return invalid("max_noise_level must be positive".to_string());
        }
        if !(self.log2_p_fail <= 0.0) {
            return invalid(format!(
                "log2_p_fail must be at most 0, got {}",
                self.log2_p_fail
            ));
        }
        Ok(())
    }
}

/// Builder for [`Partition`]; `build` validates
#[derive(Debug, Clone)]
pub struct PartitionBuilder {
    partition: Partition,
}

impl PartitionBuilder {
    pub fn lwe_noise_std_dev(mut self, std_dev: f64) -> Self {
        self.partition.lwe_noise_std_dev = std_dev;
        self
    }

    pub fn glwe_noise_std_dev(mut self, std_dev: f64) -> Self {
        self.partition.glwe_noise_std_dev = std_dev;
        self
    }

    pub fn pbs_decomposition(mut self, base_log: u32, level: u32) -> Self {
        self.partition.pbs_base_log = base_log;
        self.partition.pbs_level = level;
        self
    }

    pub fn ks_decomposition(mut self, base_log: u32, level: u32) -> Self {
        self.partition.ks_base_log = base_log;
        self.partition.ks_level = level;
        self
    }

    pub fn message_modulus(mut self, modulus: u64) -> Self {
        self.partition.message_modulus = modulus;
        self
    }

    pub fn carry_modulus(mut self, modulus: u64) -> Self {
        self.partition.carry_modulus = modulus;
        self
    }

    pub fn max_noise_level(mut self, level: u32) -> Self {
        self.partition.max_noise_level = level;
        self
    }

    pub fn log2_p_fail(mut self, log2_p_fail: f64) -> Self {
        self.partition.log2_p_fail = log2_p_fail;
        self
    }

    pub fn encryption_key_choice(mut self, choice: EncryptionKeyChoice) -> Self {
        self.partition.encryption_key_choice = choice;
        self
    }

    pub fn build(self) -> Result<Partition> {
        self.partition.validate()?;
        Ok(self.partition)
    }
}

/// Dense partition index within one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition#{}", self.0)
    }
}

/// Name-indexed set of validated partitions
#[derive(Debug, Clone, Default)]
pub struct PartitionRegistry {
    partitions: Vec<Arc<Partition>>,
    by_name: AHashMap<String, PartitionId>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition, returning its id
    ///
    /// Re-registering identical parameters returns the existing id; the same name with
    /// different parameters is rejected.
    pub fn register(&mut self, partition: Partition) -> Result<PartitionId> {
        partition.validate()?;

        if let Some(&id) = self.by_name.get(&partition.name) {
            if *self.partitions[id.0 as usize] == partition {
                return Ok(id);
            }
            return Err(KeyError::InvalidPartition {
                partition: partition.name,
                reason: "already registered with different parameters".to_string(),
            });
        }

        let index = u32::try_from(self.partitions.len()).map_err(|_| KeyError::InvalidPartition {
            partition: partition.name.clone(),
            reason: "partition registry is full".to_string(),
        })?;
        let id = PartitionId(index);
        self.by_name.insert(partition.name.clone(), id);
        self.partitions.push(Arc::new(partition));
        Ok(id)
    }

    pub fn get(&self, id: PartitionId) -> Option<&Arc<Partition>> {
        self.partitions.get(id.0 as usize)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<Partition>> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn id_of(&self, name: &str) -> Option<PartitionId> {
        self.by_name.get(name).copied()
    }

    /// Look up a partition by name, failing with [`KeyError::UnknownPartition`]
    pub fn resolve(&self, name: &str) -> Result<&Arc<Partition>> {
        self.get_by_name(name)
            .ok_or_else(|| KeyError::UnknownPartition(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &Arc<Partition>)> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| (PartitionId(index as u32), partition))
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason_of(result: Result<Partition>) -> String {
        match result {
            Err(KeyError::InvalidPartition { reason, .. }) => reason,
            other => panic!("expected InvalidPartition, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_partition_is_valid() {
        let p1 = Partition::builder("P1", 1, 1, 1024).build().unwrap();
        assert_eq!(p1.big_lwe_dim(), 1024);
        assert_eq!(p1.ciphertext_len(), 1025);
        assert_eq!(p1.plaintext_modulus(), 16);
        assert_eq!(p1.delta(), 1u64 << 59);
    }

    #[test]
    fn test_small_key_choice_changes_shape() {
        let p = Partition::builder("small", 4, 1, 256)
            .encryption_key_choice(EncryptionKeyChoice::Small)
            .build()
            .unwrap();
        assert_eq!(p.ciphertext_len(), 5);
        assert_eq!(p.encryption_noise_std_dev(), p.lwe_noise_std_dev);
    }

    #[test]
    fn test_poly_size_must_be_power_of_two() {
        let reason = reason_of(Partition::builder("bad", 1, 1, 1000).build());
        assert!(reason.contains("poly_size"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let reason = reason_of(Partition::builder("  ", 1, 1, 1024).build());
        assert!(reason.contains("name"));
    }

    #[test]
    fn test_decomposition_bounds() {
        let reason = reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .pbs_decomposition(33, 2)
                .build(),
        );
        assert!(reason.contains("pbs"));

        let reason = reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .ks_decomposition(0, 5)
                .build(),
        );
        assert!(reason.contains("ks"));
    }

    #[test]
    fn test_moduli_and_noise_bounds() {
        assert!(reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .message_modulus(3)
                .build()
        )
        .contains("message_modulus"));

        assert!(reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .message_modulus(1 << 10)
                .carry_modulus(1 << 10)
                .build()
        )
        .contains("2^16"));

        assert!(reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .lwe_noise_std_dev(f64::NAN)
                .build()
        )
        .contains("lwe_noise_std_dev"));

        assert!(reason_of(
            Partition::builder("bad", 1, 1, 1024)
                .log2_p_fail(1.0)
                .build()
        )
        .contains("log2_p_fail"));
    }

    #[test]
    fn test_fingerprint_tracks_parameters() {
        let a = Partition::builder("P", 2, 1, 512).build().unwrap();
        let b = Partition::builder("P", 2, 1, 512).build().unwrap();
        let c = Partition::builder("P", 2, 1, 512)
            .carry_modulus(2)
            .build()
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_registry_dense_ids() {
        let mut registry = PartitionRegistry::new();
        let p0 = registry
            .register(Partition::builder("P0", 1, 1, 512).build().unwrap())
            .unwrap();
        let p1 = registry
            .register(Partition::builder("P1", 1, 1, 1024).build().unwrap())
            .unwrap();

        assert_eq!(p0, PartitionId(0));
        assert_eq!(p1, PartitionId(1));
        assert_eq!(registry.id_of("P1"), Some(p1));
        assert_eq!(registry.get(p0).unwrap().poly_size, 512);
        assert!(matches!(
            registry.resolve("missing"),
            Err(KeyError::UnknownPartition(_))
        ));
    }

    #[test]
    fn test_registry_rejects_conflicting_redefinition() {
        let mut registry = PartitionRegistry::new();
        let id = registry
            .register(Partition::builder("P", 1, 1, 512).build().unwrap())
            .unwrap();

        // Identical parameters are idempotent
        let again = registry
            .register(Partition::builder("P", 1, 1, 512).build().unwrap())
            .unwrap();
        assert_eq!(id, again);

        let conflict = registry.register(Partition::builder("P", 1, 1, 1024).build().unwrap());
        assert!(matches!(conflict, Err(KeyError::InvalidPartition { .. })));
        assert_eq!(registry.len(), 1);
    }
}
