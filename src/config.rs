//! Recognized configuration options and their defaults.

use crate::error::{MnemonicError, Result};

/// Construction-time configuration for a [`crate::Mnemonic`] instance.
///
/// There are no setters once a `Mnemonic` is built: `D`, `T`, `H`, and the
/// filter sizing are fixed at construction by design, which is the simplest
/// way to satisfy "changing these after first insert is undefined;
/// implementations should refuse" — there is no API through which to try.
#[derive(Debug, Clone, PartialEq)]
pub struct MnemonicConfig {
    /// Embedding dimension `D`. Fixed at construction.
    pub dim: usize,
    /// Expected cardinality used to size the membership filter.
    pub expected_n: usize,
    /// Target false-positive rate for the membership filter.
    pub p_false_positive: f64,
    /// Number of hash tables in the hash-bucket index.
    pub hash_tables: usize,
    /// Hyperplanes per hash table.
    pub hyperplanes: usize,
    /// Target out-degree per layer in the proximity graph (`M`).
    pub graph_degree: usize,
    /// Build-time beam width for the proximity graph.
    pub ef_construction: usize,
    /// Default query-time beam width for the proximity graph.
    pub ef_search: usize,
    /// Fitness EMA smoothing weight (`α`).
    pub alpha: f64,
    /// Fitness threshold for promotion to the collective pool.
    pub tau_promote: f64,
    /// Per-agent record capacity enforced during `evolve()`.
    pub max_per_agent: usize,
    /// Background evolve-pass cadence.
    pub evolve_interval: std::time::Duration,
    /// Seed for hyperplane sampling (hash-bucket index).
    pub hyperplane_seed: u64,
    /// Seed for level sampling (proximity graph).
    pub level_seed: u64,
}

impl Default for MnemonicConfig {
    fn default() -> Self {
        Self {
            dim: 384,
            expected_n: 1_000_000,
            p_false_positive: 0.01,
            hash_tables: 10,
            hyperplanes: 12,
            graph_degree: 16,
            ef_construction: 200,
            ef_search: 100,
            alpha: 0.1,
            tau_promote: 0.9,
            max_per_agent: 1000,
            evolve_interval: std::time::Duration::from_secs(3600),
            hyperplane_seed: 0x5EED_5EED_5EED_5EED,
            level_seed: 0xC0FF_EEC0_FFEE_C0FF,
        }
    }
}

impl MnemonicConfig {
    /// Validate this configuration. Called once at `Mnemonic::new`.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(MnemonicError::invalid("D must be > 0"));
        }
        if self.hash_tables == 0 {
            return Err(MnemonicError::invalid("T must be > 0"));
        }
        if self.hyperplanes == 0 {
            return Err(MnemonicError::invalid("H must be > 0"));
        }
        if self.graph_degree == 0 {
            return Err(MnemonicError::invalid("M must be > 0"));
        }
        if !(0.0..1.0).contains(&self.p_false_positive) {
            return Err(MnemonicError::invalid("p_false_positive must be in (0,1)"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(MnemonicError::invalid("alpha must be in [0,1]"));
        }
        if !(0.0..=1.0).contains(&self.tau_promote) {
            return Err(MnemonicError::invalid("tau_promote must be in [0,1]"));
        }
        if self.max_per_agent == 0 {
            return Err(MnemonicError::invalid("max_per_agent must be > 0"));
        }
        Ok(())
    }
}
