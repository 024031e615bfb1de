//! Configuration structures for OpalDB.

use serde::{Deserialize, Serialize};

/// Configuration for a persistent B+Tree index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeConfig {
    /// Maximum number of keys per node.
    pub max_keys: usize,
    /// Whether multiple entries may share a key.
    pub allow_duplicates: bool,
    /// Whether nodes are sized dynamically from key widths rather than
    /// capped at `max_keys`.
    pub dynamic_sizing: bool,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            max_keys: 64,
            allow_duplicates: false,
            dynamic_sizing: false,
        }
    }
}

/// Configuration for a persistent linear hash map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Initial directory size exponent (directory holds `2^initial_bits`
    /// buckets).
    pub initial_bits: u32,
    /// Number of entries per block in a bucket chain.
    pub block_capacity: usize,
    /// Whether multiple entries may share a key.
    pub allow_duplicates: bool,
    /// Load factor (entries per slot) above which the directory doubles.
    pub max_load_factor: f64,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            initial_bits: 4,
            block_capacity: 16,
            allow_duplicates: false,
            max_load_factor: 0.75,
        }
    }
}

/// Configuration for a persistence session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Whether hollow objects may be loaded outside a transaction.
    pub allow_nontransactional_reads: bool,
    /// Number of pooled decode scratch contexts.
    pub decode_pool_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_nontransactional_reads: true,
            decode_pool_size: 4,
        }
    }
}
