//! Region sizing and observability configuration.
//!
//! All sizes are fixed at init time; the region never grows. Because the
//! mapping is made with no-reserve semantics, oversizing is cheap: untouched
//! pages consume no physical memory.

use std::path::PathBuf;

use crate::error::{Result, ShmError};

/// Configuration for [`SharedMem::init`](crate::SharedMem::init).
///
/// # Example
///
/// ```ignore
/// use tyr_shm::ShmConfig;
///
/// // A large-codebase configuration.
/// let config = ShmConfig {
///     heap_size: 8 * 1024 * 1024 * 1024, // 8GB heap
///     hash_table_pow: 23,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Bytes reserved for the global blob slot, including its length word.
    ///
    /// Default: 16MB
    pub global_size_b: usize,

    /// Bytes of variable-payload heap backing the content table.
    ///
    /// Default: 4GB (virtual; committed lazily)
    pub heap_size: usize,

    /// The dependency table holds `2^dep_table_pow` slots. Interior list
    /// nodes are addressed with 31-bit slot numbers, so this may not
    /// exceed 31.
    ///
    /// Default: 17 (131,072 edges)
    pub dep_table_pow: u32,

    /// The content table holds `2^hash_table_pow` slots.
    ///
    /// Default: 18 (262,144 keys)
    pub hash_table_pow: u32,

    /// Shared-memory statistics logging level.
    ///
    /// 0 = nothing, 1 = totals and occupancy summaries.
    ///
    /// Default: 0
    pub log_level: usize,

    /// Sampling rate for per-operation telemetry, in `[0.0, 1.0]`.
    ///
    /// Default: 0.0
    pub sample_rate: f64,

    /// Backing directory for the file-backed fallback. `None` selects the
    /// anonymous in-RAM backend (memfd on Linux, shm object on macOS).
    ///
    /// Default: None
    pub shm_dir: Option<PathBuf>,

    /// Refuse to initialize when `shm_dir` has less free space than this.
    /// Only consulted for the file-backed fallback.
    ///
    /// Default: 0 (no floor)
    pub minimum_avail: u64,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            global_size_b: 16 * 1024 * 1024,
            heap_size: 4 * 1024 * 1024 * 1024,
            dep_table_pow: 17,
            hash_table_pow: 18,
            log_level: 0,
            sample_rate: 0.0,
            shm_dir: None,
            minimum_avail: 0,
        }
    }
}

impl ShmConfig {
    /// Create a configuration small enough for unit tests and tooling.
    pub fn small() -> Self {
        Self {
            global_size_b: 4096,
            heap_size: 1024 * 1024,
            dep_table_pow: 8,
            hash_table_pow: 8,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.global_size_b < std::mem::size_of::<u64>() {
            return Err(ShmError::Config("global_size_b smaller than its length word"));
        }
        if self.global_size_b % 8 != 0 {
            return Err(ShmError::Config("global_size_b must be a multiple of 8"));
        }
        if self.heap_size < 4096 {
            return Err(ShmError::Config("heap_size must be at least one page"));
        }
        if self.dep_table_pow == 0 || self.dep_table_pow > 31 {
            return Err(ShmError::Config("dep_table_pow must be in 1..=31"));
        }
        if self.hash_table_pow == 0 || self.hash_table_pow > 31 {
            return Err(ShmError::Config("hash_table_pow must be in 1..=31"));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ShmError::Config("sample_rate must be within [0.0, 1.0]"));
        }
        Ok(())
    }
}
