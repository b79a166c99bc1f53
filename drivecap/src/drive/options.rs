//! Configuration for a drive.

use std::path::Path;

use drivecap_shared::constants::chunk as const_chunk;
use drivecap_shared::constants::scheduling as const_scheduling;
use drivecap_shared::constants::verify as const_verify;
use drivecap_shared::{DrivecapError, DrivecapResult};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionOptions;
use crate::chunk::ChunkGeometry;

// ============================================================================
// Device capabilities
// ============================================================================

/// What the device below the drive can do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Device supports write-same of a single zero block.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub write_same: bool,

    /// Zeroing deallocates (unmaps) blocks instead of writing them.
    ///
    /// Deallocated blocks are not guaranteed to be physically zero, so
    /// background zero keeps `need_zero` set on chunks it deallocated.
    /// Default: false
    #[serde(default)]
    pub deallocate_on_zero: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            write_same: true,
            deallocate_on_zero: false,
        }
    }
}

// ============================================================================
// Drive Options
// ============================================================================

/// Options used when creating or opening a drive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveOptions {
    /// Name carried by log spans.
    #[serde(default = "default_name")]
    pub name: String,

    /// Exported capacity in blocks. Must be a multiple of `chunk_size`.
    pub capacity_blocks: u64,

    /// Blocks per chunk.
    ///
    /// Default: 2048
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Chunk records per metadata page.
    ///
    /// Default: 1024
    #[serde(default = "default_records_per_page")]
    pub records_per_page: u64,

    /// Alignment unit of user zero requests, in blocks.
    ///
    /// Default: 64
    #[serde(default = "default_optimum_block_size")]
    pub optimum_block_size: u64,

    /// Maximum chunks covered by one background zero I/O.
    ///
    /// Default: 8
    #[serde(default = "default_max_zero_chunks")]
    pub max_zero_chunks: u64,

    /// Metadata pages kept in the chunk map cache.
    ///
    /// Default: 4
    #[serde(default = "default_cache_slots")]
    pub cache_slots: usize,

    #[serde(default)]
    pub capabilities: DeviceCapabilities,

    #[serde(default)]
    pub admission: AdmissionOptions,

    /// Run sniff verify from the background runner.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub sniff_enabled: bool,

    /// Run background zero from the background runner.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub background_zero_enabled: bool,

    /// Poll interval of an idle engine.
    ///
    /// Default: 3000
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// Media errors at one lba, the detecting verify included, before a
    /// remap gives up.
    ///
    /// Default: 3
    #[serde(default = "default_max_remap_attempts")]
    pub max_remap_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "drive".to_string()
}

fn default_chunk_size() -> u64 {
    const_chunk::DEFAULT_CHUNK_SIZE
}

fn default_records_per_page() -> u64 {
    const_chunk::DEFAULT_RECORDS_PER_PAGE
}

fn default_optimum_block_size() -> u64 {
    const_chunk::DEFAULT_OPTIMUM_BLOCK_SIZE
}

fn default_max_zero_chunks() -> u64 {
    const_chunk::DEFAULT_MAX_ZERO_CHUNKS
}

fn default_cache_slots() -> usize {
    4
}

fn default_idle_interval_ms() -> u64 {
    const_scheduling::IDLE_INTERVAL_MS
}

fn default_max_remap_attempts() -> u32 {
    const_verify::MAX_REMAP_ATTEMPTS
}

impl DriveOptions {
    /// Options for a drive of `capacity_chunks` default-sized chunks.
    pub fn with_chunks(capacity_chunks: u64) -> Self {
        Self {
            name: default_name(),
            capacity_blocks: capacity_chunks * default_chunk_size(),
            chunk_size: default_chunk_size(),
            records_per_page: default_records_per_page(),
            optimum_block_size: default_optimum_block_size(),
            max_zero_chunks: default_max_zero_chunks(),
            cache_slots: default_cache_slots(),
            capabilities: DeviceCapabilities::default(),
            admission: AdmissionOptions::default(),
            sniff_enabled: true,
            background_zero_enabled: true,
            idle_interval_ms: default_idle_interval_ms(),
            max_remap_attempts: default_max_remap_attempts(),
        }
    }

    /// Check the options describe a usable drive.
    pub fn validate(&self) -> DrivecapResult<()> {
        let nonzero = [
            ("chunk_size", self.chunk_size),
            ("records_per_page", self.records_per_page),
            ("optimum_block_size", self.optimum_block_size),
            ("max_zero_chunks", self.max_zero_chunks),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(DrivecapError::Config(format!("{} must be non-zero", field)));
        }
        if self.capacity_blocks % self.chunk_size != 0 {
            return Err(DrivecapError::Config(format!(
                "capacity {} blocks is not a multiple of chunk size {}",
                self.capacity_blocks, self.chunk_size
            )));
        }
        if self.chunk_size % self.optimum_block_size != 0 {
            return Err(DrivecapError::Config(format!(
                "chunk size {} is not a multiple of optimum block size {}",
                self.chunk_size, self.optimum_block_size
            )));
        }
        if self.max_remap_attempts == 0 {
            return Err(DrivecapError::Config(
                "max_remap_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn geometry(&self) -> ChunkGeometry {
        ChunkGeometry::new(self.chunk_size, self.records_per_page)
    }

    /// Exported chunks.
    pub fn capacity_chunks(&self) -> u64 {
        self.capacity_blocks / self.chunk_size
    }

    pub fn from_json_file(path: &Path) -> DrivecapResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            DrivecapError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let options: DriveOptions = serde_json::from_slice(&bytes)
            .map_err(|e| DrivecapError::Config(format!("{}: {}", path.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json_file(&self, path: &Path) -> DrivecapResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            DrivecapError::Storage(format!("failed to write {}: {}", path.display(), e))
        })
    }
}
