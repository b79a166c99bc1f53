//! Shared constants
//!
//! These values must be identical in the core, the CLI and the test fixtures.

/// Chunk map geometry
pub mod chunk {
    /// Default chunk size in blocks (2048 blocks)
    pub const DEFAULT_CHUNK_SIZE: u64 = 0x800;

    /// Chunk records held by one persisted metadata page.
    /// A 512-byte page holds two 4-bit records per byte.
    pub const DEFAULT_RECORDS_PER_PAGE: u64 = 1024;

    /// Maximum chunks covered by one background zero I/O
    pub const DEFAULT_MAX_ZERO_CHUNKS: u64 = 8;

    /// Default alignment unit for user zero requests (in blocks)
    pub const DEFAULT_OPTIMUM_BLOCK_SIZE: u64 = 64;

    /// Bytes per block of a file-backed device
    pub const BLOCK_SIZE: u64 = 512;
}

/// Logical block addressing
pub mod lba {
    /// Marker for "no lba" (idle verify-invalidate cursor, no media error recorded)
    pub const INVALID: u64 = u64::MAX;
}

/// Sniff verify and remap
pub mod verify {
    /// Media errors at the same lba (detecting verify included) before the remap gives up
    pub const MAX_REMAP_ATTEMPTS: u32 = 3;

    /// Distinct failing lbas one remap will chase inside a single chunk
    pub const MAX_REMAP_LBAS: u32 = 16;
}

/// Background scheduling
pub mod scheduling {
    /// Delay before re-asking the admission controller after a denial
    pub const ADMISSION_BACKOFF_MS: u64 = 300;

    /// Delay between polls of an idle engine
    pub const IDLE_INTERVAL_MS: u64 = 3000;

    /// Consecutive background failures before an external fault is raised
    pub const MAX_BACKGROUND_FAILURES: u32 = 8;
}

/// Environment variables
pub mod envs {
    /// Log filter for the CLI and embedders that call `init_logging`
    pub const DRIVECAP_LOG: &str = "DRIVECAP_LOG";

    /// Drive home directory used by the CLI when `--home` is not given
    pub const DRIVECAP_HOME: &str = "DRIVECAP_HOME";
}
