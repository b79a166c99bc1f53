//! Request and result types of the drive API.

use serde::Serialize;

use crate::checkpoint::{Cursor, NonPagedState};
use crate::chunk::Lba;
use crate::drive::DriveStatus;
use crate::metrics::DriveMetrics;

// ============================================================================
// REQUESTS
// ============================================================================

/// Zero-family request submitted to [`crate::Drive::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroRequest {
    /// Consumer asks for zeros over a range. Lba and length must be
    /// multiples of the drive's optimum block size.
    UserZero { lba: Lba, blocks: u64 },

    /// Mark every chunk for background zero and restart it from lba 0.
    MarkDiskZero,

    /// The consumer released a chunk-aligned range. Consumed chunks go back
    /// to the provisioned state and get zeroed again.
    MarkConsumedZero { lba: Lba, blocks: u64 },

    /// Schedule a verify-invalidate pass from the metadata page holding `lba`.
    VerifyInvalidate { lba: Lba },
}

impl ZeroRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ZeroRequest::UserZero { .. } => "user_zero",
            ZeroRequest::MarkDiskZero => "mark_disk_zero",
            ZeroRequest::MarkConsumedZero { .. } => "mark_consumed_zero",
            ZeroRequest::VerifyInvalidate { .. } => "verify_invalidate",
        }
    }
}

/// Background engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    BackgroundZero,
    Sniff,
    VerifyInvalidate,
}

impl Engine {
    pub const ALL: [Engine; 3] = [
        Engine::VerifyInvalidate,
        Engine::BackgroundZero,
        Engine::Sniff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::BackgroundZero => "background_zero",
            Engine::Sniff => "sniff",
            Engine::VerifyInvalidate => "verify_invalidate",
        }
    }
}

// ============================================================================
// CYCLE RESULTS
// ============================================================================

/// Why a background cycle did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// The scheduler refused credits.
    Admission,
    /// The consumer answered `Denied`.
    UpstreamDenied,
    /// The checkpoint moved while the cycle ran; the work is redone later.
    CheckpointMoved,
    /// The drive left the Ready state mid-cycle.
    NotReady,
    /// The range holds untrusted records and waits for verify-invalidate.
    VerifyInvalidatePending,
}

/// Result of one background cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    /// Device I/O completed and the checkpoint advanced.
    Completed { cursor: Cursor, from: Lba, to: Lba },
    /// The checkpoint advanced without device I/O.
    Skipped { cursor: Cursor, from: Lba, to: Lba },
    /// Sniff finished a pass and restarted at lba 0.
    Wrapped { pass_count: u64 },
    /// Nothing to do.
    Idle,
    Deferred { reason: DeferReason },
}

impl CycleOutcome {
    pub(crate) fn deferred(reason: DeferReason) -> Self {
        CycleOutcome::Deferred { reason }
    }

    /// Whether the cycle moved a checkpoint.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Completed { .. }
                | CycleOutcome::Skipped { .. }
                | CycleOutcome::Wrapped { .. }
        )
    }
}

// ============================================================================
// INSPECTION
// ============================================================================

/// Record totals over the exported chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub total: u64,
    /// Chunks background zero still has to write.
    pub needs_zero: u64,
    /// Untrusted records waiting for verify-invalidate.
    pub invalid: u64,
    pub consumed: u64,
    /// Metadata pages that could not be read.
    pub unreadable_pages: u64,
}

/// Point-in-time view of a drive.
#[derive(Debug, Clone, Serialize)]
pub struct DriveSnapshot {
    pub name: String,
    pub status: DriveStatus,
    pub capacity_blocks: u64,
    pub chunk_size: u64,
    pub flags: Vec<String>,
    pub state: NonPagedState,
    pub chunks: ChunkCounts,
    pub metrics: DriveMetrics,
}
