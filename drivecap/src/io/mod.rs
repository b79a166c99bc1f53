//! Collaborator interfaces.
//!
//! The engines never touch hardware or persistent storage directly. They
//! issue typed requests through these traits, which lets the same engine
//! code run against a real backend, the in-memory backends in
//! [`crate::backend`], or fault-injecting test doubles.

use async_trait::async_trait;
use drivecap_shared::{DrivecapError, DrivecapResult};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{NonPagedField, VerifyReport};
use crate::chunk::{BlockRange, ChunkIndex, ChunkRecord, Lba};

/// Data pattern written by the drive itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockPattern {
    /// All-zero blocks.
    Zeroed,
    /// Poison pattern: reads of these blocks report invalidated data
    /// instead of returning stale content.
    Invalidated,
}

/// How a zero request reaches the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZeroMethod {
    /// Device-side write-same of one zero block.
    WriteSame,
    /// Ordinary write of a zero-filled buffer.
    Buffer,
    /// Unmap the blocks; they read back as zero until reprovisioned.
    Deallocate,
}

/// Request issued to the block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Zero { range: BlockRange, method: ZeroMethod },
    Write { range: BlockRange, pattern: BlockPattern },
    WriteVerify { range: BlockRange, pattern: BlockPattern },
    Read { range: BlockRange },
    Verify { range: BlockRange },
}

impl DeviceOp {
    pub fn range(&self) -> BlockRange {
        match self {
            DeviceOp::Zero { range, .. }
            | DeviceOp::Write { range, .. }
            | DeviceOp::WriteVerify { range, .. }
            | DeviceOp::Read { range }
            | DeviceOp::Verify { range } => *range,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceOp::Zero { .. } => "zero",
            DeviceOp::Write { .. } => "write",
            DeviceOp::WriteVerify { .. } => "write_verify",
            DeviceOp::Read { .. } => "read",
            DeviceOp::Verify { .. } => "verify",
        }
    }
}

/// Completion of a [`DeviceOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// Media defect the device recovered from (data still readable).
    SoftMediaError { lba: Lba },
    /// Media defect the device could not recover.
    HardMediaError { lba: Lba },
    /// Transport or device failure unrelated to the media. Retryable.
    Failed,
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success)
    }

    /// Map to a result for callers that treat any failure as an error.
    pub fn into_result(self, op: &DeviceOp) -> DrivecapResult<()> {
        match self {
            IoStatus::Success => Ok(()),
            IoStatus::SoftMediaError { lba } | IoStatus::HardMediaError { lba } => {
                Err(DrivecapError::MediaError { lba })
            }
            IoStatus::Failed => {
                let range = op.range();
                Err(DrivecapError::Retryable(format!(
                    "{} of {} blocks at lba {:#x} failed",
                    op.name(),
                    range.blocks,
                    range.lba
                )))
            }
        }
    }

    /// Failing lba of a media error.
    pub fn media_error_lba(&self) -> Option<Lba> {
        match self {
            IoStatus::SoftMediaError { lba } | IoStatus::HardMediaError { lba } => Some(*lba),
            _ => None,
        }
    }
}

/// Block device below the drive.
#[async_trait]
pub trait DeviceIo: Send + Sync {
    async fn issue(&self, op: DeviceOp) -> IoStatus;
}

/// Write mode of a chunk map update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagedWriteMode {
    /// Read-modify-write of the pages holding the records.
    Update,
    /// Overwrite without reading first and verify the result. Heals a page
    /// that could not be read; its other records come back untrusted.
    ForceWriteVerify,
}

/// Persistent chunk map storage.
///
/// `read_records` fails with `DrivecapError::Uncorrectable` when a page
/// holding any requested record cannot be read.
#[async_trait]
pub trait PagedStore: Send + Sync {
    /// Number of records the store can hold.
    fn capacity(&self) -> u64;

    async fn read_records(&self, offset: ChunkIndex, count: u64)
    -> DrivecapResult<Vec<ChunkRecord>>;

    async fn write_records(
        &self,
        offset: ChunkIndex,
        records: &[ChunkRecord],
        mode: PagedWriteMode,
    ) -> DrivecapResult<()>;
}

/// Condition attached to a non-paged field write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    Always,
    /// Write only if the persisted value still equals the given one.
    Expect(u64),
}

/// Result of a conditional non-paged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonPagedWrite {
    Written,
    /// Condition failed; carries the value currently persisted.
    Rejected(u64),
}

/// Persistent per-drive scalars (checkpoints, flags) and the verify report.
#[async_trait]
pub trait NonPagedStore: Send + Sync {
    async fn read(&self, field: NonPagedField) -> DrivecapResult<u64>;

    async fn write(
        &self,
        field: NonPagedField,
        value: u64,
        condition: WriteCondition,
    ) -> DrivecapResult<NonPagedWrite>;

    async fn read_report(&self) -> DrivecapResult<VerifyReport>;

    async fn write_report(&self, report: &VerifyReport) -> DrivecapResult<()>;
}

/// Questions the drive asks of the consumer above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    /// May background zero I/O run over the range?
    ZeroPermission,
    /// A media error was found; will the consumer repair the range?
    RemapAction,
    /// The range's metadata was lost; may it be invalidated?
    InvalidateNotice,
}

/// Answer from the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    /// Proceed. For remap and invalidate the consumer owns the range and
    /// takes over repairing it.
    Granted,
    /// Not now; ask again on a later cycle.
    Denied,
    /// Proceed; the consumer holds no data in the range.
    NotConsumed,
}

/// Consumer of the drive's capacity (e.g. a RAID group).
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn ask(&self, kind: PermissionKind, range: BlockRange) -> PermissionReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_range_and_name() {
        let range = BlockRange::new(0x800, 0x800);
        let op = DeviceOp::WriteVerify {
            range,
            pattern: BlockPattern::Zeroed,
        };
        assert_eq!(op.range(), range);
        assert_eq!(op.name(), "write_verify");
    }

    #[test]
    fn test_into_result() {
        let op = DeviceOp::Read {
            range: BlockRange::new(0x800, 16),
        };
        assert!(IoStatus::Success.into_result(&op).is_ok());
        let err = IoStatus::Failed.into_result(&op).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("read of 16 blocks at lba 0x800"));
        assert!(matches!(
            IoStatus::SoftMediaError { lba: 3 }.into_result(&op),
            Err(DrivecapError::MediaError { lba: 3 })
        ));
    }

    #[test]
    fn test_media_error_lba() {
        assert_eq!(IoStatus::HardMediaError { lba: 9 }.media_error_lba(), Some(9));
        assert_eq!(IoStatus::Failed.media_error_lba(), None);
        assert!(IoStatus::Success.is_success());
    }
}
