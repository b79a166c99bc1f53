//! Media error repair.
//!
//! The consumer gets the first say: if it owns the range it repairs it
//! from redundancy. Otherwise the drive rewrites the chunk with zeros
//! through write-verify, which makes the device remap the bad blocks.

use drivecap_shared::constants::verify::MAX_REMAP_LBAS;
use drivecap_shared::{DrivecapError, DrivecapResult};

use crate::chunk::{BlockRange, Lba};
use crate::drive::DriveInner;
use crate::io::{BlockPattern, DeviceOp, IoStatus, PermissionKind, PermissionReply};
use crate::metrics::DriveMetricsStorage;

/// How a media error was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemapOutcome {
    /// The consumer owns the range and repairs it.
    Delegated,
    /// Write-verify succeeded.
    Healed,
    /// The lba kept failing; the scan moves on without it.
    GaveUp { lba: Lba },
    /// The consumer asked to be asked again later.
    Deferred,
}

pub(crate) async fn negotiate(
    drive: &DriveInner,
    range: BlockRange,
    failing_lba: Lba,
) -> DrivecapResult<RemapOutcome> {
    match drive.upstream.ask(PermissionKind::RemapAction, range).await {
        PermissionReply::Granted => {
            tracing::info!(lba = failing_lba, "Consumer takes over media error repair");
            Ok(RemapOutcome::Delegated)
        }
        PermissionReply::Denied => {
            tracing::debug!(lba = failing_lba, "Consumer deferred media error repair");
            Ok(RemapOutcome::Deferred)
        }
        PermissionReply::NotConsumed => self_heal(drive, range, failing_lba).await,
    }
}

/// Write-verify zeros over `range` until it sticks.
///
/// Media errors are counted per failing lba, starting with the one the
/// sniff verify found: after `max_remap_attempts` errors at the same lba
/// the remap gives up. A different lba failing restarts the count, up to
/// `MAX_REMAP_LBAS` distinct lbas per range.
async fn self_heal(
    drive: &DriveInner,
    range: BlockRange,
    first_lba: Lba,
) -> DrivecapResult<RemapOutcome> {
    let max_errors = drive.options.max_remap_attempts;
    let op = DeviceOp::WriteVerify {
        range,
        pattern: BlockPattern::Zeroed,
    };
    let mut failing = first_lba;
    let mut errors = 1u32;
    let mut lbas_seen = 1u32;

    loop {
        if errors >= max_errors {
            return Ok(give_up(drive, failing, errors));
        }
        DriveMetricsStorage::incr(&drive.metrics.remaps_attempted);
        let lba = match drive.device.issue(op).await {
            IoStatus::Success => {
                tracing::info!(lba = failing, errors, "Media error remapped");
                return Ok(RemapOutcome::Healed);
            }
            IoStatus::SoftMediaError { lba } | IoStatus::HardMediaError { lba } => lba,
            IoStatus::Failed => {
                return Err(DrivecapError::Retryable(format!(
                    "write-verify over {:#x}+{:#x} failed",
                    range.lba, range.blocks
                )));
            }
        };

        if lba != failing {
            lbas_seen += 1;
            if lbas_seen > MAX_REMAP_LBAS {
                return Ok(give_up(drive, lba, 1));
            }
            tracing::warn!(previous = failing, lba, "Write-verify failed at another lba");
            failing = lba;
            errors = 1;
            continue;
        }
        errors += 1;
        tracing::warn!(lba, errors, "Media error persists after write-verify");
    }
}

fn give_up(drive: &DriveInner, lba: Lba, errors: u32) -> RemapOutcome {
    tracing::error!(
        drive = %drive.options.name,
        lba,
        errors,
        "Giving up on media error, leaving lba unrepaired"
    );
    DriveMetricsStorage::incr(&drive.metrics.remaps_given_up);
    RemapOutcome::GaveUp { lba }
}
