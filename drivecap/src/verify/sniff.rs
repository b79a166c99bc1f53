//! Sniff verify: a continuous low-priority read scan for latent media
//! defects, one chunk per cycle.
//!
//! The sniff checkpoint only moves once the chunk's media error (if any)
//! is recorded in the verify report and settled by the remap negotiation.
//! The report rolls over before the checkpoint wraps to lba 0. The rollover
//! leaves `wrap_pending` set until the wrap is durable, so a wrap retried
//! after a failed write or a crash does not close the pass twice.

use chrono::Utc;
use drivecap_shared::{DrivecapError, DrivecapResult};
use drivecap_shared::constants::lba::INVALID as LBA_INVALID;
use tracing::Instrument;

use crate::checkpoint::{AdvanceOutcome, CheckpointStore, Cursor, DriveFlags, MediaErrorKind};
use crate::chunk::{BlockRange, Lba};
use crate::drive::{CycleOutcome, DeferReason, DriveInner};
use crate::io::{DeviceOp, IoStatus};
use crate::metrics::DriveMetricsStorage;
use crate::verify::remap::{self, RemapOutcome};

pub(crate) async fn run_cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let span = tracing::debug_span!("sniff_cycle", drive = %drive.options.name);
    cycle(drive).instrument(span).await
}

async fn cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let (from, range) = {
        let mut checkpoints = drive.checkpoints.lock().await;
        if !checkpoints.flags().contains(DriveFlags::SNIFF_ENABLED) {
            return Ok(CycleOutcome::Idle);
        }
        let from = checkpoints.get(Cursor::Sniff);
        let end_lba = checkpoints.end_lba();
        if from >= end_lba {
            return complete_pass(drive, &mut checkpoints).await;
        }
        if from == 0 && checkpoints.report().wrap_pending {
            // Wrapped, but the marker was never cleared.
            checkpoints
                .update_report(|report| report.wrap_pending = false)
                .await?;
        }
        let chunk_end = drive
            .geometry
            .chunk_start_lba(drive.geometry.chunk_index(from) + 1);
        (from, BlockRange::new(from, chunk_end.min(end_lba) - from))
    };

    // Verify runs without the drive lock; the advance below is conditional
    // on the checkpoint still being where this cycle found it.
    DriveMetricsStorage::incr(&drive.metrics.sniff_verifies);
    let status = drive.device.issue(DeviceOp::Verify { range }).await;
    let error = match status {
        IoStatus::Success => None,
        IoStatus::SoftMediaError { lba } => Some((lba, MediaErrorKind::Recoverable)),
        IoStatus::HardMediaError { lba } => Some((lba, MediaErrorKind::Unrecoverable)),
        IoStatus::Failed => {
            return Err(DrivecapError::Retryable(format!(
                "sniff verify of {:#x}+{:#x} failed",
                range.lba, range.blocks
            )));
        }
    };

    if let Some((lba, kind)) = error {
        DriveMetricsStorage::incr(&drive.metrics.media_errors);
        tracing::warn!(lba, ?kind, "Sniff verify found media error");
        record_media_error(drive, lba, kind).await?;

        match remap::negotiate(drive, range, lba).await? {
            RemapOutcome::Deferred => {
                return Ok(CycleOutcome::deferred(DeferReason::UpstreamDenied));
            }
            RemapOutcome::Delegated | RemapOutcome::Healed | RemapOutcome::GaveUp { .. } => {}
        }
    }

    if !drive.is_ready() {
        return Ok(CycleOutcome::deferred(DeferReason::NotReady));
    }

    let mut checkpoints = drive.checkpoints.lock().await;
    let to = range.end();
    match checkpoints.advance(Cursor::Sniff, from, to).await? {
        AdvanceOutcome::Advanced => {
            checkpoints.set_media_error_lba(LBA_INVALID).await?;
            if to >= checkpoints.end_lba() {
                return complete_pass(drive, &mut checkpoints).await;
            }
            Ok(CycleOutcome::Completed {
                cursor: Cursor::Sniff,
                from,
                to,
            })
        }
        AdvanceOutcome::Rejected { current } => {
            tracing::debug!(from, to, current, "Sniff checkpoint moved during verify");
            Ok(CycleOutcome::deferred(DeferReason::CheckpointMoved))
        }
    }
}

/// Count the error once per chunk: a retried cycle finds the failing lba
/// already recorded.
async fn record_media_error(drive: &DriveInner, lba: Lba, kind: MediaErrorKind) -> DrivecapResult<()> {
    let mut checkpoints = drive.checkpoints.lock().await;
    if checkpoints.media_error_lba() != LBA_INVALID {
        return Ok(());
    }
    checkpoints.update_report(|report| report.record(kind)).await?;
    checkpoints.set_media_error_lba(lba).await
}

async fn complete_pass(
    drive: &DriveInner,
    checkpoints: &mut CheckpointStore,
) -> DrivecapResult<CycleOutcome> {
    if !checkpoints.report().wrap_pending {
        checkpoints
            .update_report(|report| report.complete_pass(Utc::now()))
            .await?;
    }
    checkpoints.wrap_if_at_end(Cursor::Sniff).await?;
    checkpoints
        .update_report(|report| report.wrap_pending = false)
        .await?;

    let report = checkpoints.report();
    tracing::info!(
        drive = %drive.options.name,
        pass = report.pass_count,
        recoverable = report.previous.recoverable,
        unrecoverable = report.previous.unrecoverable,
        "Sniff pass complete"
    );
    Ok(CycleOutcome::Wrapped {
        pass_count: report.pass_count,
    })
}
