//! Verify-invalidate: rebuilds chunk records that can no longer be trusted.
//!
//! A chunk whose record is untrusted may hold anything, consumer data
//! included, so it is never zeroed. Instead the consumer is told, the
//! blocks are stamped with the invalidated pattern (reads report lost data
//! rather than returning stale content) and the record is rebuilt from the
//! consumer's answer. The cursor parks at `LBA_INVALID` between passes.

use drivecap_shared::DrivecapResult;
use drivecap_shared::constants::lba::INVALID as LBA_INVALID;
use tracing::Instrument;

use crate::checkpoint::{AdvanceOutcome, CheckpointStore, Cursor};
use crate::chunk::{ChunkRecord, ChunkSpan, Lba, next_invalid};
use crate::drive::{CycleOutcome, DeferReason, DriveInner};
use crate::io::{BlockPattern, DeviceOp, PagedWriteMode, PermissionKind, PermissionReply};
use crate::metrics::DriveMetricsStorage;

pub(crate) async fn run_cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let span = tracing::debug_span!("verify_invalidate_cycle", drive = %drive.options.name);
    cycle(drive).instrument(span).await
}

async fn cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let mut checkpoints = drive.checkpoints.lock().await;
    let from = checkpoints.get(Cursor::VerifyInvalidate);
    if from == LBA_INVALID {
        return Ok(CycleOutcome::Idle);
    }
    let end_lba = checkpoints.end_lba();
    if from >= end_lba {
        finish_pass(drive, &mut checkpoints).await?;
        return Ok(CycleOutcome::Idle);
    }

    let geometry = drive.geometry;
    let unit = geometry.unit_from(
        from,
        drive.options.max_zero_chunks,
        geometry.chunk_index(end_lba),
    );
    let _region = drive.chunk_map.lock(unit).await;
    let (records, page_lost) = drive.read_or_untrusted(unit).await?;

    let first = match next_invalid(&records, 0) {
        Some(first) => first,
        None => {
            let to = geometry.chunk_start_lba(unit.end());
            return advance(drive, &mut checkpoints, from, to, false).await;
        }
    };
    if first > 0 {
        let to = geometry.chunk_start_lba(unit.start + first as u64);
        return advance(drive, &mut checkpoints, from, to, false).await;
    }

    let run = records.iter().take_while(|r| r.is_invalid()).count();
    let target = ChunkSpan::new(unit.start, run as u64);
    let range = geometry.span_blocks(target);

    let consumed = match drive
        .upstream
        .ask(PermissionKind::InvalidateNotice, range)
        .await
    {
        PermissionReply::Denied => {
            tracing::debug!(lba = range.lba, blocks = range.blocks, "Upstream deferred invalidation");
            return Ok(CycleOutcome::deferred(DeferReason::UpstreamDenied));
        }
        PermissionReply::Granted => true,
        PermissionReply::NotConsumed => false,
    };

    let op = DeviceOp::Write {
        range,
        pattern: BlockPattern::Invalidated,
    };
    drive.device.issue(op).await.into_result(&op)?;
    DriveMetricsStorage::add(&drive.metrics.chunks_invalidated, run as u64);
    tracing::warn!(
        lba = range.lba,
        chunks = run,
        consumed,
        "Invalidated chunks with untrusted metadata"
    );

    if !drive.is_ready() {
        return Ok(CycleOutcome::deferred(DeferReason::NotReady));
    }

    // The page may have been unreadable; rewrite it without reading.
    let rebuilt = vec![ChunkRecord::reconstructed(consumed); run];
    let mode = if page_lost {
        PagedWriteMode::ForceWriteVerify
    } else {
        PagedWriteMode::Update
    };
    drive.chunk_map.write(target.start, &rebuilt, mode).await?;
    if !consumed {
        // Rebuilt as provisioned; background zero may already be past them.
        checkpoints
            .retract(Cursor::Zero, geometry.chunk_start_lba(target.start))
            .await?;
    }

    let to = geometry.chunk_start_lba(target.end());
    advance(drive, &mut checkpoints, from, to, true).await
}

async fn advance(
    drive: &DriveInner,
    checkpoints: &mut CheckpointStore,
    from: Lba,
    to: Lba,
    issued_io: bool,
) -> DrivecapResult<CycleOutcome> {
    let cursor = Cursor::VerifyInvalidate;
    match checkpoints.advance(cursor, from, to).await? {
        AdvanceOutcome::Advanced => {
            if to >= checkpoints.end_lba() {
                finish_pass(drive, checkpoints).await?;
            }
            Ok(if issued_io {
                CycleOutcome::Completed { cursor, from, to }
            } else {
                CycleOutcome::Skipped { cursor, from, to }
            })
        }
        AdvanceOutcome::Rejected { current } => {
            tracing::debug!(from, to, current, "Verify-invalidate checkpoint moved during cycle");
            Ok(CycleOutcome::deferred(DeferReason::CheckpointMoved))
        }
    }
}

async fn finish_pass(drive: &DriveInner, checkpoints: &mut CheckpointStore) -> DrivecapResult<()> {
    checkpoints
        .reset(Cursor::VerifyInvalidate, LBA_INVALID)
        .await?;
    tracing::info!(drive = %drive.options.name, "Verify-invalidate pass complete");
    drive.zero_wake.notify_one();
    Ok(())
}
