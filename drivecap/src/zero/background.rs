//! Background zero engine.
//!
//! Walks the zero checkpoint from lba 0 to the end of capacity, zeroing
//! every chunk whose record asks for it. One cycle covers at most
//! `max_zero_chunks` chunks inside a single metadata page and holds the
//! drive-wide lock throughout, so a user zero request cannot retract the
//! checkpoint underneath a cycle that is about to advance it.

use drivecap_shared::DrivecapResult;
use tracing::Instrument;

use crate::checkpoint::{AdvanceOutcome, CheckpointStore, Cursor, DriveFlags};
use crate::chunk::{ChunkRecord, ChunkSpan, Lba, next_invalid, next_marked};
use crate::drive::{CycleOutcome, DeferReason, DriveInner};
use crate::io::{DeviceOp, PagedWriteMode, PermissionKind, PermissionReply, ZeroMethod};
use crate::metrics::DriveMetricsStorage;

pub(crate) async fn run_cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let span = tracing::debug_span!("bgz_cycle", drive = %drive.options.name);
    cycle(drive).instrument(span).await
}

async fn cycle(drive: &DriveInner) -> DrivecapResult<CycleOutcome> {
    let mut checkpoints = drive.checkpoints.lock().await;
    let from = checkpoints.get(Cursor::Zero);
    let end_lba = checkpoints.end_lba();
    if from >= end_lba {
        finish_pass(drive, &mut checkpoints).await?;
        return Ok(CycleOutcome::Idle);
    }
    DriveMetricsStorage::incr(&drive.metrics.bgz_cycles);

    let geometry = drive.geometry;
    let end_chunk = geometry.chunk_index(end_lba);
    let unit = geometry.unit_from(from, drive.options.max_zero_chunks, end_chunk);
    let _region = drive.chunk_map.lock(unit).await;

    let (records, page_lost) = drive.read_or_untrusted(unit).await?;
    if page_lost {
        drive
            .schedule_verify_invalidate(&mut checkpoints, unit.start)
            .await?;
        return Ok(CycleOutcome::deferred(DeferReason::VerifyInvalidatePending));
    }

    // Never zero past an untrusted record.
    let usable = next_invalid(&records, 0).unwrap_or(records.len());
    if usable == 0 {
        tracing::debug!(chunk = unit.start, "Untrusted record at zero checkpoint");
        drive
            .schedule_verify_invalidate(&mut checkpoints, unit.start)
            .await?;
        return Ok(CycleOutcome::deferred(DeferReason::VerifyInvalidatePending));
    }
    let records = &records[..usable];
    let unit = ChunkSpan::new(unit.start, usable as u64);

    match next_marked(records, 0) {
        Some(0) => {}
        first => {
            // Skip ahead to the first chunk with work, or past the unit.
            let stop = first.map_or(unit.end(), |i| unit.start + i as u64);
            let to = geometry.chunk_start_lba(stop);
            return advance(drive, &mut checkpoints, from, to, false).await;
        }
    }

    // Zero only the leading run that needs it; later chunks may hold data.
    let run = records
        .iter()
        .take_while(|record| record.needs_zero_io())
        .count();
    let records = &records[..run];
    let unit = ChunkSpan::new(unit.start, run as u64);

    let range = geometry.span_blocks(unit);
    if drive
        .upstream
        .ask(PermissionKind::ZeroPermission, range)
        .await
        == PermissionReply::Denied
    {
        tracing::debug!(lba = range.lba, blocks = range.blocks, "Upstream denied background zero");
        return Ok(CycleOutcome::deferred(DeferReason::UpstreamDenied));
    }

    let method = drive.background_zero_method();
    let op = DeviceOp::Zero { range, method };
    DriveMetricsStorage::incr(&drive.metrics.zero_ios);
    drive.device.issue(op).await.into_result(&op)?;

    if !drive.is_ready() {
        tracing::debug!("Drive left ready state, dropping background zero result");
        return Ok(CycleOutcome::deferred(DeferReason::NotReady));
    }

    let deallocate = method == ZeroMethod::Deallocate;
    let updated: Vec<ChunkRecord> = records
        .iter()
        .map(|record| {
            let mut record = *record;
            record.complete_background_zero(deallocate);
            record
        })
        .collect();

    // Without a consumer nobody reads the records, so consecutive updates to
    // one page are coalesced into a single write.
    let coalesce = !drive.consumer_bound()
        && !geometry.is_last_in_page(unit.end() - 1)
        && unit.end() < end_chunk;
    if coalesce {
        drive.chunk_map.write_deferred(unit.start, &updated).await?;
        DriveMetricsStorage::incr(&drive.metrics.deferred_page_writes);
    } else {
        drive
            .chunk_map
            .write(unit.start, &updated, PagedWriteMode::Update)
            .await?;
    }

    let to = geometry.chunk_start_lba(unit.end());
    advance(drive, &mut checkpoints, from, to, true).await
}

async fn advance(
    drive: &DriveInner,
    checkpoints: &mut CheckpointStore,
    from: Lba,
    to: Lba,
    issued_io: bool,
) -> DrivecapResult<CycleOutcome> {
    match checkpoints.advance(Cursor::Zero, from, to).await? {
        AdvanceOutcome::Advanced => {
            tracing::trace!(from, to, issued_io, "Zero checkpoint advanced");
            if !issued_io {
                DriveMetricsStorage::incr(&drive.metrics.metadata_only_advances);
            }
            if to >= checkpoints.end_lba() {
                finish_pass(drive, checkpoints).await?;
                tracing::info!(drive = %drive.options.name, "Background zero reached end of capacity");
            }
            let cursor = Cursor::Zero;
            Ok(if issued_io {
                CycleOutcome::Completed { cursor, from, to }
            } else {
                CycleOutcome::Skipped { cursor, from, to }
            })
        }
        AdvanceOutcome::Rejected { current } => {
            tracing::debug!(from, to, current, "Zero checkpoint moved during cycle");
            Ok(CycleOutcome::deferred(DeferReason::CheckpointMoved))
        }
    }
}

/// Zero checkpoint is at the end of capacity.
async fn finish_pass(drive: &DriveInner, checkpoints: &mut CheckpointStore) -> DrivecapResult<()> {
    drive.chunk_map.flush().await?;
    if checkpoints.flags().contains(DriveFlags::SCRUB_NEEDED) {
        checkpoints.remove_flags(DriveFlags::SCRUB_NEEDED).await?;
        tracing::info!(drive = %drive.options.name, "Scrub complete");
    }
    Ok(())
}
