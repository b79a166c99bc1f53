//! Drive-wide and consumer-release re-zero requests.

use drivecap_shared::{DrivecapError, DrivecapResult};

use crate::checkpoint::{Cursor, DriveFlags};
use crate::chunk::{BlockRange, ChunkRecord, ChunkSpan, Lba};
use crate::drive::DriveInner;

/// Send every exported chunk through background zero again.
pub(crate) async fn mark_disk_zero(drive: &DriveInner) -> DrivecapResult<()> {
    let geometry = drive.geometry;
    let mut checkpoints = drive.checkpoints.lock().await;
    let end_chunk = geometry.chunk_index(checkpoints.end_lba());

    for part in geometry.split_by_page(ChunkSpan::new(0, end_chunk)) {
        let _region = drive.chunk_map.lock(part).await;
        let (mut records, page_lost) = drive.read_or_untrusted(part).await?;
        records.iter_mut().for_each(ChunkRecord::mark_disk_zero);
        drive
            .persist_records(&mut checkpoints, part.start, &records, page_lost)
            .await?;
    }
    checkpoints.reset(Cursor::Zero, 0).await?;
    drop(checkpoints);

    tracing::info!(drive = %drive.options.name, chunks = end_chunk, "Marked whole drive for zero");
    drive.zero_wake.notify_one();
    Ok(())
}

/// Return consumed chunks in a released range to the provisioned state.
///
/// Unreadable pages are left to verify-invalidate; their records are never
/// guessed.
pub(crate) async fn mark_consumed_zero(
    drive: &DriveInner,
    lba: Lba,
    blocks: u64,
) -> DrivecapResult<()> {
    let geometry = drive.geometry;
    let chunk_size = geometry.chunk_size();
    if blocks == 0 || lba % chunk_size != 0 || blocks % chunk_size != 0 {
        return Err(DrivecapError::InvalidRequest(format!(
            "consumed range {:#x}+{:#x} is not chunk aligned",
            lba, blocks
        )));
    }
    if lba.checked_add(blocks).is_none_or(|end| end > drive.capacity_blocks()) {
        return Err(DrivecapError::InvalidRequest(format!(
            "consumed range {:#x}+{:#x} exceeds capacity",
            lba, blocks
        )));
    }

    let span = geometry.covering_span(BlockRange::new(lba, blocks));
    let mut checkpoints = drive.checkpoints.lock().await;
    let mut lowest_changed = None;
    let mut scrubbed = 0u64;

    for part in geometry.split_by_page(span) {
        let _region = drive.chunk_map.lock(part).await;
        let (mut records, page_lost) = drive.read_or_untrusted(part).await?;
        if page_lost {
            drive
                .schedule_verify_invalidate(&mut checkpoints, part.start)
                .await?;
            continue;
        }
        let mut first = None;
        for (i, record) in records.iter_mut().enumerate() {
            if record.scrub() {
                first.get_or_insert(i as u64);
                scrubbed += 1;
            }
        }
        let Some(first) = first else { continue };
        drive
            .persist_records(&mut checkpoints, part.start, &records, false)
            .await?;
        lowest_changed.get_or_insert(part.start + first);
    }

    if let Some(chunk) = lowest_changed {
        checkpoints.insert_flags(DriveFlags::SCRUB_NEEDED).await?;
        checkpoints
            .retract(Cursor::Zero, geometry.chunk_start_lba(chunk))
            .await?;
        drop(checkpoints);
        tracing::info!(lba, blocks, chunks = scrubbed, "Scrubbing released range");
        drive.zero_wake.notify_one();
    }
    Ok(())
}
