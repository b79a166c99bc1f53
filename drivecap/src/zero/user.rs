//! Foreground zero requests.
//!
//! Whole chunks are only marked in the chunk map; background zero writes
//! them later. Partial chunks at either end go straight to the device
//! because a record cannot describe half a chunk.

use drivecap_shared::{DrivecapError, DrivecapResult};
use tracing::Instrument;

use crate::checkpoint::{Cursor, DriveFlags};
use crate::chunk::{BlockRange, ChunkRecord, ChunkSpan, Lba};
use crate::drive::DriveInner;
use crate::io::DeviceOp;
use crate::metrics::DriveMetricsStorage;

pub(crate) async fn handle(drive: &DriveInner, lba: Lba, blocks: u64) -> DrivecapResult<()> {
    let span = tracing::info_span!("user_zero", drive = %drive.options.name, lba, blocks);
    async move {
        let range = validate(drive, lba, blocks)?;
        let _foreground = drive.admission.foreground();
        DriveMetricsStorage::incr(&drive.metrics.user_zero_requests);

        let split = drive.geometry.split_edges(range);
        let metadata = async {
            match split.whole {
                Some(whole) => mark_whole_chunks(drive, whole).await,
                None => Ok(()),
            }
        };
        let edges = zero_edges(drive, [split.pre, split.post]);
        tokio::try_join!(metadata, edges)?;

        tracing::debug!("User zero accepted");
        Ok(())
    }
    .instrument(span)
    .await
}

fn validate(drive: &DriveInner, lba: Lba, blocks: u64) -> DrivecapResult<BlockRange> {
    if blocks == 0 {
        return Err(DrivecapError::InvalidRequest(
            "zero request covers no blocks".into(),
        ));
    }
    let unit = drive.options.optimum_block_size;
    if lba % unit != 0 || blocks % unit != 0 {
        return Err(DrivecapError::InvalidRequest(format!(
            "zero request {:#x}+{:#x} is not aligned to {} blocks",
            lba, blocks, unit
        )));
    }
    let capacity = drive.capacity_blocks();
    match lba.checked_add(blocks) {
        Some(end) if end <= capacity => Ok(BlockRange::new(lba, blocks)),
        _ => Err(DrivecapError::InvalidRequest(format!(
            "zero request {:#x}+{:#x} exceeds capacity of {:#x} blocks",
            lba, blocks, capacity
        ))),
    }
}

/// Apply the user-zero transition to whole chunks and pull the zero
/// checkpoint back over them.
async fn mark_whole_chunks(drive: &DriveInner, whole: ChunkSpan) -> DrivecapResult<()> {
    let geometry = drive.geometry;
    let deallocate = drive.options.capabilities.deallocate_on_zero;
    let mut checkpoints = drive.checkpoints.lock().await;

    for part in geometry.split_by_page(whole) {
        let _region = drive.chunk_map.lock(part).await;
        let (records, page_lost) = drive.read_or_untrusted(part).await?;
        let updated: Vec<ChunkRecord> = records
            .into_iter()
            .map(|mut record| {
                record.request_user_zero(deallocate);
                record
            })
            .collect();
        drive
            .persist_records(&mut checkpoints, part.start, &updated, page_lost)
            .await?;
    }

    let lowest = geometry.chunk_start_lba(whole.start);
    match checkpoints.refresh(Cursor::Zero).await {
        Ok(current) => {
            if lowest < current {
                checkpoints.retract(Cursor::Zero, lowest).await?;
            }
        }
        Err(e) => {
            // Without the persisted checkpoint nothing says which chunks
            // background zero already passed; start over from lba 0.
            tracing::warn!(error = %e, "Zero checkpoint unreadable, scheduling full scrub");
            checkpoints.reset(Cursor::Zero, 0).await?;
            checkpoints.insert_flags(DriveFlags::SCRUB_NEEDED).await?;
        }
    }
    drop(checkpoints);

    drive.zero_wake.notify_one();
    Ok(())
}

async fn zero_edges(drive: &DriveInner, edges: [Option<BlockRange>; 2]) -> DrivecapResult<()> {
    let method = drive.fill_method();
    let writes = edges.into_iter().flatten().map(|range| async move {
        let op = DeviceOp::Zero { range, method };
        DriveMetricsStorage::incr(&drive.metrics.edge_zero_ios);
        drive.device.issue(op).await.into_result(&op)
    });
    futures::future::try_join_all(writes).await?;
    Ok(())
}
