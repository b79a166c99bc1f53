//! Integration tests for drive lifecycle, control requests and persistence.

use std::sync::Arc;
use std::time::Duration;

use drivecap::backend::{
    FileNonPagedStore, FilePagedStore, LoadScheduler, MemoryDevice, ScriptedUpstream,
};
use drivecap::checkpoint::DriveFlags;
use drivecap::chunk::{ChunkRecord, ChunkSpan};
use drivecap::io::{DeviceOp, ZeroMethod};
use drivecap::{
    Drive, DriveCollaborators, DriveOptions, DriveStatus, DrivecapError, Engine, ZeroRequest,
};
use drivecap_test_utils::{CHUNK, RECORDS_PER_PAGE, TestDrive, TestDriveBuilder, run_until_idle};
use tempfile::TempDir;

// ============================================================================
// STATUS
// ============================================================================

#[tokio::test]
async fn status_transitions() {
    let t = TestDrive::new(4).await;
    let drive = t.drive();
    assert_eq!(drive.status(), DriveStatus::Ready);

    drive.quiesce().unwrap();
    assert_eq!(drive.status(), DriveStatus::Quiesced);
    assert!(matches!(drive.quiesce(), Err(DrivecapError::InvalidState(_))));

    drive.unquiesce().unwrap();
    assert_eq!(drive.status(), DriveStatus::Ready);

    drive.destroy().await.unwrap();
    assert_eq!(drive.status(), DriveStatus::Destroyed);
    assert!(drive.unquiesce().is_err());
    assert!(matches!(
        drive.submit(ZeroRequest::MarkDiskZero).await,
        Err(DrivecapError::InvalidState(_))
    ));
    assert!(drive.start_background().is_err());
}

#[tokio::test]
async fn chunk_map_must_hold_every_chunk() {
    let t = TestDrive::new(4).await;
    let mut options = t.options.clone();
    options.capacity_blocks = 8 * CHUNK;

    let err = Drive::open(options, t.collaborators()).await.unwrap_err();
    assert!(matches!(err, DrivecapError::Config(_)));
}

// ============================================================================
// RESTART
// ============================================================================

#[tokio::test]
async fn reopen_resumes_from_persisted_state() {
    let t = TestDrive::new(16).await;
    t.drive().set_consumer_bound(true).await.unwrap();
    t.drive().run_background_zero_cycle().await.unwrap();
    t.drive().run_sniff_cycle().await.unwrap();
    t.drive().begin_rekey().await.unwrap();

    let reopened = t.reopen().await;
    let state = reopened.checkpoints().await;
    assert_eq!(state, t.drive().checkpoints().await);
    assert_eq!(state.zero_checkpoint, 4 * CHUNK);
    assert_eq!(state.sniff_checkpoint, CHUNK);
    assert!(state.flags.contains(DriveFlags::REKEY_IN_PROGRESS));

    t.device.clear_ops();
    reopened.run_background_zero_cycle().await.unwrap();
    assert!(matches!(
        t.zero_ops()[0],
        DeviceOp::Zero {
            method: ZeroMethod::Buffer,
            ..
        }
    ));
    assert_eq!(t.zero_ops()[0].range(), t.chunk_range(4, 4));
}

#[tokio::test]
async fn destroy_flushes_staged_records() {
    let t = TestDrive::new(16).await;
    t.drive().run_background_zero_cycle().await.unwrap();
    assert!(t.paged.records()[..4].iter().all(|r| r.need_zero));

    t.drive().destroy().await.unwrap();

    assert!(t.paged.records()[..4].iter().all(|r| !r.need_zero));
}

#[tokio::test]
async fn binding_a_consumer_flushes_staged_records() {
    let t = TestDrive::new(16).await;
    t.drive().run_background_zero_cycle().await.unwrap();

    t.drive().set_consumer_bound(true).await.unwrap();

    assert!(t.paged.records()[..4].iter().all(|r| !r.need_zero));
}

#[tokio::test]
async fn file_backed_drive_survives_restart() {
    let home = TempDir::new().expect("Failed to create temp dir");
    let options = DriveOptions {
        records_per_page: RECORDS_PER_PAGE,
        max_zero_chunks: 4,
        ..DriveOptions::with_chunks(20)
    };
    let device = Arc::new(MemoryDevice::new(options.capacity_blocks));
    let collaborators = |paged: FilePagedStore, nonpaged: FileNonPagedStore| DriveCollaborators {
        device: device.clone(),
        paged: Arc::new(paged),
        nonpaged: Arc::new(nonpaged),
        upstream: Arc::new(ScriptedUpstream::new()),
        scheduler: Arc::new(LoadScheduler::default()),
    };
    let map_path = home.path().join("chunkmap.bin");
    let state_path = home.path().join("nonpaged.json");

    {
        let drive = Drive::create(
            options.clone(),
            collaborators(
                FilePagedStore::create(&map_path, 20).await.unwrap(),
                FileNonPagedStore::create(&state_path).await.unwrap(),
            ),
        )
        .await
        .unwrap();
        drive.run_background_zero_cycle().await.unwrap();
        drive.zero(12 * CHUNK, CHUNK).await.unwrap();
        drive.destroy().await.unwrap();
    }

    let drive = Drive::open(
        options.clone(),
        collaborators(
            FilePagedStore::open(&map_path, 20).await.unwrap(),
            FileNonPagedStore::open(&state_path).await.unwrap(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(drive.checkpoints().await.zero_checkpoint, 4 * CHUNK);
    let records = drive.records(ChunkSpan::new(0, 20)).await.unwrap();
    assert!(records[..4].iter().all(|r| !r.need_zero));
    assert!(records[4..].iter().all(|r| r.valid));
    assert!(records[12].user_zero);

    run_until_idle(&drive, Engine::BackgroundZero).await.unwrap();
    assert_eq!(drive.checkpoints().await.zero_checkpoint, 20 * CHUNK);
}

// ============================================================================
// BACKGROUND ENGINES
// ============================================================================

#[tokio::test]
async fn background_engines_finish_zeroing_and_scan() {
    let t = TestDrive::new(16).await;
    t.drive().start_background().unwrap();
    // Idempotent.
    t.drive().start_background().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = t.drive().checkpoints().await;
        if state.zero_checkpoint == 16 * CHUNK && state.report.pass_count >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "background engines stalled at {:?}",
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    t.drive().destroy().await.unwrap();
    assert!(t.paged.records().iter().all(|r| !r.needs_zero_io()));
}

#[tokio::test]
async fn mark_disk_zero_wakes_idle_background_zero() {
    let t = TestDriveBuilder::new(8)
        .with_options(|options| {
            options.sniff_enabled = false;
            options.idle_interval_ms = 60_000;
        })
        .create()
        .await;
    t.drive().set_consumer_bound(true).await.unwrap();
    t.drive().start_background().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while t.drive().checkpoints().await.zero_checkpoint < 8 * CHUNK {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    t.drive().submit(ZeroRequest::MarkDiskZero).await.unwrap();
    // Far shorter than the idle interval; only the wake-up can get it done.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while t.device.zero_ops_touching(t.chunk_range(0, 8)) < 4 {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    t.drive().destroy().await.unwrap();
}

// ============================================================================
// CONTROL REQUESTS
// ============================================================================

#[tokio::test]
async fn provision_grows_capacity() {
    let t = TestDriveBuilder::new(8).paged_capacity(32).create().await;
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    t.drive().provision(20 * CHUNK).await.unwrap();
    assert_eq!(t.drive().capacity_blocks(), 20 * CHUNK);
    assert_eq!(
        t.records(8, 12).await,
        vec![ChunkRecord::provisioned(); 12]
    );

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 20 * CHUNK);
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(8, 12)), 3);
    // The existing chunks were not zeroed again.
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(0, 8)), 2);
}

#[tokio::test]
async fn provision_rejects_bad_capacity() {
    let t = TestDriveBuilder::new(8).paged_capacity(16).create().await;

    for capacity in [8 * CHUNK + 1, 17 * CHUNK, 4 * CHUNK] {
        let err = t.drive().provision(capacity).await.unwrap_err();
        assert!(err.is_invalid_request(), "capacity {:#x}: {}", capacity, err);
    }
    assert_eq!(t.drive().capacity_blocks(), 8 * CHUNK);
}

#[tokio::test]
async fn mark_disk_zero_restarts_background_zero() {
    let t = TestDrive::new(8).await;
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    t.drive().zero(0, 2 * CHUNK).await.unwrap();
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    t.drive().submit(ZeroRequest::MarkDiskZero).await.unwrap();
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 0);
    assert_eq!(
        t.records(0, 8).await,
        vec![ChunkRecord::provisioned(); 8]
    );

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(0, 8)), 4);
}

#[tokio::test]
async fn mark_consumed_zero_scrubs_consumed_chunks() {
    let t = TestDrive::new(8).await;
    let consumed = ChunkRecord {
        valid: true,
        need_zero: false,
        user_zero: false,
        consumed_user_data: true,
    };
    t.set_records(2, &[consumed; 2]);
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(2, 2)), 0);

    t.drive()
        .submit(ZeroRequest::MarkConsumedZero {
            lba: 0,
            blocks: 8 * CHUNK,
        })
        .await
        .unwrap();

    let state = t.drive().checkpoints().await;
    assert_eq!(state.zero_checkpoint, t.chunk_lba(2));
    assert!(state.flags.contains(DriveFlags::SCRUB_NEEDED));
    assert_eq!(t.records(2, 2).await, vec![ChunkRecord::provisioned(); 2]);

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(2, 2)), 1);
    assert!(
        !t.drive()
            .checkpoints()
            .await
            .flags
            .contains(DriveFlags::SCRUB_NEEDED)
    );
}

#[tokio::test]
async fn mark_consumed_zero_requires_chunk_alignment() {
    let t = TestDrive::new(8).await;

    let err = t
        .drive()
        .submit(ZeroRequest::MarkConsumedZero {
            lba: 0x40,
            blocks: CHUNK,
        })
        .await
        .unwrap_err();
    assert!(err.is_invalid_request());
}

#[tokio::test]
async fn mark_consumed_zero_without_consumed_chunks_is_a_no_op() {
    let t = TestDrive::new(8).await;
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    t.drive()
        .submit(ZeroRequest::MarkConsumedZero {
            lba: 0,
            blocks: 8 * CHUNK,
        })
        .await
        .unwrap();

    let state = t.drive().checkpoints().await;
    assert_eq!(state.zero_checkpoint, 8 * CHUNK);
    assert!(!state.flags.contains(DriveFlags::SCRUB_NEEDED));
}

// ============================================================================
// INSPECTION
// ============================================================================

#[tokio::test]
async fn inspect_summarises_the_drive() {
    let t = TestDrive::new(32).await;
    t.drive().run_background_zero_cycle().await.unwrap();
    t.paged.corrupt_page(1);

    let snapshot = t.drive().inspect().await.unwrap();
    assert_eq!(snapshot.name, "test-drive");
    assert_eq!(snapshot.status, DriveStatus::Ready);
    assert_eq!(snapshot.chunks.total, 32);
    assert_eq!(snapshot.chunks.needs_zero, 12);
    assert_eq!(snapshot.chunks.unreadable_pages, 1);
    assert_eq!(snapshot.flags, vec!["SNIFF_ENABLED".to_string()]);
    assert_eq!(snapshot.metrics.zero_ios, 1);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["status"], "ready");
    assert_eq!(json["chunks"]["total"], 32);
}
