//! Integration tests for the background zero engine.

use drivecap::backend::LoadScheduler;
use drivecap::checkpoint::{Cursor, NonPagedField};
use drivecap::chunk::ChunkRecord;
use drivecap::io::{DeviceOp, PermissionKind, PermissionReply, ZeroMethod};
use drivecap::{CycleOutcome, DeferReason, Engine};
use drivecap_test_utils::{CHUNK, TestDrive, TestDriveBuilder, run_until_idle};

const ZEROED: ChunkRecord = ChunkRecord {
    valid: true,
    need_zero: false,
    user_zero: false,
    consumed_user_data: false,
};

fn deferred(reason: DeferReason) -> CycleOutcome {
    CycleOutcome::Deferred { reason }
}

// ============================================================================
// FULL PASS
// ============================================================================

#[tokio::test]
async fn fresh_drive_zeroes_every_chunk_once() {
    let t = TestDrive::new(40).await;

    let outcomes = t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(outcomes.len(), 11);
    assert_eq!(*outcomes.last().unwrap(), CycleOutcome::Idle);
    assert!(
        outcomes[..10]
            .iter()
            .all(|o| matches!(o, CycleOutcome::Completed { cursor: Cursor::Zero, .. }))
    );

    for chunk in 0..40 {
        assert_eq!(
            t.device.zero_ops_touching(t.chunk_range(chunk, 1)),
            1,
            "chunk {} zeroed more or less than once",
            chunk
        );
    }
    let state = t.drive().checkpoints().await;
    assert_eq!(state.zero_checkpoint, 40 * CHUNK);

    // Durable, not just cached.
    assert!(t.paged.records().iter().all(|r| *r == ZEROED));

    let metrics = t.drive().metrics();
    assert_eq!(metrics.zero_ios, 10);
    assert_eq!(metrics.bgz_cycles, 10);
    assert_eq!(metrics.metadata_only_advances, 0);
}

#[tokio::test]
async fn zero_ops_stay_inside_one_page() {
    let t = TestDriveBuilder::new(40).max_zero_chunks(6).create().await;

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    let geometry = t.drive().geometry();
    for op in t.zero_ops() {
        let range = op.range();
        let first = geometry.chunk_index(range.lba);
        let last = geometry.chunk_index(range.end() - 1);
        assert_eq!(geometry.page_of(first), geometry.page_of(last), "{:?}", op);
        assert!(last - first < 6);
    }
}

#[tokio::test]
async fn idle_drive_reports_idle() {
    let t = TestDrive::new(4).await;
    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    t.device.clear_ops();

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert!(t.device.ops().is_empty());
}

// ============================================================================
// METADATA-ONLY ADVANCES
// ============================================================================

#[tokio::test]
async fn already_zeroed_chunks_advance_without_io() {
    let t = TestDrive::new(16).await;
    t.set_records(0, &[ZEROED; 16]);

    let outcomes = t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(
        outcomes[..4]
            .iter()
            .all(|o| matches!(o, CycleOutcome::Skipped { .. }))
    );
    assert!(t.device.ops().is_empty());
    assert_eq!(t.drive().metrics().metadata_only_advances, 4);
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 16 * CHUNK);
}

#[tokio::test]
async fn skips_ahead_to_first_chunk_with_work() {
    let t = TestDrive::new(8).await;
    t.set_records(0, &[ZEROED; 2]);

    let first = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        first,
        CycleOutcome::Skipped {
            cursor: Cursor::Zero,
            from: 0,
            to: 2 * CHUNK,
        }
    );
    assert!(t.device.ops().is_empty());

    let second = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        second,
        CycleOutcome::Completed {
            cursor: Cursor::Zero,
            from: 2 * CHUNK,
            to: 6 * CHUNK,
        }
    );
    assert_eq!(t.zero_ops()[0].range(), t.chunk_range(2, 4));
}

#[tokio::test]
async fn consumed_chunks_inside_a_unit_are_not_zeroed() {
    let t = TestDrive::new(8).await;
    let consumed = ChunkRecord {
        consumed_user_data: true,
        ..ZEROED
    };
    t.set_records(2, &[consumed]);

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    assert_eq!(t.device.zero_ops_touching(t.chunk_range(2, 1)), 0);
    for chunk in [0, 1, 3, 4, 5, 6, 7] {
        assert_eq!(t.device.zero_ops_touching(t.chunk_range(chunk, 1)), 1);
    }
    assert_eq!(t.records(2, 1).await[0], consumed);
}

// ============================================================================
// ZERO METHODS
// ============================================================================

#[tokio::test]
async fn deallocating_zero_keeps_need_zero() {
    let t = TestDriveBuilder::new(4)
        .deallocate_on_zero(true)
        .create()
        .await;

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    let ops = t.zero_ops();
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        ops[0],
        DeviceOp::Zero {
            method: ZeroMethod::Deallocate,
            ..
        }
    ));
    assert!(t.records(0, 4).await.iter().all(|r| r.need_zero && r.valid));
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 4 * CHUNK);
}

#[tokio::test]
async fn rekey_falls_back_to_buffered_zero() {
    let t = TestDrive::new(8).await;

    t.drive().begin_rekey().await.unwrap();
    t.drive().run_background_zero_cycle().await.unwrap();
    t.drive().end_rekey().await.unwrap();
    t.drive().run_background_zero_cycle().await.unwrap();

    let methods: Vec<_> = t
        .zero_ops()
        .iter()
        .map(|op| match op {
            DeviceOp::Zero { method, .. } => *method,
            other => panic!("unexpected op {:?}", other),
        })
        .collect();
    assert_eq!(methods, vec![ZeroMethod::Buffer, ZeroMethod::WriteSame]);
}

#[tokio::test]
async fn no_write_same_uses_buffered_zero() {
    let t = TestDriveBuilder::new(4).write_same(false).create().await;
    t.device.set_write_same_supported(false);

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();

    assert!(matches!(
        t.zero_ops()[0],
        DeviceOp::Zero {
            method: ZeroMethod::Buffer,
            ..
        }
    ));
}

// ============================================================================
// DEFERRALS AND FAILURES
// ============================================================================

#[tokio::test]
async fn upstream_denial_defers_without_io() {
    let t = TestDrive::new(8).await;
    t.upstream
        .set_default(PermissionKind::ZeroPermission, PermissionReply::Denied);

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(outcome, deferred(DeferReason::UpstreamDenied));
    assert!(t.device.ops().is_empty());
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 0);
    assert_eq!(t.upstream.asked(PermissionKind::ZeroPermission), vec![t.chunk_range(0, 4)]);
}

#[tokio::test]
async fn device_failure_leaves_checkpoint_for_retry() {
    let t = TestDrive::new(8).await;
    t.device.fail_next(1);

    let err = t.drive().run_background_zero_cycle().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(t.drive().checkpoints().await.zero_checkpoint, 0);
    assert!(t.records(0, 4).await.iter().all(|r| r.need_zero));

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            cursor: Cursor::Zero,
            from: 0,
            to: 4 * CHUNK,
        }
    );
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(0, 4)), 2);
}

#[tokio::test]
async fn quiesced_drive_defers_cycles() {
    let t = TestDrive::new(8).await;
    t.drive().quiesce().unwrap();

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(outcome, deferred(DeferReason::NotReady));
    assert!(t.device.ops().is_empty());

    t.drive().unquiesce().unwrap();
    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert!(outcome.made_progress());
}

#[tokio::test]
async fn admission_denial_defers_cycle() {
    let t = TestDriveBuilder::new(8)
        .scheduler(LoadScheduler::new(0, 0, 10))
        .create()
        .await;

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(outcome, deferred(DeferReason::Admission));
    assert!(t.device.ops().is_empty());

    let metrics = t.drive().metrics();
    assert_eq!(metrics.admission_denials, 1);
    assert_eq!(metrics.admission_grants, 0);
}

// ============================================================================
// UNTRUSTED RECORDS
// ============================================================================

#[tokio::test]
async fn untrusted_record_at_checkpoint_schedules_verify_invalidate() {
    let t = TestDrive::new(8).await;
    t.set_records(0, &[ChunkRecord::untrusted()]);

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        outcome,
        deferred(DeferReason::VerifyInvalidatePending)
    );
    assert!(t.device.ops().is_empty());

    let state = t.drive().checkpoints().await;
    assert_eq!(state.verify_invalidate_checkpoint, 0);
    assert_eq!(state.zero_checkpoint, 0);
}

#[tokio::test]
async fn zeroing_stops_before_untrusted_record() {
    let t = TestDrive::new(8).await;
    t.set_records(2, &[ChunkRecord::untrusted()]);

    let first = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        first,
        CycleOutcome::Completed {
            cursor: Cursor::Zero,
            from: 0,
            to: 2 * CHUNK,
        }
    );
    assert_eq!(t.zero_ops()[0].range(), t.chunk_range(0, 2));

    let second = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        second,
        deferred(DeferReason::VerifyInvalidatePending)
    );
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(2, 1)), 0);
}

#[tokio::test]
async fn unreadable_page_schedules_verify_invalidate() {
    let t = TestDrive::new(32).await;
    t.paged.corrupt_page(0);

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        outcome,
        deferred(DeferReason::VerifyInvalidatePending)
    );
    assert!(t.device.ops().is_empty());
    assert_eq!(t.drive().checkpoints().await.verify_invalidate_checkpoint, 0);
}

// ============================================================================
// CRASH CONSISTENCY
// ============================================================================

#[tokio::test]
async fn crash_before_checkpoint_advance_is_redone_safely() {
    let t = TestDrive::new(8).await;
    t.drive().set_consumer_bound(true).await.unwrap();

    t.drive().run_background_zero_cycle().await.unwrap();
    // The records were written but the advance is lost.
    t.nonpaged.set(NonPagedField::ZeroCheckpoint, 0);

    let reopened = t.reopen().await;
    run_until_idle(&reopened, Engine::BackgroundZero)
        .await
        .unwrap();

    assert_eq!(reopened.checkpoints().await.zero_checkpoint, 8 * CHUNK);
    assert!(t.paged.records().iter().all(|r| *r == ZEROED));
    // The revisit found the records done and issued no second zero.
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(0, 4)), 1);
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(4, 4)), 1);
}

#[tokio::test]
async fn bound_consumer_sees_every_update_durably() {
    let t = TestDrive::new(16).await;
    t.drive().set_consumer_bound(true).await.unwrap();

    t.drive().run_background_zero_cycle().await.unwrap();

    assert!(t.paged.records()[..4].iter().all(|r| *r == ZEROED));
    assert_eq!(t.drive().metrics().deferred_page_writes, 0);
}

#[tokio::test]
async fn unbound_drive_coalesces_page_writes() {
    let t = TestDrive::new(16).await;

    t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(t.drive().metrics().deferred_page_writes, 1);
    // Visible through the drive before it is durable.
    assert!(t.records(0, 4).await.iter().all(|r| *r == ZEROED));

    t.drive().flush().await.unwrap();
    assert!(t.paged.records()[..4].iter().all(|r| *r == ZEROED));
}
