//! Integration tests for verify-invalidate.

use drivecap::backend::poison_writes;
use drivecap::chunk::ChunkRecord;
use drivecap::io::{DeviceOp, PermissionKind, PermissionReply};
use drivecap::{CycleOutcome, DeferReason, DrivecapError, Engine, ZeroRequest};
use drivecap_test_utils::{CHUNK, TestDrive};

async fn untrusted_head(chunks: u64, untrusted: usize) -> TestDrive {
    let t = TestDrive::new(chunks).await;
    t.set_records(0, &vec![ChunkRecord::untrusted(); untrusted]);
    t
}

fn first_zero_at(ops: &[DeviceOp], lba: u64) -> Option<usize> {
    ops.iter().position(|op| {
        matches!(op, DeviceOp::Zero { .. }) && op.range().contains(lba)
    })
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[tokio::test]
async fn idle_without_pending_pass() {
    let t = TestDrive::new(8).await;

    let outcome = t.drive().run_verify_invalidate_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert!(!t.drive().checkpoints().await.verify_invalidate_pending());
}

#[tokio::test]
async fn request_schedules_from_page_start() {
    let t = TestDrive::new(40).await;

    t.drive()
        .submit(ZeroRequest::VerifyInvalidate {
            lba: t.chunk_lba(20) + 7,
        })
        .await
        .unwrap();
    assert_eq!(
        t.drive().checkpoints().await.verify_invalidate_checkpoint,
        t.chunk_lba(16)
    );

    // A later request further out does not move it forward.
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate {
            lba: t.chunk_lba(36),
        })
        .await
        .unwrap();
    assert_eq!(
        t.drive().checkpoints().await.verify_invalidate_checkpoint,
        t.chunk_lba(16)
    );
}

#[tokio::test]
async fn request_beyond_capacity_is_rejected() {
    let t = TestDrive::new(8).await;

    let err = t
        .drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 8 * CHUNK })
        .await
        .unwrap_err();
    assert!(matches!(err, DrivecapError::InvalidRequest(_)));
}

#[tokio::test]
async fn clean_range_is_skipped_without_io() {
    let t = TestDrive::new(16).await;
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 0 })
        .await
        .unwrap();

    let outcomes = t.run_until_idle(Engine::VerifyInvalidate).await.unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(
        outcomes[..4]
            .iter()
            .all(|o| matches!(o, CycleOutcome::Skipped { .. }))
    );
    assert!(t.device.ops().is_empty());
    assert!(!t.drive().checkpoints().await.verify_invalidate_pending());
}

// ============================================================================
// RECONSTRUCTION
// ============================================================================

#[tokio::test]
async fn unconsumed_chunks_are_poisoned_then_zeroed() {
    let t = untrusted_head(16, 4).await;

    let outcome = t.drive().run_background_zero_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Deferred {
            reason: DeferReason::VerifyInvalidatePending
        }
    );

    t.run_until_idle(Engine::VerifyInvalidate).await.unwrap();
    assert_eq!(poison_writes(&t.device.ops()), vec![t.chunk_range(0, 4)]);
    assert_eq!(t.records(0, 4).await, vec![ChunkRecord::provisioned(); 4]);
    assert_eq!(t.drive().metrics().chunks_invalidated, 4);

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    let ops = t.device.ops();
    let poison = ops
        .iter()
        .position(|op| matches!(op, DeviceOp::Write { .. }))
        .unwrap();
    let zero = first_zero_at(&ops, 0).unwrap();
    assert!(poison < zero);
    assert!(t.records(0, 16).await.iter().all(|r| !r.needs_zero_io()));
}

#[tokio::test]
async fn consumed_chunks_keep_their_data() {
    let t = untrusted_head(16, 4).await;
    t.upstream
        .set_default(PermissionKind::InvalidateNotice, PermissionReply::Granted);
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 0 })
        .await
        .unwrap();

    t.run_until_idle(Engine::VerifyInvalidate).await.unwrap();
    assert_eq!(
        t.records(0, 4).await,
        vec![ChunkRecord::reconstructed(true); 4]
    );

    t.run_until_idle(Engine::BackgroundZero).await.unwrap();
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(0, 4)), 0);
    assert_eq!(t.device.zero_ops_touching(t.chunk_range(4, 12)), 3);
}

#[tokio::test]
async fn upstream_denial_defers_invalidation() {
    let t = untrusted_head(8, 2).await;
    t.upstream
        .set_default(PermissionKind::InvalidateNotice, PermissionReply::Denied);
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 0 })
        .await
        .unwrap();

    let outcome = t.drive().run_verify_invalidate_cycle().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Deferred {
            reason: DeferReason::UpstreamDenied
        }
    );
    assert!(poison_writes(&t.device.ops()).is_empty());
    assert_eq!(t.drive().checkpoints().await.verify_invalidate_checkpoint, 0);
    assert!(t.records(0, 2).await.iter().all(ChunkRecord::is_invalid));
}

#[tokio::test]
async fn lost_page_is_rebuilt_in_full() {
    let t = TestDrive::new(16).await;
    t.paged.corrupt_page(0);
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 0 })
        .await
        .unwrap();

    t.run_until_idle(Engine::VerifyInvalidate).await.unwrap();

    assert!(!t.paged.is_corrupt(0));
    assert_eq!(t.paged.records(), vec![ChunkRecord::provisioned(); 16]);
    assert_eq!(t.drive().metrics().chunks_invalidated, 16);
    assert_eq!(poison_writes(&t.device.ops()).len(), 4);
}

#[tokio::test]
async fn write_failure_leaves_records_untrusted() {
    let t = untrusted_head(8, 2).await;
    t.drive()
        .submit(ZeroRequest::VerifyInvalidate { lba: 0 })
        .await
        .unwrap();
    t.device.fail_next(1);

    let err = t.drive().run_verify_invalidate_cycle().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(t.records(0, 2).await.iter().all(ChunkRecord::is_invalid));
    assert_eq!(t.drive().checkpoints().await.verify_invalidate_checkpoint, 0);

    t.run_until_idle(Engine::VerifyInvalidate).await.unwrap();
    assert!(t.records(0, 8).await.iter().all(|r| r.valid));
}
