//! Checkpoint ordering across writers that share one non-paged store.

use std::sync::Arc;

use drivecap::backend::MemoryNonPagedStore;
use drivecap::checkpoint::{AdvanceOutcome, CheckpointStore, Cursor, NonPagedField};
use drivecap::io::NonPagedStore;
use drivecap_shared::constants::lba::INVALID as LBA_INVALID;
use proptest::prelude::*;

const END: u64 = 64 * 0x800;

async fn two_writers() -> (Arc<MemoryNonPagedStore>, CheckpointStore, CheckpointStore) {
    let memory = Arc::new(MemoryNonPagedStore::new());
    let store: Arc<dyn NonPagedStore> = memory.clone();
    let a = CheckpointStore::initialize(Arc::clone(&store), END)
        .await
        .unwrap();
    let b = CheckpointStore::load(store, END).await.unwrap();
    (memory, a, b)
}

#[tokio::test]
async fn stale_writer_cannot_move_cursor_back() {
    let (memory, mut a, mut b) = two_writers().await;

    assert_eq!(
        a.advance(Cursor::Zero, 0, 0x4000).await.unwrap(),
        AdvanceOutcome::Advanced
    );
    let outcome = b.advance(Cursor::Zero, 0, 0x2000).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Rejected { current: 0x4000 });
    assert_eq!(memory.snapshot().zero_checkpoint, 0x4000);
    // The rejected writer learned the persisted value.
    assert_eq!(b.get(Cursor::Zero), 0x4000);
}

#[tokio::test]
async fn retracted_cursor_rejects_stale_completion() {
    let (memory, mut a, mut b) = two_writers().await;
    a.advance(Cursor::Zero, 0, 0x4000).await.unwrap();
    b.refresh(Cursor::Zero).await.unwrap();

    // `b` completed [0x4000, 0x6000) while `a` pulled the cursor back.
    assert!(a.retract(Cursor::Zero, 0x800).await.unwrap());
    let outcome = b.advance(Cursor::Zero, 0x4000, 0x6000).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Rejected { current: 0x800 });
    assert_eq!(memory.snapshot().zero_checkpoint, 0x800);
}

#[tokio::test]
async fn idle_verify_invalidate_cursor_retracts_to_any_lba() {
    let (memory, mut a, _b) = two_writers().await;
    assert_eq!(a.get(Cursor::VerifyInvalidate), LBA_INVALID);

    assert!(a.retract(Cursor::VerifyInvalidate, 0x8000).await.unwrap());
    assert!(!a.retract(Cursor::VerifyInvalidate, 0x10000).await.unwrap());
    assert_eq!(memory.snapshot().verify_invalidate_checkpoint, 0x8000);
}

#[tokio::test]
async fn wrap_only_at_end() {
    let (_memory, mut a, _b) = two_writers().await;
    a.advance(Cursor::Sniff, 0, END - 0x800).await.unwrap();
    assert!(!a.wrap_if_at_end(Cursor::Sniff).await.unwrap());

    a.advance(Cursor::Sniff, END - 0x800, END).await.unwrap();
    assert!(a.wrap_if_at_end(Cursor::Sniff).await.unwrap());
    assert_eq!(a.get(Cursor::Sniff), 0);
}

#[tokio::test]
async fn write_failure_keeps_cached_value() {
    let (memory, mut a, _b) = two_writers().await;
    memory.fail_writes(true);

    assert!(a.advance(Cursor::Zero, 0, 0x800).await.is_err());
    assert_eq!(a.get(Cursor::Zero), 0);

    memory.fail_writes(false);
    assert!(a.advance(Cursor::Zero, 0, 0x800).await.unwrap().is_advanced());
}

proptest! {
    /// Interleaved advances from two writers never move the persisted
    /// cursor backwards, and it ends at the farthest successful target.
    #[test]
    fn advances_are_monotonic(steps in prop::collection::vec((any::<bool>(), 1u64..8), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (memory, mut a, mut b) = two_writers().await;
            let mut persisted = 0;
            let mut farthest = 0;

            for (use_a, chunks) in steps {
                let writer = if use_a { &mut a } else { &mut b };
                let from = writer.get(Cursor::Zero);
                let to = (from + chunks * 0x800).min(END);
                if to <= from {
                    continue;
                }
                if writer.advance(Cursor::Zero, from, to).await.unwrap().is_advanced() {
                    farthest = farthest.max(to);
                }

                let now = memory.snapshot().get(NonPagedField::ZeroCheckpoint);
                prop_assert!(now >= persisted, "cursor moved back from {} to {}", persisted, now);
                persisted = now;
            }
            prop_assert_eq!(persisted, farthest);
            Ok(())
        })?;
    }
}
