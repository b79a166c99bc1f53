//! Chunk-range locks over the chunk map.
//!
//! Callers touching disjoint chunks proceed in parallel even when the chunks
//! share a metadata page; overlapping spans wait for each other. Always
//! acquire the drive-wide lock first.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::chunk::ChunkSpan;

#[derive(Default)]
pub struct RegionLockTable {
    held: Mutex<Vec<(u64, ChunkSpan)>>,
    next_id: AtomicU64,
    released: Notify,
}

impl RegionLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no held span overlaps `span`, then take it.
    pub async fn lock(&self, span: ChunkSpan) -> RegionGuard<'_> {
        loop {
            let notified = self.released.notified();
            if let Some(id) = self.try_insert(span) {
                return RegionGuard {
                    table: self,
                    id,
                    span,
                };
            }
            notified.await;
        }
    }

    pub fn try_lock(&self, span: ChunkSpan) -> Option<RegionGuard<'_>> {
        self.try_insert(span).map(|id| RegionGuard {
            table: self,
            id,
            span,
        })
    }

    /// Number of spans currently held.
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    fn try_insert(&self, span: ChunkSpan) -> Option<u64> {
        let mut held = self.held.lock();
        if held.iter().any(|(_, h)| h.overlaps(&span)) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.push((id, span));
        Some(id)
    }

    fn unlock(&self, id: u64) {
        self.held.lock().retain(|(held_id, _)| *held_id != id);
        self.released.notify_waiters();
    }
}

/// Held chunk span; released on drop.
pub struct RegionGuard<'a> {
    table: &'a RegionLockTable,
    id: u64,
    span: ChunkSpan,
}

impl RegionGuard<'_> {
    pub fn span(&self) -> ChunkSpan {
        self.span
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(self.id);
    }
}
