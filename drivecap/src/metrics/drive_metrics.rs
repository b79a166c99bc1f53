//! Per-drive counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::metadata::CacheStats;

/// Storage for per-drive metrics.
///
/// Owned by the drive, shared with the engines by reference.
#[derive(Default, Debug)]
pub struct DriveMetricsStorage {
    /// Background zero cycles that ran past admission
    pub(crate) bgz_cycles: AtomicU64,
    /// Zero I/Os issued by background zero
    pub(crate) zero_ios: AtomicU64,
    /// Checkpoint advances that needed no device I/O
    pub(crate) metadata_only_advances: AtomicU64,
    /// User zero requests accepted
    pub(crate) user_zero_requests: AtomicU64,
    /// Direct zero I/Os for partial-chunk edges
    pub(crate) edge_zero_ios: AtomicU64,
    /// Verify I/Os issued by sniff
    pub(crate) sniff_verifies: AtomicU64,
    /// Media errors reported by sniff
    pub(crate) media_errors: AtomicU64,
    /// Self-directed write-verify attempts
    pub(crate) remaps_attempted: AtomicU64,
    /// Lbas the remap gave up on
    pub(crate) remaps_given_up: AtomicU64,
    /// Chunks stamped with the invalidated pattern
    pub(crate) chunks_invalidated: AtomicU64,
    pub(crate) admission_grants: AtomicU64,
    pub(crate) admission_denials: AtomicU64,
    /// Background-zero record updates staged instead of written
    pub(crate) deferred_page_writes: AtomicU64,
    /// Background failures escalated after the retry bound
    pub(crate) escalated_faults: AtomicU64,
}

impl DriveMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a snapshot, folding in the chunk map cache counters.
    pub fn snapshot(&self, cache: CacheStats) -> DriveMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DriveMetrics {
            bgz_cycles: load(&self.bgz_cycles),
            zero_ios: load(&self.zero_ios),
            metadata_only_advances: load(&self.metadata_only_advances),
            user_zero_requests: load(&self.user_zero_requests),
            edge_zero_ios: load(&self.edge_zero_ios),
            sniff_verifies: load(&self.sniff_verifies),
            media_errors: load(&self.media_errors),
            remaps_attempted: load(&self.remaps_attempted),
            remaps_given_up: load(&self.remaps_given_up),
            chunks_invalidated: load(&self.chunks_invalidated),
            admission_grants: load(&self.admission_grants),
            admission_denials: load(&self.admission_denials),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            deferred_page_writes: load(&self.deferred_page_writes),
            escalated_faults: load(&self.escalated_faults),
        }
    }
}

/// Point-in-time copy of a drive's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveMetrics {
    pub bgz_cycles: u64,
    pub zero_ios: u64,
    pub metadata_only_advances: u64,
    pub user_zero_requests: u64,
    pub edge_zero_ios: u64,
    pub sniff_verifies: u64,
    pub media_errors: u64,
    pub remaps_attempted: u64,
    pub remaps_given_up: u64,
    pub chunks_invalidated: u64,
    pub admission_grants: u64,
    pub admission_denials: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deferred_page_writes: u64,
    pub escalated_faults: u64,
}
