//! Chunk map access: paged store, page cache and region locks.

mod cache;
mod region_lock;

pub use cache::{ChunkMapCache, DeferredWrite};
pub use region_lock::{RegionGuard, RegionLockTable};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use drivecap_shared::{DrivecapError, DrivecapResult};
use parking_lot::Mutex;

use crate::chunk::{ChunkGeometry, ChunkIndex, ChunkRecord, ChunkSpan};
use crate::io::{PagedStore, PagedWriteMode};

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// The drive's chunk map.
///
/// Callers take a region lock over the chunks they work on, read the
/// records, apply a transition and write them back while still holding the
/// region.
pub struct ChunkMap {
    store: Arc<dyn PagedStore>,
    geometry: ChunkGeometry,
    cache: Mutex<ChunkMapCache>,
    regions: RegionLockTable,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkMap {
    pub fn new(store: Arc<dyn PagedStore>, geometry: ChunkGeometry, cache_slots: usize) -> Self {
        Self {
            store,
            geometry,
            cache: Mutex::new(ChunkMapCache::new(geometry, cache_slots)),
            regions: RegionLockTable::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    /// Number of chunk records the backing store can hold.
    pub fn capacity(&self) -> u64 {
        self.store.capacity()
    }

    pub async fn lock(&self, span: ChunkSpan) -> RegionGuard<'_> {
        self.regions.lock(span).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Read the records of `span`.
    ///
    /// Fails with `DrivecapError::Uncorrectable` if any page touched by the
    /// span cannot be read.
    pub async fn read(&self, span: ChunkSpan) -> DrivecapResult<Vec<ChunkRecord>> {
        if span.end() > self.capacity() {
            return Err(DrivecapError::Internal(format!(
                "chunks {}..{} beyond chunk map capacity {}",
                span.start,
                span.end(),
                self.capacity()
            )));
        }

        let mut out = Vec::with_capacity(span.count as usize);
        let mut chunk = span.start;
        while chunk < span.end() {
            let page = self.geometry.page_of(chunk);
            let page_start = self.geometry.page_start(page);
            let records = self.page(page).await?;
            let from = (chunk - page_start) as usize;
            let to = (span.end() - page_start).min(records.len() as u64) as usize;
            if from >= to {
                return Err(DrivecapError::Internal(format!(
                    "short page {} while reading chunk {}",
                    page, chunk
                )));
            }
            out.extend_from_slice(&records[from..to]);
            chunk = page_start + to as u64;
        }
        Ok(out)
    }

    async fn page(&self, page: u64) -> DrivecapResult<Vec<ChunkRecord>> {
        if let Some(records) = self.cache.lock().lookup(page) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(records);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let start = self.geometry.page_start(page);
        let count = self
            .geometry
            .records_per_page()
            .min(self.capacity().saturating_sub(start));
        let generation = self.cache.lock().generation();
        let mut records = self.store.read_records(start, count).await?;

        let mut cache = self.cache.lock();
        cache.overlay_deferred(start, &mut records);
        cache.insert(page, records.clone(), generation);
        Ok(records)
    }

    /// Write records starting at `start` through to the paged store.
    pub async fn write(
        &self,
        start: ChunkIndex,
        records: &[ChunkRecord],
        mode: PagedWriteMode,
    ) -> DrivecapResult<()> {
        let span = ChunkSpan::new(start, records.len() as u64);
        if self.cache.lock().deferred_overlaps(span) {
            self.flush().await?;
        }

        match self.store.write_records(start, records, mode).await {
            Ok(()) => {
                let mut cache = self.cache.lock();
                match mode {
                    PagedWriteMode::Update => cache.apply(start, records),
                    // The store rebuilt the whole page.
                    PagedWriteMode::ForceWriteVerify => cache.invalidate(span),
                }
                Ok(())
            }
            Err(e) => {
                self.cache.lock().invalidate(span);
                Err(e)
            }
        }
    }

    /// Stage records in the cache without writing the store yet.
    ///
    /// A pending update on another page (or not adjacent to this one) is
    /// flushed first.
    pub async fn write_deferred(
        &self,
        start: ChunkIndex,
        records: &[ChunkRecord],
    ) -> DrivecapResult<()> {
        let span = ChunkSpan::new(start, records.len() as u64);
        let displaced = self.cache.lock().take_conflicting_deferred(span);
        if let Some(pending) = displaced {
            self.write_pending(pending).await?;
        }
        self.cache.lock().merge_deferred(start, records);
        Ok(())
    }

    /// Write the pending update, if any.
    pub async fn flush(&self) -> DrivecapResult<()> {
        let pending = self.cache.lock().take_deferred();
        match pending {
            Some(pending) => self.write_pending(pending).await,
            None => Ok(()),
        }
    }

    pub fn has_deferred(&self) -> bool {
        self.cache.lock().has_deferred()
    }

    /// Forget cached pages. Pending updates are kept.
    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
    }

    async fn write_pending(&self, pending: DeferredWrite) -> DrivecapResult<()> {
        tracing::trace!(
            start = pending.start,
            count = pending.records.len(),
            "Flushing deferred chunk map update"
        );
        if let Err(e) = self
            .store
            .write_records(pending.start, &pending.records, PagedWriteMode::Update)
            .await
        {
            self.cache.lock().restore_deferred(pending);
            return Err(e);
        }
        Ok(())
    }
}
