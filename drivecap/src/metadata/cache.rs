//! In-memory cache of chunk map pages.
//!
//! Holds a few recently used pages plus at most one pending (deferred)
//! background-zero update. The deferred update is newer than the store:
//! anything read from the store must be overlaid with it before use.

use crate::chunk::{ChunkGeometry, ChunkIndex, ChunkRecord, ChunkSpan};

/// Records written to the cache but not yet to the paged store. Always
/// contiguous and inside one metadata page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredWrite {
    pub start: ChunkIndex,
    pub records: Vec<ChunkRecord>,
}

impl DeferredWrite {
    pub fn span(&self) -> ChunkSpan {
        ChunkSpan::new(self.start, self.records.len() as u64)
    }
}

#[derive(Debug)]
struct CacheSlot {
    page: u64,
    records: Vec<ChunkRecord>,
    last_used: u64,
}

#[derive(Debug)]
pub struct ChunkMapCache {
    geometry: ChunkGeometry,
    max_slots: usize,
    slots: Vec<CacheSlot>,
    tick: u64,
    generation: u64,
    deferred: Option<DeferredWrite>,
}

impl ChunkMapCache {
    pub fn new(geometry: ChunkGeometry, max_slots: usize) -> Self {
        Self {
            geometry,
            max_slots,
            slots: Vec::with_capacity(max_slots),
            tick: 0,
            generation: 0,
            deferred: None,
        }
    }

    /// Bumped by every record update. A page read from the store may only be
    /// cached if no update happened while the read was in flight.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn lookup(&mut self, page: u64) -> Option<Vec<ChunkRecord>> {
        self.tick += 1;
        let tick = self.tick;
        self.slots.iter_mut().find(|s| s.page == page).map(|slot| {
            slot.last_used = tick;
            slot.records.clone()
        })
    }

    /// Cache a page read at `generation`. Returns `false` if it was stale.
    pub fn insert(&mut self, page: u64, records: Vec<ChunkRecord>, generation: u64) -> bool {
        if self.max_slots == 0 || generation != self.generation {
            return false;
        }
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.iter_mut().find(|s| s.page == page) {
            slot.records = records;
            slot.last_used = tick;
            return true;
        }
        if self.slots.len() >= self.max_slots
            && let Some(lru) = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i)
        {
            self.slots.swap_remove(lru);
        }
        self.slots.push(CacheSlot {
            page,
            records,
            last_used: tick,
        });
        true
    }

    /// Update cached copies of the records starting at `start`.
    pub fn apply(&mut self, start: ChunkIndex, records: &[ChunkRecord]) {
        self.generation += 1;
        for (offset, record) in records.iter().enumerate() {
            let chunk = start + offset as u64;
            let page = self.geometry.page_of(chunk);
            let index = (chunk - self.geometry.page_start(page)) as usize;
            if let Some(slot) = self.slots.iter_mut().find(|s| s.page == page)
                && let Some(cached) = slot.records.get_mut(index)
            {
                *cached = *record;
            }
        }
    }

    /// Drop cached pages touched by `span`.
    pub fn invalidate(&mut self, span: ChunkSpan) {
        self.generation += 1;
        if span.is_empty() {
            return;
        }
        let first = self.geometry.page_of(span.start);
        let last = self.geometry.page_of(span.end() - 1);
        self.slots.retain(|s| s.page < first || s.page > last);
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.slots.clear();
    }

    pub fn cached_pages(&self) -> usize {
        self.slots.len()
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn deferred_overlaps(&self, span: ChunkSpan) -> bool {
        self.deferred
            .as_ref()
            .is_some_and(|d| d.span().overlaps(&span))
    }

    /// Take the pending update if `span` cannot be merged into it.
    pub fn take_conflicting_deferred(&mut self, span: ChunkSpan) -> Option<DeferredWrite> {
        let conflicts = self.deferred.as_ref().is_some_and(|d| {
            let current = d.span();
            let same_page =
                self.geometry.page_of(current.start) == self.geometry.page_of(span.start);
            let touching = span.start <= current.end() && current.start <= span.end();
            !(same_page && touching)
        });
        if conflicts { self.deferred.take() } else { None }
    }

    /// Merge `records` into the pending update and the cached pages.
    /// The caller has already taken any conflicting pending update.
    pub fn merge_deferred(&mut self, start: ChunkIndex, records: &[ChunkRecord]) {
        self.apply(start, records);
        let incoming = ChunkSpan::new(start, records.len() as u64);
        let merged = match self.deferred.take() {
            None => DeferredWrite {
                start,
                records: records.to_vec(),
            },
            Some(existing) => {
                let current = existing.span();
                let merged_start = current.start.min(incoming.start);
                let merged_end = current.end().max(incoming.end());
                let mut merged = vec![ChunkRecord::default(); (merged_end - merged_start) as usize];
                for (i, r) in existing.records.iter().enumerate() {
                    merged[(existing.start - merged_start) as usize + i] = *r;
                }
                for (i, r) in records.iter().enumerate() {
                    merged[(start - merged_start) as usize + i] = *r;
                }
                DeferredWrite {
                    start: merged_start,
                    records: merged,
                }
            }
        };
        self.deferred = Some(merged);
    }

    pub fn take_deferred(&mut self) -> Option<DeferredWrite> {
        self.deferred.take()
    }

    /// Put back a pending update whose flush failed.
    pub fn restore_deferred(&mut self, deferred: DeferredWrite) {
        match self.deferred.take() {
            None => self.deferred = Some(deferred),
            Some(newer) => {
                self.deferred = Some(deferred);
                let DeferredWrite { start, records } = newer;
                self.merge_deferred(start, &records);
            }
        }
    }

    /// Replace store-read records starting at `start` with pending values.
    pub fn overlay_deferred(&self, start: ChunkIndex, records: &mut [ChunkRecord]) {
        let Some(deferred) = &self.deferred else {
            return;
        };
        for (i, pending) in deferred.records.iter().enumerate() {
            let chunk = deferred.start + i as u64;
            if chunk >= start
                && let Some(slot) = records.get_mut((chunk - start) as usize)
            {
                *slot = *pending;
            }
        }
    }
}
