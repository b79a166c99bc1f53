//! In-memory collaborators with fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use drivecap_shared::{DrivecapError, DrivecapResult};
use parking_lot::Mutex;

use crate::checkpoint::{MediaErrorKind, NonPagedField, NonPagedState, VerifyReport};
use crate::chunk::{BlockRange, ChunkIndex, ChunkRecord, Lba, read_packed, write_packed};
use crate::io::{
    BlockPattern, DeviceIo, DeviceOp, IoStatus, NonPagedStore, NonPagedWrite, PagedStore,
    PagedWriteMode, PermissionKind, PermissionReply, Upstream, WriteCondition, ZeroMethod,
};

/// A media defect planted in a [`MemoryDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDefect {
    pub kind: MediaErrorKind,
    /// Survives writes. A non-persistent defect is remapped by the first
    /// write that covers it.
    pub persistent: bool,
}

#[derive(Debug)]
struct DeviceState {
    ops: Vec<DeviceOp>,
    defects: BTreeMap<Lba, MediaDefect>,
    transient_failures: u32,
    write_same_supported: bool,
}

/// Block device that records every op and fails on demand.
#[derive(Debug)]
pub struct MemoryDevice {
    capacity_blocks: u64,
    state: Mutex<DeviceState>,
}

impl MemoryDevice {
    pub fn new(capacity_blocks: u64) -> Self {
        Self {
            capacity_blocks,
            state: Mutex::new(DeviceState {
                ops: Vec::new(),
                defects: BTreeMap::new(),
                transient_failures: 0,
                write_same_supported: true,
            }),
        }
    }

    pub fn inject_media_error(&self, lba: Lba, kind: MediaErrorKind, persistent: bool) {
        self.state
            .lock()
            .defects
            .insert(lba, MediaDefect { kind, persistent });
    }

    pub fn clear_media_errors(&self) {
        self.state.lock().defects.clear();
    }

    /// Make the next `count` ops fail with [`IoStatus::Failed`].
    pub fn fail_next(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    pub fn set_write_same_supported(&self, supported: bool) {
        self.state.lock().write_same_supported = supported;
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    pub fn count_ops(&self, pred: impl Fn(&DeviceOp) -> bool) -> usize {
        self.state.lock().ops.iter().filter(|op| pred(*op)).count()
    }

    /// Zero ops whose range touches `range`.
    pub fn zero_ops_touching(&self, range: BlockRange) -> usize {
        self.count_ops(|op| {
            let r = op.range();
            matches!(op, DeviceOp::Zero { .. }) && r.lba < range.end() && range.lba < r.end()
        })
    }

    fn first_defect(state: &DeviceState, range: BlockRange) -> Option<(Lba, MediaDefect)> {
        state
            .defects
            .range(range.lba..range.end())
            .next()
            .map(|(lba, d)| (*lba, *d))
    }

    fn heal(state: &mut DeviceState, range: BlockRange) {
        state
            .defects
            .retain(|lba, d| d.persistent || !range.contains(*lba));
    }

    fn media_status(lba: Lba, defect: MediaDefect) -> IoStatus {
        match defect.kind {
            MediaErrorKind::Recoverable => IoStatus::SoftMediaError { lba },
            MediaErrorKind::Unrecoverable => IoStatus::HardMediaError { lba },
        }
    }
}

#[async_trait]
impl DeviceIo for MemoryDevice {
    async fn issue(&self, op: DeviceOp) -> IoStatus {
        let mut state = self.state.lock();
        state.ops.push(op);

        if op.range().end() > self.capacity_blocks {
            return IoStatus::Failed;
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return IoStatus::Failed;
        }

        match op {
            DeviceOp::Zero {
                method: ZeroMethod::WriteSame,
                ..
            } if !state.write_same_supported => IoStatus::Failed,
            DeviceOp::Zero { range, .. } | DeviceOp::Write { range, .. } => {
                Self::heal(&mut state, range);
                IoStatus::Success
            }
            DeviceOp::WriteVerify { range, .. } => {
                Self::heal(&mut state, range);
                match Self::first_defect(&state, range) {
                    Some((lba, defect)) => Self::media_status(lba, defect),
                    None => IoStatus::Success,
                }
            }
            DeviceOp::Read { range } | DeviceOp::Verify { range } => {
                match Self::first_defect(&state, range) {
                    Some((lba, defect)) => Self::media_status(lba, defect),
                    None => IoStatus::Success,
                }
            }
        }
    }
}

/// Invalidated-pattern writes recorded by a [`MemoryDevice`].
pub fn poison_writes(ops: &[DeviceOp]) -> Vec<BlockRange> {
    ops.iter()
        .filter_map(|op| match op {
            DeviceOp::Write {
                range,
                pattern: BlockPattern::Invalidated,
            } => Some(*range),
            _ => None,
        })
        .collect()
}

#[derive(Debug)]
struct PagedState {
    bytes: Vec<u8>,
    bad_pages: BTreeSet<u64>,
}

/// Chunk map store holding packed nibble pages in memory.
#[derive(Debug)]
pub struct MemoryPagedStore {
    capacity: u64,
    records_per_page: u64,
    state: Mutex<PagedState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryPagedStore {
    /// New store; every record starts untrusted (all-zero pages).
    pub fn new(capacity: u64, records_per_page: u64) -> Self {
        Self {
            capacity,
            records_per_page,
            state: Mutex::new(PagedState {
                bytes: vec![0; capacity.div_ceil(2) as usize],
                bad_pages: BTreeSet::new(),
            }),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn fill(&self, record: ChunkRecord) {
        let mut state = self.state.lock();
        for i in 0..self.capacity as usize {
            write_packed(&mut state.bytes, i, record);
        }
    }

    pub fn record(&self, index: ChunkIndex) -> ChunkRecord {
        read_packed(&self.state.lock().bytes, index as usize)
    }

    pub fn set_record(&self, index: ChunkIndex, record: ChunkRecord) {
        write_packed(&mut self.state.lock().bytes, index as usize, record);
    }

    pub fn records(&self) -> Vec<ChunkRecord> {
        let state = self.state.lock();
        (0..self.capacity as usize)
            .map(|i| read_packed(&state.bytes, i))
            .collect()
    }

    /// Make `page` unreadable until a forced write rebuilds it.
    pub fn corrupt_page(&self, page: u64) {
        self.state.lock().bad_pages.insert(page);
    }

    pub fn is_corrupt(&self, page: u64) -> bool {
        self.state.lock().bad_pages.contains(&page)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn pages(&self, offset: ChunkIndex, count: u64) -> std::ops::RangeInclusive<u64> {
        let first = offset / self.records_per_page;
        let last = (offset + count.max(1) - 1) / self.records_per_page;
        first..=last
    }

    fn check_bounds(&self, offset: ChunkIndex, count: u64) -> DrivecapResult<()> {
        if offset + count > self.capacity {
            return Err(DrivecapError::Internal(format!(
                "records {}..{} beyond store capacity {}",
                offset,
                offset + count,
                self.capacity
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PagedStore for MemoryPagedStore {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    async fn read_records(
        &self,
        offset: ChunkIndex,
        count: u64,
    ) -> DrivecapResult<Vec<ChunkRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DrivecapError::Retryable("paged store read failed".into()));
        }
        self.check_bounds(offset, count)?;

        let state = self.state.lock();
        if let Some(page) = self.pages(offset, count).find(|p| state.bad_pages.contains(p)) {
            return Err(DrivecapError::Uncorrectable(format!("chunk map page {}", page)));
        }
        Ok((offset..offset + count)
            .map(|i| read_packed(&state.bytes, i as usize))
            .collect())
    }

    async fn write_records(
        &self,
        offset: ChunkIndex,
        records: &[ChunkRecord],
        mode: PagedWriteMode,
    ) -> DrivecapResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DrivecapError::Retryable("paged store write failed".into()));
        }
        let count = records.len() as u64;
        self.check_bounds(offset, count)?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        for page in self.pages(offset, count) {
            if !state.bad_pages.contains(&page) {
                continue;
            }
            match mode {
                PagedWriteMode::Update => {
                    return Err(DrivecapError::Uncorrectable(format!(
                        "chunk map page {} (read-modify-write)",
                        page
                    )));
                }
                PagedWriteMode::ForceWriteVerify => {
                    // The rest of the page is rebuilt without its old content.
                    let start = page * self.records_per_page;
                    let end = (start + self.records_per_page).min(self.capacity);
                    for i in start..end {
                        write_packed(&mut state.bytes, i as usize, ChunkRecord::untrusted());
                    }
                    state.bad_pages.remove(&page);
                }
            }
        }
        for (i, record) in records.iter().enumerate() {
            write_packed(&mut state.bytes, offset as usize + i, *record);
        }
        Ok(())
    }
}

/// Non-paged store with injectable failures and external writers.
#[derive(Debug, Default)]
pub struct MemoryNonPagedStore {
    state: Mutex<NonPagedState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_once: Mutex<Option<(NonPagedField, u64)>>,
}

impl MemoryNonPagedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NonPagedState {
        self.state.lock().clone()
    }

    /// Write a field behind the drive's back (another actor).
    pub fn set(&self, field: NonPagedField, value: u64) {
        self.state.lock().set(field, value);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next write of `value` to `field`, once.
    pub fn fail_write_once(&self, field: NonPagedField, value: u64) {
        *self.fail_once.lock() = Some((field, value));
    }

    fn check_readable(&self) -> DrivecapResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DrivecapError::Retryable("non-paged store unreadable".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> DrivecapResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DrivecapError::Retryable("non-paged store write failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NonPagedStore for MemoryNonPagedStore {
    async fn read(&self, field: NonPagedField) -> DrivecapResult<u64> {
        self.check_readable()?;
        Ok(self.state.lock().get(field))
    }

    async fn write(
        &self,
        field: NonPagedField,
        value: u64,
        condition: WriteCondition,
    ) -> DrivecapResult<NonPagedWrite> {
        self.check_writable()?;
        {
            let mut fail_once = self.fail_once.lock();
            if *fail_once == Some((field, value)) {
                *fail_once = None;
                return Err(DrivecapError::Retryable(format!(
                    "non-paged write of {:?} failed",
                    field
                )));
            }
        }
        let mut state = self.state.lock();
        let current = state.get(field);
        if let WriteCondition::Expect(expected) = condition
            && expected != current
        {
            return Ok(NonPagedWrite::Rejected(current));
        }
        state.set(field, value);
        Ok(NonPagedWrite::Written)
    }

    async fn read_report(&self) -> DrivecapResult<VerifyReport> {
        self.check_readable()?;
        Ok(self.state.lock().report.clone())
    }

    async fn write_report(&self, report: &VerifyReport) -> DrivecapResult<()> {
        self.check_writable()?;
        self.state.lock().report = report.clone();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct UpstreamScript {
    defaults: HashMap<PermissionKind, PermissionReply>,
    queued: HashMap<PermissionKind, VecDeque<PermissionReply>>,
    asked: Vec<(PermissionKind, BlockRange)>,
}

/// Upstream consumer answering from a script.
///
/// Without a script it grants zero permission and reports every range as
/// not consumed.
#[derive(Debug)]
pub struct ScriptedUpstream {
    script: Mutex<UpstreamScript>,
}

impl Default for ScriptedUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        let mut script = UpstreamScript::default();
        script
            .defaults
            .insert(PermissionKind::ZeroPermission, PermissionReply::Granted);
        script
            .defaults
            .insert(PermissionKind::RemapAction, PermissionReply::NotConsumed);
        script
            .defaults
            .insert(PermissionKind::InvalidateNotice, PermissionReply::NotConsumed);
        Self {
            script: Mutex::new(script),
        }
    }

    pub fn set_default(&self, kind: PermissionKind, reply: PermissionReply) {
        self.script.lock().defaults.insert(kind, reply);
    }

    /// Answer the next `kind` question with `reply`, then fall back to the
    /// default.
    pub fn push(&self, kind: PermissionKind, reply: PermissionReply) {
        self.script
            .lock()
            .queued
            .entry(kind)
            .or_default()
            .push_back(reply);
    }

    /// Ranges asked about for `kind`, oldest first.
    pub fn asked(&self, kind: PermissionKind) -> Vec<BlockRange> {
        self.script
            .lock()
            .asked
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| *r)
            .collect()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn ask(&self, kind: PermissionKind, range: BlockRange) -> PermissionReply {
        let mut script = self.script.lock();
        script.asked.push((kind, range));
        if let Some(reply) = script.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            return reply;
        }
        script
            .defaults
            .get(&kind)
            .copied()
            .unwrap_or(PermissionReply::Denied)
    }
}
