//! File-backed collaborators for a drive living under a home directory.
//!
//! The non-paged store rewrites its JSON document through a temporary and a
//! rename, so a crash leaves either the old or the new content on disk. The
//! paged store writes only the bytes of the records it was handed, in place.
//! The device is a sparse image file written in place.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use drivecap_shared::constants::chunk::BLOCK_SIZE;
use drivecap_shared::{DrivecapError, DrivecapResult};
use tokio::sync::Mutex;

use crate::checkpoint::{NonPagedField, NonPagedState, VerifyReport};
use crate::chunk::{BlockRange, ChunkIndex, ChunkRecord, Lba, read_packed, write_packed};
use crate::io::{
    BlockPattern, DeviceIo, DeviceOp, IoStatus, NonPagedStore, NonPagedWrite, PagedStore,
    PagedWriteMode, PermissionKind, PermissionReply, Upstream, WriteCondition, ZeroMethod,
};

/// Byte every block of an invalidated range is filled with.
pub const INVALIDATED_FILL: u8 = 0xDB;

/// Blocks moved per positioned read or write.
const IO_BATCH_BLOCKS: u64 = 256;

async fn write_atomic(path: &Path, bytes: &[u8]) -> DrivecapResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await.map_err(|e| {
        DrivecapError::Storage(format!("failed to write {}: {}", tmp.display(), e))
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        DrivecapError::Storage(format!("failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Non-paged state kept as a JSON document.
#[derive(Debug)]
pub struct FileNonPagedStore {
    path: PathBuf,
    state: Mutex<NonPagedState>,
}

impl FileNonPagedStore {
    /// Create the file with default state, replacing any existing one.
    pub async fn create(path: impl Into<PathBuf>) -> DrivecapResult<Self> {
        let path = path.into();
        let state = NonPagedState::default();
        write_atomic(&path, &serde_json::to_vec_pretty(&state)?).await?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn open(path: impl Into<PathBuf>) -> DrivecapResult<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            DrivecapError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        let state: NonPagedState = serde_json::from_slice(&bytes)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> NonPagedState {
        self.state.lock().await.clone()
    }

    async fn commit(&self, state: &mut NonPagedState, updated: NonPagedState) -> DrivecapResult<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(&updated)?).await?;
        *state = updated;
        Ok(())
    }
}

#[async_trait]
impl NonPagedStore for FileNonPagedStore {
    async fn read(&self, field: NonPagedField) -> DrivecapResult<u64> {
        Ok(self.state.lock().await.get(field))
    }

    async fn write(
        &self,
        field: NonPagedField,
        value: u64,
        condition: WriteCondition,
    ) -> DrivecapResult<NonPagedWrite> {
        let mut state = self.state.lock().await;
        let current = state.get(field);
        if let WriteCondition::Expect(expected) = condition
            && expected != current
        {
            return Ok(NonPagedWrite::Rejected(current));
        }
        let mut updated = state.clone();
        updated.set(field, value);
        self.commit(&mut state, updated).await?;
        Ok(NonPagedWrite::Written)
    }

    async fn read_report(&self) -> DrivecapResult<VerifyReport> {
        Ok(self.state.lock().await.report.clone())
    }

    async fn write_report(&self, report: &VerifyReport) -> DrivecapResult<()> {
        let mut state = self.state.lock().await;
        let mut updated = state.clone();
        updated.report = report.clone();
        self.commit(&mut state, updated).await
    }
}

/// Chunk map stored as packed nibbles, two records per byte.
///
/// Reads are served from an in-memory copy of the file. A write updates the
/// bytes covering its records on disk first and the copy only once the
/// write (and its verify) succeeded.
#[derive(Debug)]
pub struct FilePagedStore {
    path: PathBuf,
    capacity: u64,
    file: Arc<File>,
    bytes: Mutex<Vec<u8>>,
}

fn packed_len(capacity: u64) -> u64 {
    capacity.div_ceil(2)
}

/// Write `bytes` at `offset` and sync. With `verify` set, read them back and
/// report whether they match.
fn write_span(file: &File, offset: u64, bytes: &[u8], verify: bool) -> io::Result<bool> {
    file.write_all_at(bytes, offset)?;
    file.sync_data()?;
    if !verify {
        return Ok(true);
    }
    let mut back = vec![0u8; bytes.len()];
    file.read_exact_at(&mut back, offset)?;
    Ok(back == bytes)
}

impl FilePagedStore {
    /// Create a store of `capacity` untrusted records.
    pub async fn create(path: impl Into<PathBuf>, capacity: u64) -> DrivecapResult<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| {
                DrivecapError::Storage(format!("failed to create {}: {}", path.display(), e))
            })?;
        file.set_len(packed_len(capacity)).await?;
        file.sync_all().await?;
        Ok(Self {
            path,
            capacity,
            file: Arc::new(file.into_std().await),
            bytes: Mutex::new(vec![0u8; packed_len(capacity) as usize]),
        })
    }

    /// Open an existing store holding `capacity` records.
    pub async fn open(path: impl Into<PathBuf>, capacity: u64) -> DrivecapResult<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            DrivecapError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        if (bytes.len() as u64) < packed_len(capacity) {
            return Err(DrivecapError::Storage(format!(
                "{} holds {} bytes, {} records need {}",
                path.display(),
                bytes.len(),
                capacity,
                packed_len(capacity)
            )));
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                DrivecapError::Storage(format!("failed to open {}: {}", path.display(), e))
            })?;
        Ok(Self {
            path,
            capacity,
            file: Arc::new(file.into_std().await),
            bytes: Mutex::new(bytes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
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
impl PagedStore for FilePagedStore {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    async fn read_records(
        &self,
        offset: ChunkIndex,
        count: u64,
    ) -> DrivecapResult<Vec<ChunkRecord>> {
        self.check_bounds(offset, count)?;
        let bytes = self.bytes.lock().await;
        Ok((offset..offset + count)
            .map(|i| read_packed(&bytes, i as usize))
            .collect())
    }

    async fn write_records(
        &self,
        offset: ChunkIndex,
        records: &[ChunkRecord],
        mode: PagedWriteMode,
    ) -> DrivecapResult<()> {
        let count = records.len() as u64;
        self.check_bounds(offset, count)?;
        if records.is_empty() {
            return Ok(());
        }

        // Held across the disk write: neighbouring writes may share a byte.
        let mut bytes = self.bytes.lock().await;
        let first = (offset / 2) as usize;
        let last = packed_len(offset + count) as usize;
        let mut span = bytes[first..last].to_vec();
        let base = offset as usize - first * 2;
        for (i, record) in records.iter().enumerate() {
            write_packed(&mut span, base + i, *record);
        }

        let file = Arc::clone(&self.file);
        let verify = mode == PagedWriteMode::ForceWriteVerify;
        let (span, matched) = tokio::task::spawn_blocking(move || {
            write_span(&file, first as u64, &span, verify).map(|matched| (span, matched))
        })
        .await
        .map_err(|e| DrivecapError::Internal(format!("chunk map write task failed: {}", e)))?
        .map_err(|e| {
            DrivecapError::Retryable(format!(
                "failed to write records {}..{} to {}: {}",
                offset,
                offset + count,
                self.path.display(),
                e
            ))
        })?;
        if !matched {
            return Err(DrivecapError::Retryable(format!(
                "verify after write failed at records {}..{}",
                offset,
                offset + count
            )));
        }

        bytes[first..last].copy_from_slice(&span);
        Ok(())
    }
}

// ============================================================================
// Device
// ============================================================================

/// Block device backed by an image file of `BLOCK_SIZE`-byte blocks.
#[derive(Debug, Clone)]
pub struct FileDevice {
    file: Arc<File>,
    capacity_blocks: u64,
}

fn image_len(capacity_blocks: u64) -> DrivecapResult<u64> {
    capacity_blocks.checked_mul(BLOCK_SIZE).ok_or_else(|| {
        DrivecapError::Config(format!("{} blocks overflow an image file", capacity_blocks))
    })
}

impl FileDevice {
    /// Create a sparse image of `capacity_blocks`, replacing any existing file.
    pub async fn create(path: impl Into<PathBuf>, capacity_blocks: u64) -> DrivecapResult<Self> {
        let path = path.into();
        let len = image_len(capacity_blocks)?;
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| {
                DrivecapError::Storage(format!("failed to create {}: {}", path.display(), e))
            })?;
        file.set_len(len).await?;
        Ok(Self {
            file: Arc::new(file.into_std().await),
            capacity_blocks,
        })
    }

    /// Open an image holding at least `capacity_blocks`.
    pub async fn open(path: impl Into<PathBuf>, capacity_blocks: u64) -> DrivecapResult<Self> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                DrivecapError::Storage(format!("failed to open {}: {}", path.display(), e))
            })?;
        let len = file.metadata().await?.len();
        if len < image_len(capacity_blocks)? {
            return Err(DrivecapError::Storage(format!(
                "{} holds {} bytes, {} blocks need {}",
                path.display(),
                len,
                capacity_blocks,
                capacity_blocks * BLOCK_SIZE
            )));
        }
        Ok(Self {
            file: Arc::new(file.into_std().await),
            capacity_blocks,
        })
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }
}

fn batches(range: BlockRange) -> impl Iterator<Item = BlockRange> {
    let end = range.end();
    (range.lba..end)
        .step_by(IO_BATCH_BLOCKS as usize)
        .map(move |lba| BlockRange::new(lba, (end - lba).min(IO_BATCH_BLOCKS)))
}

fn fill(file: &File, range: BlockRange, byte: u8) -> io::Result<()> {
    let buf = vec![byte; (IO_BATCH_BLOCKS * BLOCK_SIZE) as usize];
    for batch in batches(range) {
        file.write_all_at(&buf[..(batch.blocks * BLOCK_SIZE) as usize], batch.lba * BLOCK_SIZE)?;
    }
    Ok(())
}

/// Read the range back. With `expect` set, returns the first block holding
/// anything else.
fn scan(file: &File, range: BlockRange, expect: Option<u8>) -> io::Result<Option<Lba>> {
    let mut buf = vec![0u8; (IO_BATCH_BLOCKS * BLOCK_SIZE) as usize];
    for batch in batches(range) {
        let bytes = &mut buf[..(batch.blocks * BLOCK_SIZE) as usize];
        file.read_exact_at(bytes, batch.lba * BLOCK_SIZE)?;
        let Some(byte) = expect else { continue };
        if let Some(offset) = bytes.iter().position(|b| *b != byte) {
            return Ok(Some(batch.lba + offset as u64 / BLOCK_SIZE));
        }
    }
    Ok(None)
}

#[cfg(target_os = "linux")]
fn deallocate(file: &File, range: BlockRange) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            (range.lba * BLOCK_SIZE) as libc::off_t,
            (range.blocks * BLOCK_SIZE) as libc::off_t,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
        return fill(file, range, 0);
    }
    Err(err)
}

#[cfg(not(target_os = "linux"))]
fn deallocate(file: &File, range: BlockRange) -> io::Result<()> {
    fill(file, range, 0)
}

fn pattern_byte(pattern: BlockPattern) -> u8 {
    match pattern {
        BlockPattern::Zeroed => 0,
        BlockPattern::Invalidated => INVALIDATED_FILL,
    }
}

fn apply(file: &File, op: DeviceOp) -> io::Result<IoStatus> {
    match op {
        DeviceOp::Zero {
            range,
            method: ZeroMethod::Deallocate,
        } => deallocate(file, range)?,
        DeviceOp::Zero { range, .. } => fill(file, range, 0)?,
        DeviceOp::Write { range, pattern } => fill(file, range, pattern_byte(pattern))?,
        DeviceOp::WriteVerify { range, pattern } => {
            let byte = pattern_byte(pattern);
            fill(file, range, byte)?;
            file.sync_data()?;
            if let Some(lba) = scan(file, range, Some(byte))? {
                return Ok(IoStatus::HardMediaError { lba });
            }
        }
        DeviceOp::Read { range } | DeviceOp::Verify { range } => {
            scan(file, range, None)?;
        }
    }
    Ok(IoStatus::Success)
}

#[async_trait]
impl DeviceIo for FileDevice {
    async fn issue(&self, op: DeviceOp) -> IoStatus {
        let range = op.range();
        if range.end() > self.capacity_blocks {
            tracing::warn!(
                op = op.name(),
                lba = range.lba,
                blocks = range.blocks,
                capacity_blocks = self.capacity_blocks,
                "Device op beyond image end"
            );
            return IoStatus::Failed;
        }

        let file = Arc::clone(&self.file);
        match tokio::task::spawn_blocking(move || apply(&file, op)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::warn!(
                    op = op.name(),
                    lba = range.lba,
                    blocks = range.blocks,
                    error = %e,
                    "Device op failed"
                );
                IoStatus::Failed
            }
            Err(e) => {
                tracing::warn!(op = op.name(), error = %e, "Device op task failed");
                IoStatus::Failed
            }
        }
    }
}

/// Upstream of a drive no consumer is attached to.
///
/// Zero permission is always granted and no range is ever consumed, so
/// repair and invalidation stay with the drive.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedUpstream;

#[async_trait]
impl Upstream for DetachedUpstream {
    async fn ask(&self, kind: PermissionKind, _range: BlockRange) -> PermissionReply {
        match kind {
            PermissionKind::ZeroPermission => PermissionReply::Granted,
            PermissionKind::RemapAction | PermissionKind::InvalidateNotice => {
                PermissionReply::NotConsumed
            }
        }
    }
}
