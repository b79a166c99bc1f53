//! The drive object tying the capacity engines together.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use drivecap_shared::{DrivecapError, DrivecapResult};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, AdmissionController, AdmissionPermit, BackgroundClass, Scheduler};
use crate::checkpoint::{CheckpointStore, Cursor, DriveFlags, NonPagedState};
use crate::chunk::{ChunkGeometry, ChunkIndex, ChunkRecord, ChunkSpan};
use crate::drive::options::DriveOptions;
use crate::drive::runner;
use crate::drive::state::DriveStatus;
use crate::drive::types::{
    ChunkCounts, CycleOutcome, DeferReason, DriveSnapshot, Engine, ZeroRequest,
};
use crate::io::{DeviceIo, NonPagedStore, PagedStore, PagedWriteMode, Upstream, ZeroMethod};
use crate::metadata::ChunkMap;
use crate::metrics::{DriveMetrics, DriveMetricsStorage};
use crate::verify;
use crate::zero;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Everything a drive talks to.
#[derive(Clone)]
pub struct DriveCollaborators {
    pub device: Arc<dyn DeviceIo>,
    pub paged: Arc<dyn PagedStore>,
    pub nonpaged: Arc<dyn NonPagedStore>,
    pub upstream: Arc<dyn Upstream>,
    pub scheduler: Arc<dyn Scheduler>,
}

/// A provisioned drive.
///
/// **Cloning**: cheap, all clones share the same state.
///
/// **Locking**: one drive-wide async lock guards the checkpoint store, and
/// chunk-span region locks guard chunk map records. Code that needs both
/// takes the drive lock first.
#[derive(Clone)]
pub struct Drive {
    inner: Arc<DriveInner>,
}

pub(crate) struct DriveInner {
    pub(crate) options: DriveOptions,
    pub(crate) geometry: ChunkGeometry,
    pub(crate) device: Arc<dyn DeviceIo>,
    pub(crate) upstream: Arc<dyn Upstream>,
    pub(crate) chunk_map: ChunkMap,
    /// The drive-wide lock.
    pub(crate) checkpoints: AsyncMutex<CheckpointStore>,
    pub(crate) admission: AdmissionController,
    pub(crate) metrics: DriveMetricsStorage,
    pub(crate) zero_wake: Arc<Notify>,
    pub(crate) sniff_wake: Arc<Notify>,
    pub(crate) verify_invalidate_wake: Arc<Notify>,
    status: RwLock<DriveStatus>,
    capacity_blocks: AtomicU64,
    consumer_bound: AtomicBool,
    rekey_in_progress: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drive {
    /// Provision a new drive: fresh non-paged state, every exported chunk
    /// marked for background zero, zero checkpoint at lba 0.
    pub async fn create(
        options: DriveOptions,
        collaborators: DriveCollaborators,
    ) -> DrivecapResult<Self> {
        Self::check_fits(&options, collaborators.paged.as_ref())?;
        let checkpoints =
            CheckpointStore::initialize(Arc::clone(&collaborators.nonpaged), options.capacity_blocks)
                .await?;

        let inner = DriveInner::new(options, collaborators, checkpoints);
        let end_chunk = inner.geometry.chunks_in(inner.capacity_blocks());
        for part in inner
            .geometry
            .split_by_page(ChunkSpan::new(0, end_chunk))
        {
            let records = vec![ChunkRecord::provisioned(); part.count as usize];
            inner
                .chunk_map
                .write(part.start, &records, PagedWriteMode::ForceWriteVerify)
                .await?;
        }

        tracing::info!(
            drive = %inner.options.name,
            capacity_blocks = inner.capacity_blocks(),
            chunks = end_chunk,
            "Created drive"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open an existing drive from its persisted state.
    pub async fn open(
        options: DriveOptions,
        collaborators: DriveCollaborators,
    ) -> DrivecapResult<Self> {
        Self::check_fits(&options, collaborators.paged.as_ref())?;
        let checkpoints =
            CheckpointStore::load(Arc::clone(&collaborators.nonpaged), options.capacity_blocks)
                .await?;

        let inner = DriveInner::new(options, collaborators, checkpoints);
        {
            let checkpoints = inner.checkpoints.lock().await;
            let state = checkpoints.state();
            inner
                .rekey_in_progress
                .store(state.flags.contains(DriveFlags::REKEY_IN_PROGRESS), Ordering::Release);
            tracing::info!(
                drive = %inner.options.name,
                zero_checkpoint = state.zero_checkpoint,
                sniff_checkpoint = state.sniff_checkpoint,
                verify_invalidate_pending = state.verify_invalidate_pending(),
                "Opened drive"
            );
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn check_fits(options: &DriveOptions, paged: &dyn PagedStore) -> DrivecapResult<()> {
        options.validate()?;
        if options.capacity_chunks() > paged.capacity() {
            return Err(DrivecapError::Config(format!(
                "{} chunks do not fit a chunk map of {} records",
                options.capacity_chunks(),
                paged.capacity()
            )));
        }
        Ok(())
    }

    pub fn options(&self) -> &DriveOptions {
        &self.inner.options
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.inner.geometry
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.inner.capacity_blocks()
    }

    pub fn status(&self) -> DriveStatus {
        *self.inner.status.read()
    }

    pub fn metrics(&self) -> DriveMetrics {
        self.inner
            .metrics
            .snapshot(self.inner.chunk_map.cache_stats())
    }

    // ------------------------------------------------------------------------
    // Foreground requests
    // ------------------------------------------------------------------------

    /// Run a zero-family request to completion.
    pub async fn submit(&self, request: ZeroRequest) -> DrivecapResult<()> {
        self.inner.ensure_ready(request.name())?;
        match request {
            ZeroRequest::UserZero { lba, blocks } => {
                zero::user::handle(&self.inner, lba, blocks).await
            }
            ZeroRequest::MarkDiskZero => zero::scrub::mark_disk_zero(&self.inner).await,
            ZeroRequest::MarkConsumedZero { lba, blocks } => {
                zero::scrub::mark_consumed_zero(&self.inner, lba, blocks).await
            }
            ZeroRequest::VerifyInvalidate { lba } => {
                if lba >= self.capacity_blocks() {
                    return Err(DrivecapError::InvalidRequest(format!(
                        "lba {:#x} is beyond capacity",
                        lba
                    )));
                }
                let mut checkpoints = self.inner.checkpoints.lock().await;
                self.inner
                    .schedule_verify_invalidate(&mut checkpoints, self.inner.geometry.chunk_index(lba))
                    .await
            }
        }
    }

    /// Shorthand for [`ZeroRequest::UserZero`].
    pub async fn zero(&self, lba: u64, blocks: u64) -> DrivecapResult<()> {
        self.submit(ZeroRequest::UserZero { lba, blocks }).await
    }

    // ------------------------------------------------------------------------
    // Background cycles
    // ------------------------------------------------------------------------

    /// Run one cycle of `engine` if the scheduler admits it.
    pub async fn run_cycle(&self, engine: Engine) -> DrivecapResult<CycleOutcome> {
        self.inner.run_cycle(engine).await
    }

    pub async fn run_background_zero_cycle(&self) -> DrivecapResult<CycleOutcome> {
        self.run_cycle(Engine::BackgroundZero).await
    }

    pub async fn run_sniff_cycle(&self) -> DrivecapResult<CycleOutcome> {
        self.run_cycle(Engine::Sniff).await
    }

    pub async fn run_verify_invalidate_cycle(&self) -> DrivecapResult<CycleOutcome> {
        self.run_cycle(Engine::VerifyInvalidate).await
    }

    /// Spawn one task per enabled engine. Idempotent.
    pub fn start_background(&self) -> DrivecapResult<()> {
        self.inner.ensure_ready("start_background")?;
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        for engine in Engine::ALL {
            let enabled = match engine {
                Engine::BackgroundZero => self.inner.options.background_zero_enabled,
                Engine::Sniff => self.inner.options.sniff_enabled,
                Engine::VerifyInvalidate => true,
            };
            if !enabled {
                continue;
            }
            let weak: Weak<DriveInner> = Arc::downgrade(&self.inner);
            let cancel = self.inner.cancel.child_token();
            tasks.push(tokio::spawn(runner::run_engine(weak, engine, cancel)));
        }
        tracing::debug!(drive = %self.inner.options.name, tasks = tasks.len(), "Started background engines");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Grow exported capacity to `capacity_blocks`. The new chunks are
    /// provisioned and background zero resumes over them.
    pub async fn provision(&self, capacity_blocks: u64) -> DrivecapResult<()> {
        self.inner.ensure_ready("provision")?;
        let geometry = self.inner.geometry;
        if capacity_blocks % geometry.chunk_size() != 0 {
            return Err(DrivecapError::InvalidRequest(format!(
                "capacity {} blocks is not a multiple of chunk size {}",
                capacity_blocks,
                geometry.chunk_size()
            )));
        }
        let new_end = geometry.chunks_in(capacity_blocks);
        if new_end > self.inner.chunk_map.capacity() {
            return Err(DrivecapError::InvalidRequest(format!(
                "{} chunks do not fit a chunk map of {} records",
                new_end,
                self.inner.chunk_map.capacity()
            )));
        }

        let mut checkpoints = self.inner.checkpoints.lock().await;
        let old_end = geometry.chunks_in(checkpoints.end_lba());
        if new_end < old_end {
            return Err(DrivecapError::InvalidRequest(
                "shrinking capacity is not supported".into(),
            ));
        }
        for part in geometry.split_by_page(ChunkSpan::new(old_end, new_end - old_end)) {
            let _region = self.inner.chunk_map.lock(part).await;
            let records = vec![ChunkRecord::provisioned(); part.count as usize];
            self.inner
                .persist_records(&mut checkpoints, part.start, &records, false)
                .await?;
        }
        checkpoints.set_end_lba(capacity_blocks);
        self.inner
            .capacity_blocks
            .store(capacity_blocks, Ordering::Release);
        drop(checkpoints);

        tracing::info!(
            drive = %self.inner.options.name,
            from_chunks = old_end,
            to_chunks = new_end,
            "Provisioned capacity"
        );
        self.inner.zero_wake.notify_one();
        Ok(())
    }

    /// Record whether a consumer currently holds the drive. While bound,
    /// background zero writes its record updates through immediately.
    pub async fn set_consumer_bound(&self, bound: bool) -> DrivecapResult<()> {
        let was = self.inner.consumer_bound.swap(bound, Ordering::AcqRel);
        if bound && !was {
            // Deferred updates must be durable before a consumer can look.
            let _checkpoints = self.inner.checkpoints.lock().await;
            self.inner.chunk_map.flush().await?;
        }
        Ok(())
    }

    pub async fn set_sniff_enabled(&self, enabled: bool) -> DrivecapResult<()> {
        let mut checkpoints = self.inner.checkpoints.lock().await;
        if enabled {
            checkpoints.insert_flags(DriveFlags::SNIFF_ENABLED).await?;
            self.inner.sniff_wake.notify_one();
        } else {
            checkpoints.remove_flags(DriveFlags::SNIFF_ENABLED).await?;
        }
        Ok(())
    }

    /// Start re-keying. Background zero falls back to buffered zero writes
    /// until [`Drive::end_rekey`].
    pub async fn begin_rekey(&self) -> DrivecapResult<()> {
        let mut checkpoints = self.inner.checkpoints.lock().await;
        checkpoints
            .insert_flags(DriveFlags::REKEY_IN_PROGRESS)
            .await?;
        self.inner.rekey_in_progress.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn end_rekey(&self) -> DrivecapResult<()> {
        let mut checkpoints = self.inner.checkpoints.lock().await;
        checkpoints
            .remove_flags(DriveFlags::REKEY_IN_PROGRESS)
            .await?;
        self.inner.rekey_in_progress.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop accepting work. Cycles in flight abandon their results.
    pub fn quiesce(&self) -> DrivecapResult<()> {
        self.inner.transition(DriveStatus::Quiesced)
    }

    pub fn unquiesce(&self) -> DrivecapResult<()> {
        self.inner.transition(DriveStatus::Ready)?;
        self.inner.wake_all();
        Ok(())
    }

    /// Stop the background engines, flush pending metadata and retire the
    /// drive.
    pub async fn destroy(&self) -> DrivecapResult<()> {
        self.inner.transition(DriveStatus::Destroyed)?;
        self.inner.cancel.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background engine task ended abnormally");
            }
        }

        let _checkpoints = self.inner.checkpoints.lock().await;
        self.inner.chunk_map.flush().await?;
        tracing::info!(drive = %self.inner.options.name, "Destroyed drive");
        Ok(())
    }

    /// Write any pending chunk map update.
    pub async fn flush(&self) -> DrivecapResult<()> {
        let _checkpoints = self.inner.checkpoints.lock().await;
        self.inner.chunk_map.flush().await
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Copy of the non-paged state.
    pub async fn checkpoints(&self) -> NonPagedState {
        self.inner.checkpoints.lock().await.state().clone()
    }

    /// Chunk records over `span`.
    pub async fn records(&self, span: ChunkSpan) -> DrivecapResult<Vec<ChunkRecord>> {
        let _region = self.inner.chunk_map.lock(span).await;
        self.inner.chunk_map.read(span).await
    }

    /// Record totals, checkpoints and counters in one view.
    pub async fn inspect(&self) -> DrivecapResult<DriveSnapshot> {
        let state = self.checkpoints().await;
        let geometry = self.inner.geometry;
        let end_chunk = geometry.chunks_in(self.capacity_blocks());

        let mut chunks = ChunkCounts {
            total: end_chunk,
            ..Default::default()
        };
        for part in geometry.split_by_page(ChunkSpan::new(0, end_chunk)) {
            match self.records(part).await {
                Ok(records) => {
                    for record in &records {
                        chunks.needs_zero += u64::from(record.needs_zero_io());
                        chunks.invalid += u64::from(record.is_invalid());
                        chunks.consumed += u64::from(record.consumed_user_data);
                    }
                }
                Err(DrivecapError::Uncorrectable(_)) => chunks.unreadable_pages += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(DriveSnapshot {
            name: self.inner.options.name.clone(),
            status: self.status(),
            capacity_blocks: self.capacity_blocks(),
            chunk_size: geometry.chunk_size(),
            flags: state
                .flags
                .iter_names()
                .map(|(name, _)| name.to_string())
                .collect(),
            state,
            chunks,
            metrics: self.metrics(),
        })
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("name", &self.inner.options.name)
            .field("status", &self.status())
            .field("capacity_blocks", &self.capacity_blocks())
            .finish()
    }
}

// ============================================================================
// INNER
// ============================================================================

impl DriveInner {
    fn new(
        options: DriveOptions,
        collaborators: DriveCollaborators,
        checkpoints: CheckpointStore,
    ) -> Self {
        let geometry = options.geometry();
        let chunk_map = ChunkMap::new(collaborators.paged, geometry, options.cache_slots);
        let admission = AdmissionController::new(collaborators.scheduler, options.admission);
        Self {
            geometry,
            device: collaborators.device,
            upstream: collaborators.upstream,
            chunk_map,
            capacity_blocks: AtomicU64::new(checkpoints.end_lba()),
            checkpoints: AsyncMutex::new(checkpoints),
            admission,
            metrics: DriveMetricsStorage::new(),
            zero_wake: Arc::new(Notify::new()),
            sniff_wake: Arc::new(Notify::new()),
            verify_invalidate_wake: Arc::new(Notify::new()),
            status: RwLock::new(DriveStatus::Ready),
            consumer_bound: AtomicBool::new(false),
            rekey_in_progress: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            options,
        }
    }

    pub(crate) fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks.load(Ordering::Acquire)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.status.read().is_ready()
    }

    pub(crate) fn consumer_bound(&self) -> bool {
        self.consumer_bound.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_ready(&self, operation: &str) -> DrivecapResult<()> {
        let status = *self.status.read();
        if status.is_ready() {
            Ok(())
        } else {
            Err(DrivecapError::InvalidState(format!(
                "cannot {} while drive is {}",
                operation, status
            )))
        }
    }

    fn transition(&self, target: DriveStatus) -> DrivecapResult<()> {
        let mut status = self.status.write();
        if !status.can_transition_to(target) {
            return Err(DrivecapError::InvalidState(format!(
                "drive cannot go from {} to {}",
                *status, target
            )));
        }
        tracing::debug!(drive = %self.options.name, from = %*status, to = %target, "Drive status changed");
        *status = target;
        Ok(())
    }

    pub(crate) fn wake(&self, engine: Engine) -> Arc<Notify> {
        match engine {
            Engine::BackgroundZero => Arc::clone(&self.zero_wake),
            Engine::Sniff => Arc::clone(&self.sniff_wake),
            Engine::VerifyInvalidate => Arc::clone(&self.verify_invalidate_wake),
        }
    }

    fn wake_all(&self) {
        for engine in Engine::ALL {
            self.wake(engine).notify_one();
        }
    }

    /// Zero method for partial-chunk writes and non-deallocating zeroes.
    pub(crate) fn fill_method(&self) -> ZeroMethod {
        if self.options.capabilities.write_same && !self.rekey_in_progress.load(Ordering::Acquire)
        {
            ZeroMethod::WriteSame
        } else {
            ZeroMethod::Buffer
        }
    }

    /// Zero method for whole chunks owned by background zero.
    pub(crate) fn background_zero_method(&self) -> ZeroMethod {
        if self.options.capabilities.deallocate_on_zero {
            ZeroMethod::Deallocate
        } else {
            self.fill_method()
        }
    }

    pub(crate) async fn run_cycle(&self, engine: Engine) -> DrivecapResult<CycleOutcome> {
        if !self.is_ready() {
            return Ok(CycleOutcome::deferred(DeferReason::NotReady));
        }
        let Some(_permit) = self.admit(engine) else {
            return Ok(CycleOutcome::deferred(DeferReason::Admission));
        };
        match engine {
            Engine::BackgroundZero => zero::background::run_cycle(self).await,
            Engine::Sniff => verify::sniff::run_cycle(self).await,
            Engine::VerifyInvalidate => verify::invalidate::run_cycle(self).await,
        }
    }

    fn admit(&self, engine: Engine) -> Option<AdmissionPermit> {
        let class = match engine {
            Engine::BackgroundZero => BackgroundClass::Zero,
            Engine::Sniff => BackgroundClass::Sniff,
            Engine::VerifyInvalidate => BackgroundClass::VerifyInvalidate,
        };
        match self.admission.request_permission(class) {
            Admission::Granted(permit) => {
                DriveMetricsStorage::incr(&self.metrics.admission_grants);
                Some(permit)
            }
            Admission::Denied => {
                DriveMetricsStorage::incr(&self.metrics.admission_denials);
                None
            }
        }
    }

    /// Retract the verify-invalidate cursor to the page holding `chunk`.
    pub(crate) async fn schedule_verify_invalidate(
        &self,
        checkpoints: &mut CheckpointStore,
        chunk: ChunkIndex,
    ) -> DrivecapResult<()> {
        let page_start = self.geometry.page_start(self.geometry.page_of(chunk));
        let lba = self.geometry.chunk_start_lba(page_start);
        if checkpoints.retract(Cursor::VerifyInvalidate, lba).await? {
            tracing::warn!(
                drive = %self.options.name,
                page = self.geometry.page_of(chunk),
                lba,
                "Scheduled verify-invalidate"
            );
        }
        self.verify_invalidate_wake.notify_one();
        Ok(())
    }

    /// Read records over one page span. An unreadable page yields untrusted
    /// records and `true`.
    pub(crate) async fn read_or_untrusted(
        &self,
        span: ChunkSpan,
    ) -> DrivecapResult<(Vec<ChunkRecord>, bool)> {
        match self.chunk_map.read(span).await {
            Ok(records) => Ok((records, false)),
            Err(DrivecapError::Uncorrectable(reason)) => {
                tracing::warn!(
                    drive = %self.options.name,
                    chunk = span.start,
                    %reason,
                    "Chunk map page unreadable"
                );
                Ok((vec![ChunkRecord::untrusted(); span.count as usize], true))
            }
            Err(e) => Err(e),
        }
    }

    /// Write records for one page span.
    ///
    /// An unreadable page is written with ForceWriteVerify, which costs the
    /// page's other records; verify-invalidate is scheduled over it.
    pub(crate) async fn persist_records(
        &self,
        checkpoints: &mut CheckpointStore,
        start: ChunkIndex,
        records: &[ChunkRecord],
        page_lost: bool,
    ) -> DrivecapResult<()> {
        let mode = if page_lost {
            PagedWriteMode::ForceWriteVerify
        } else {
            PagedWriteMode::Update
        };
        let forced = match self.chunk_map.write(start, records, mode).await {
            Ok(()) => page_lost,
            Err(DrivecapError::Uncorrectable(reason)) if !page_lost => {
                tracing::warn!(
                    drive = %self.options.name,
                    chunk = start,
                    %reason,
                    "Chunk map update failed, forcing the page"
                );
                self.chunk_map
                    .write(start, records, PagedWriteMode::ForceWriteVerify)
                    .await?;
                true
            }
            Err(e) => return Err(e),
        };
        if forced {
            self.schedule_verify_invalidate(checkpoints, start).await?;
        }
        Ok(())
    }
}

impl Drop for DriveInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
