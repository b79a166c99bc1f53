//! Fixtures for drivecap integration tests.
//!
//! [`TestDrive`] wires a [`Drive`] to the in-memory backends and keeps a
//! handle on each of them so tests can inject faults and inspect what the
//! drive did.

use std::sync::Arc;

use drivecap::backend::{
    LoadScheduler, MemoryDevice, MemoryNonPagedStore, MemoryPagedStore, ScriptedUpstream,
};
use drivecap::chunk::{BlockRange, ChunkRecord, ChunkSpan};
use drivecap::io::DeviceOp;
use drivecap::{CycleOutcome, Drive, DriveCollaborators, DriveOptions, DrivecapResult, Engine};

/// Chunk size used by test drives (the production default).
pub const CHUNK: u64 = 0x800;

/// Records per metadata page in test drives. Small so tests cross pages.
pub const RECORDS_PER_PAGE: u64 = 16;

/// Upper bound on cycles in [`TestDrive::run_until_idle`].
pub const MAX_TEST_CYCLES: usize = 10_000;

// ============================================================================
// BUILDER
// ============================================================================

pub struct TestDriveBuilder {
    options: DriveOptions,
    paged_capacity: Option<u64>,
    scheduler: Option<Arc<LoadScheduler>>,
}

impl TestDriveBuilder {
    pub fn new(chunks: u64) -> Self {
        let mut options = DriveOptions::with_chunks(chunks);
        options.name = "test-drive".into();
        options.records_per_page = RECORDS_PER_PAGE;
        options.max_zero_chunks = 4;
        options.idle_interval_ms = 20;
        options.admission.backoff_ms = 5;
        Self {
            options,
            paged_capacity: None,
            scheduler: None,
        }
    }

    pub fn max_zero_chunks(mut self, chunks: u64) -> Self {
        self.options.max_zero_chunks = chunks;
        self
    }

    pub fn deallocate_on_zero(mut self, enabled: bool) -> Self {
        self.options.capabilities.deallocate_on_zero = enabled;
        self
    }

    pub fn write_same(mut self, supported: bool) -> Self {
        self.options.capabilities.write_same = supported;
        self
    }

    /// Chunk map records, when larger than the exported chunks.
    pub fn paged_capacity(mut self, records: u64) -> Self {
        self.paged_capacity = Some(records);
        self
    }

    pub fn scheduler(mut self, scheduler: LoadScheduler) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    pub fn with_options(mut self, edit: impl FnOnce(&mut DriveOptions)) -> Self {
        edit(&mut self.options);
        self
    }

    pub async fn create(self) -> TestDrive {
        let chunks = self.options.capacity_chunks();
        let paged_capacity = self.paged_capacity.unwrap_or(chunks);
        let max_blocks = paged_capacity * self.options.chunk_size;

        let fixture = TestDrive {
            drive: None,
            device: Arc::new(MemoryDevice::new(max_blocks)),
            paged: Arc::new(MemoryPagedStore::new(
                paged_capacity,
                self.options.records_per_page,
            )),
            nonpaged: Arc::new(MemoryNonPagedStore::new()),
            upstream: Arc::new(ScriptedUpstream::new()),
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(LoadScheduler::default())),
            options: self.options,
        };
        let drive = Drive::create(fixture.options.clone(), fixture.collaborators())
            .await
            .expect("Failed to create test drive");
        TestDrive {
            drive: Some(drive),
            ..fixture
        }
    }
}

// ============================================================================
// FIXTURE
// ============================================================================

/// A drive on in-memory backends.
pub struct TestDrive {
    drive: Option<Drive>,
    pub device: Arc<MemoryDevice>,
    pub paged: Arc<MemoryPagedStore>,
    pub nonpaged: Arc<MemoryNonPagedStore>,
    pub upstream: Arc<ScriptedUpstream>,
    pub scheduler: Arc<LoadScheduler>,
    pub options: DriveOptions,
}

impl TestDrive {
    /// Fresh drive with `chunks` exported chunks and default test options.
    pub async fn new(chunks: u64) -> Self {
        TestDriveBuilder::new(chunks).create().await
    }

    pub fn drive(&self) -> &Drive {
        self.drive.as_ref().expect("test drive not created")
    }

    pub fn collaborators(&self) -> DriveCollaborators {
        DriveCollaborators {
            device: self.device.clone(),
            paged: self.paged.clone(),
            nonpaged: self.nonpaged.clone(),
            upstream: self.upstream.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Open a second drive object on the same stores, as after a restart.
    pub async fn reopen(&self) -> Drive {
        Drive::open(self.options.clone(), self.collaborators())
            .await
            .expect("Failed to reopen test drive")
    }

    pub fn chunk_range(&self, chunk: u64, count: u64) -> BlockRange {
        BlockRange::new(chunk * self.options.chunk_size, count * self.options.chunk_size)
    }

    pub fn chunk_lba(&self, chunk: u64) -> u64 {
        chunk * self.options.chunk_size
    }

    /// Overwrite stored records behind the drive's back. The drive's cache
    /// is not told; use on a drive that has not read these pages yet or
    /// reopen afterwards.
    pub fn set_records(&self, start: u64, records: &[ChunkRecord]) {
        for (i, record) in records.iter().enumerate() {
            self.paged.set_record(start + i as u64, *record);
        }
    }

    pub async fn records(&self, start: u64, count: u64) -> Vec<ChunkRecord> {
        self.drive()
            .records(ChunkSpan::new(start, count))
            .await
            .expect("Failed to read records")
    }

    /// Run cycles of `engine` until one makes no progress. Returns every
    /// outcome, the last one being the first non-progressing one.
    pub async fn run_until_idle(&self, engine: Engine) -> DrivecapResult<Vec<CycleOutcome>> {
        run_until_idle(self.drive(), engine).await
    }

    pub fn zero_ops(&self) -> Vec<DeviceOp> {
        self.device
            .ops()
            .into_iter()
            .filter(|op| matches!(op, DeviceOp::Zero { .. }))
            .collect()
    }
}

/// See [`TestDrive::run_until_idle`].
pub async fn run_until_idle(drive: &Drive, engine: Engine) -> DrivecapResult<Vec<CycleOutcome>> {
    let mut outcomes = Vec::new();
    for _ in 0..MAX_TEST_CYCLES {
        let outcome = drive.run_cycle(engine).await?;
        outcomes.push(outcome);
        if !outcome.made_progress() {
            return Ok(outcomes);
        }
    }
    panic!("{} did not go idle within {} cycles", engine.as_str(), MAX_TEST_CYCLES);
}

/// Run sniff cycles until a pass wraps. Returns the wrapped pass count.
pub async fn run_sniff_pass(drive: &Drive) -> DrivecapResult<u64> {
    for _ in 0..MAX_TEST_CYCLES {
        match drive.run_cycle(Engine::Sniff).await? {
            CycleOutcome::Wrapped { pass_count } => return Ok(pass_count),
            CycleOutcome::Completed { .. } => {}
            other => panic!("sniff pass stalled: {:?}", other),
        }
    }
    panic!("sniff did not wrap within {} cycles", MAX_TEST_CYCLES);
}
