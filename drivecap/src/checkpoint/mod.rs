//! Durable progress cursors.
//!
//! Each background engine owns one cursor in the non-paged store. Cursors
//! only move forward through [`CheckpointStore::advance`], which is a
//! compare-and-swap against the persisted value: a writer holding a stale
//! view can never move a cursor backwards. Backward movement is reserved for
//! explicit retraction (new zero work behind the cursor), pass wrap and
//! reset.
//!
//! The store is kept behind the drive-wide lock; holding `&mut
//! CheckpointStore` is holding that lock.

mod report;

pub use report::{MediaErrorKind, VerifyCounts, VerifyReport};

use std::sync::Arc;

use drivecap_shared::DrivecapResult;
use drivecap_shared::constants::lba::INVALID as LBA_INVALID;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::chunk::Lba;
use crate::io::{NonPagedStore, NonPagedWrite, WriteCondition};

/// Compare-and-swap retries against a concurrently moving persisted value.
const MAX_CAS_ATTEMPTS: usize = 4;

/// Background engine cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    Zero,
    Sniff,
    VerifyInvalidate,
}

impl Cursor {
    pub fn field(self) -> NonPagedField {
        match self {
            Cursor::Zero => NonPagedField::ZeroCheckpoint,
            Cursor::Sniff => NonPagedField::SniffCheckpoint,
            Cursor::VerifyInvalidate => NonPagedField::VerifyInvalidateCheckpoint,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cursor::Zero => "zero",
            Cursor::Sniff => "sniff",
            Cursor::VerifyInvalidate => "verify_invalidate",
        }
    }
}

/// Scalar fields of the non-paged store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonPagedField {
    ZeroCheckpoint,
    SniffCheckpoint,
    VerifyInvalidateCheckpoint,
    /// First media error lba of the chunk sniff is working on.
    MediaErrorLba,
    Flags,
}

impl NonPagedField {
    pub const ALL: [NonPagedField; 5] = [
        NonPagedField::ZeroCheckpoint,
        NonPagedField::SniffCheckpoint,
        NonPagedField::VerifyInvalidateCheckpoint,
        NonPagedField::MediaErrorLba,
        NonPagedField::Flags,
    ];
}

bitflags::bitflags! {
    /// Persisted drive flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DriveFlags: u64 {
        /// Sniff verify runs when the drive is idle.
        const SNIFF_ENABLED = 1 << 0;
        /// Reads of not-yet-zeroed chunks are zeroed on demand.
        const ZERO_ON_DEMAND = 1 << 1;
        /// Consumed capacity was returned and is being rezeroed.
        const SCRUB_NEEDED = 1 << 2;
        /// Encryption rekey in progress; write-same is not usable.
        const REKEY_IN_PROGRESS = 1 << 3;
    }
}

impl Default for DriveFlags {
    fn default() -> Self {
        DriveFlags::SNIFF_ENABLED
    }
}

impl Serialize for DriveFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for DriveFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(DriveFlags::from_bits_retain)
    }
}

/// Everything the non-paged store holds for one drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonPagedState {
    pub zero_checkpoint: Lba,
    pub sniff_checkpoint: Lba,
    /// `LBA_INVALID` while no verify-invalidate pass is pending.
    pub verify_invalidate_checkpoint: Lba,
    pub media_error_lba: Lba,
    pub flags: DriveFlags,
    pub report: VerifyReport,
}

impl Default for NonPagedState {
    fn default() -> Self {
        Self {
            zero_checkpoint: 0,
            sniff_checkpoint: 0,
            verify_invalidate_checkpoint: LBA_INVALID,
            media_error_lba: LBA_INVALID,
            flags: DriveFlags::default(),
            report: VerifyReport::default(),
        }
    }
}

impl NonPagedState {
    pub fn get(&self, field: NonPagedField) -> u64 {
        match field {
            NonPagedField::ZeroCheckpoint => self.zero_checkpoint,
            NonPagedField::SniffCheckpoint => self.sniff_checkpoint,
            NonPagedField::VerifyInvalidateCheckpoint => self.verify_invalidate_checkpoint,
            NonPagedField::MediaErrorLba => self.media_error_lba,
            NonPagedField::Flags => self.flags.bits(),
        }
    }

    pub fn set(&mut self, field: NonPagedField, value: u64) {
        match field {
            NonPagedField::ZeroCheckpoint => self.zero_checkpoint = value,
            NonPagedField::SniffCheckpoint => self.sniff_checkpoint = value,
            NonPagedField::VerifyInvalidateCheckpoint => self.verify_invalidate_checkpoint = value,
            NonPagedField::MediaErrorLba => self.media_error_lba = value,
            NonPagedField::Flags => self.flags = DriveFlags::from_bits_retain(value),
        }
    }

    /// Whether a verify-invalidate pass is pending.
    pub fn verify_invalidate_pending(&self) -> bool {
        self.verify_invalidate_checkpoint != LBA_INVALID
    }
}

/// Outcome of [`CheckpointStore::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    /// The persisted cursor was already at or past the target, or was
    /// retracted below the range being completed.
    Rejected { current: Lba },
}

impl AdvanceOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, AdvanceOutcome::Advanced)
    }
}

/// Cached view of the non-paged store with durable, conditional updates.
pub struct CheckpointStore {
    store: Arc<dyn NonPagedStore>,
    state: NonPagedState,
    end_lba: Lba,
}

impl CheckpointStore {
    /// Persist a fresh state for a new drive. Background zero starts at 0.
    pub async fn initialize(store: Arc<dyn NonPagedStore>, end_lba: Lba) -> DrivecapResult<Self> {
        let state = NonPagedState::default();
        for field in NonPagedField::ALL {
            store
                .write(field, state.get(field), WriteCondition::Always)
                .await?;
        }
        store.write_report(&state.report).await?;
        Ok(Self {
            store,
            state,
            end_lba,
        })
    }

    /// Load persisted state of an existing drive.
    pub async fn load(store: Arc<dyn NonPagedStore>, end_lba: Lba) -> DrivecapResult<Self> {
        let mut state = NonPagedState::default();
        for field in NonPagedField::ALL {
            state.set(field, store.read(field).await?);
        }
        state.report = store.read_report().await?;
        Ok(Self {
            store,
            state,
            end_lba,
        })
    }

    pub fn get(&self, cursor: Cursor) -> Lba {
        self.state.get(cursor.field())
    }

    pub fn state(&self) -> &NonPagedState {
        &self.state
    }

    /// End of exported capacity in blocks.
    pub fn end_lba(&self) -> Lba {
        self.end_lba
    }

    pub fn set_end_lba(&mut self, end_lba: Lba) {
        self.end_lba = end_lba;
    }

    /// Move `cursor` from `from` to `to` if nobody else moved it in between.
    ///
    /// Rejected when the persisted value is already at or beyond `to`, or
    /// when it was retracted below `from` (the completed range is stale).
    pub async fn advance(
        &mut self,
        cursor: Cursor,
        from: Lba,
        to: Lba,
    ) -> DrivecapResult<AdvanceOutcome> {
        let field = cursor.field();
        let mut current = self.state.get(field);

        for _ in 0..MAX_CAS_ATTEMPTS {
            if current < from || current >= to {
                return Ok(AdvanceOutcome::Rejected { current });
            }
            match self
                .store
                .write(field, to, WriteCondition::Expect(current))
                .await?
            {
                NonPagedWrite::Written => {
                    self.state.set(field, to);
                    return Ok(AdvanceOutcome::Advanced);
                }
                NonPagedWrite::Rejected(persisted) => {
                    tracing::debug!(
                        cursor = cursor.as_str(),
                        cached = current,
                        persisted,
                        "Checkpoint moved underneath us"
                    );
                    self.state.set(field, persisted);
                    current = persisted;
                }
            }
        }
        Ok(AdvanceOutcome::Rejected { current })
    }

    /// Move `cursor` back to `to` if it is currently beyond it.
    ///
    /// An idle verify-invalidate cursor (`LBA_INVALID`) sorts above every
    /// lba, so retracting it is how a pass gets scheduled. Returns `true`
    /// when the cursor moved.
    pub async fn retract(&mut self, cursor: Cursor, to: Lba) -> DrivecapResult<bool> {
        let field = cursor.field();
        let mut current = self.state.get(field);

        for _ in 0..MAX_CAS_ATTEMPTS {
            if current <= to {
                return Ok(false);
            }
            match self
                .store
                .write(field, to, WriteCondition::Expect(current))
                .await?
            {
                NonPagedWrite::Written => {
                    self.state.set(field, to);
                    tracing::debug!(cursor = cursor.as_str(), from = current, to, "Checkpoint retracted");
                    return Ok(true);
                }
                NonPagedWrite::Rejected(persisted) => {
                    self.state.set(field, persisted);
                    current = persisted;
                }
            }
        }
        // Persisted value kept changing; force the lower value.
        self.reset(cursor, to.min(current)).await?;
        Ok(true)
    }

    /// Unconditionally set `cursor`.
    pub async fn reset(&mut self, cursor: Cursor, value: Lba) -> DrivecapResult<()> {
        self.write_field(cursor.field(), value).await
    }

    /// Re-read `cursor` from the store.
    pub async fn refresh(&mut self, cursor: Cursor) -> DrivecapResult<Lba> {
        let field = cursor.field();
        let value = self.store.read(field).await?;
        self.state.set(field, value);
        Ok(value)
    }

    /// Reset `cursor` to 0 if it reached the end of capacity.
    pub async fn wrap_if_at_end(&mut self, cursor: Cursor) -> DrivecapResult<bool> {
        if self.get(cursor) < self.end_lba {
            return Ok(false);
        }
        self.reset(cursor, 0).await?;
        Ok(true)
    }

    pub fn flags(&self) -> DriveFlags {
        self.state.flags
    }

    pub async fn insert_flags(&mut self, flags: DriveFlags) -> DrivecapResult<()> {
        let updated = self.state.flags | flags;
        if updated != self.state.flags {
            self.write_field(NonPagedField::Flags, updated.bits()).await?;
        }
        Ok(())
    }

    pub async fn remove_flags(&mut self, flags: DriveFlags) -> DrivecapResult<()> {
        let updated = self.state.flags - flags;
        if updated != self.state.flags {
            self.write_field(NonPagedField::Flags, updated.bits()).await?;
        }
        Ok(())
    }

    pub fn media_error_lba(&self) -> Lba {
        self.state.media_error_lba
    }

    pub async fn set_media_error_lba(&mut self, lba: Lba) -> DrivecapResult<()> {
        if self.state.media_error_lba != lba {
            self.write_field(NonPagedField::MediaErrorLba, lba).await?;
        }
        Ok(())
    }

    pub fn report(&self) -> &VerifyReport {
        &self.state.report
    }

    /// Apply `update` to the verify report and persist it. The cached copy
    /// only changes once the write succeeded.
    pub async fn update_report(
        &mut self,
        update: impl FnOnce(&mut VerifyReport),
    ) -> DrivecapResult<()> {
        let mut report = self.state.report.clone();
        update(&mut report);
        self.store.write_report(&report).await?;
        self.state.report = report;
        Ok(())
    }

    async fn write_field(&mut self, field: NonPagedField, value: u64) -> DrivecapResult<()> {
        self.store.write(field, value, WriteCondition::Always).await?;
        self.state.set(field, value);
        Ok(())
    }
}
