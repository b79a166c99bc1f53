//! Chunk map records.
//!
//! Every chunk of exported capacity is described by a 4-bit record. The
//! record alone decides whether a chunk still needs zeroing before it may be
//! read by the consumer, and whether its metadata can be trusted at all.
//!
//! Records are only mutated through the transition methods on
//! [`ChunkRecord`]. Each transition is idempotent so that replaying a
//! completion after a crash leaves the map exactly where the first
//! application did.

mod range;

pub use range::{BlockRange, ChunkGeometry, ChunkSpan, EdgeSplit};

use serde::{Deserialize, Serialize};

/// Logical block address.
pub type Lba = u64;

/// Index of a chunk in the chunk map.
pub type ChunkIndex = u64;

const VALID_BIT: u8 = 0b0001;
const NEED_ZERO_BIT: u8 = 0b0010;
const USER_ZERO_BIT: u8 = 0b0100;
const CONSUMED_BIT: u8 = 0b1000;

/// Persisted state of one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Record content is trustworthy. Cleared records must go through
    /// verify-invalidate before any zero-fill or data release.
    pub valid: bool,
    /// Background zero has not yet completed since the chunk was provisioned
    /// (or since the last deallocating zero).
    pub need_zero: bool,
    /// A user zero request landed here and has not been serviced yet.
    pub user_zero: bool,
    /// The consumer has written real data to this chunk.
    pub consumed_user_data: bool,
}

impl ChunkRecord {
    /// Record given to freshly provisioned capacity.
    pub const fn provisioned() -> Self {
        Self {
            valid: true,
            need_zero: true,
            user_zero: false,
            consumed_user_data: false,
        }
    }

    /// Record with no trustworthy content. This is also what an all-zero
    /// metadata page decodes to.
    pub const fn untrusted() -> Self {
        Self {
            valid: false,
            need_zero: false,
            user_zero: false,
            consumed_user_data: false,
        }
    }

    /// Record rebuilt by verify-invalidate after the poison pattern was written.
    ///
    /// A range the consumer still owns keeps `consumed_user_data`; anything
    /// else goes back to the provisioned state so background zero reclaims it.
    pub const fn reconstructed(consumed: bool) -> Self {
        Self {
            valid: true,
            need_zero: !consumed,
            user_zero: false,
            consumed_user_data: consumed,
        }
    }

    /// Whether the background zero engine must issue zero I/O for this chunk.
    pub fn needs_zero_io(&self) -> bool {
        self.need_zero || (self.user_zero && self.consumed_user_data)
    }

    /// Whether the record must be routed through verify-invalidate.
    pub fn is_invalid(&self) -> bool {
        !self.valid
    }

    /// Encode into the low nibble of a byte.
    pub fn to_nibble(self) -> u8 {
        let mut bits = 0;
        if self.valid {
            bits |= VALID_BIT;
        }
        if self.need_zero {
            bits |= NEED_ZERO_BIT;
        }
        if self.user_zero {
            bits |= USER_ZERO_BIT;
        }
        if self.consumed_user_data {
            bits |= CONSUMED_BIT;
        }
        bits
    }

    /// Decode from the low nibble of a byte. High bits are ignored.
    pub fn from_nibble(bits: u8) -> Self {
        Self {
            valid: bits & VALID_BIT != 0,
            need_zero: bits & NEED_ZERO_BIT != 0,
            user_zero: bits & USER_ZERO_BIT != 0,
            consumed_user_data: bits & CONSUMED_BIT != 0,
        }
    }

    /// Apply background zero completion.
    ///
    /// A serviced user zero marks the chunk as consumed: the consumer asked
    /// for zeros and now owns them. `need_zero` survives a deallocating zero
    /// because unmapped blocks are only guaranteed zero until reprovisioned.
    pub fn complete_background_zero(&mut self, deallocate: bool) {
        if self.user_zero {
            self.consumed_user_data = true;
        }
        self.need_zero = deallocate;
        self.user_zero = false;
    }

    /// Apply a user zero request to a whole chunk.
    ///
    /// An untrustworthy record is replaced outright: the consumer has just
    /// declared the range as its own zeros, so whatever the old record said
    /// no longer matters.
    pub fn request_user_zero(&mut self, deallocate: bool) {
        if !self.valid {
            *self = Self {
                valid: true,
                need_zero: deallocate,
                user_zero: true,
                consumed_user_data: true,
            };
            return;
        }
        self.user_zero = true;
        self.need_zero |= deallocate;
    }

    /// Return consumed capacity to the provisioned state (consumer unbound the
    /// range). Returns `true` when the record changed.
    pub fn scrub(&mut self) -> bool {
        if !self.consumed_user_data {
            return false;
        }
        self.consumed_user_data = false;
        self.user_zero = false;
        self.need_zero = true;
        true
    }

    /// Mark the chunk for a full rezero of the drive.
    pub fn mark_disk_zero(&mut self) {
        *self = Self::provisioned();
    }
}

/// Whether the background zero engine must issue zero I/O for `record`.
pub fn chunk_needs_zero(record: &ChunkRecord) -> bool {
    record.needs_zero_io()
}

/// Whether `record` must be handled by verify-invalidate.
pub fn chunk_is_invalid(record: &ChunkRecord) -> bool {
    record.is_invalid()
}

/// Number of records that need zero I/O.
pub fn count_marked(records: &[ChunkRecord]) -> usize {
    records.iter().filter(|r| r.needs_zero_io()).count()
}

/// Number of untrustworthy records.
pub fn count_invalid(records: &[ChunkRecord]) -> usize {
    records.iter().filter(|r| r.is_invalid()).count()
}

/// First record at or after `start` that needs zero I/O.
pub fn next_marked(records: &[ChunkRecord], start: usize) -> Option<usize> {
    find_from(records, start, ChunkRecord::needs_zero_io)
}

/// First valid record at or after `start` that no longer needs zero I/O.
pub fn next_zeroed(records: &[ChunkRecord], start: usize) -> Option<usize> {
    find_from(records, start, |r| r.valid && !r.needs_zero_io())
}

/// First untrustworthy record at or after `start`.
pub fn next_invalid(records: &[ChunkRecord], start: usize) -> Option<usize> {
    find_from(records, start, ChunkRecord::is_invalid)
}

fn find_from(
    records: &[ChunkRecord],
    start: usize,
    pred: impl Fn(&ChunkRecord) -> bool,
) -> Option<usize> {
    records
        .get(start..)?
        .iter()
        .position(pred)
        .map(|offset| start + offset)
}

/// Pack records two per byte, even index in the low nibble.
pub fn pack_records(records: &[ChunkRecord]) -> Vec<u8> {
    records
        .chunks(2)
        .map(|pair| {
            let low = pair[0].to_nibble();
            let high = pair.get(1).map(|r| r.to_nibble()).unwrap_or(0);
            low | (high << 4)
        })
        .collect()
}

/// Unpack `count` records from bytes produced by [`pack_records`].
///
/// Missing trailing bytes decode as untrusted records.
pub fn unpack_records(bytes: &[u8], count: usize) -> Vec<ChunkRecord> {
    (0..count).map(|i| read_packed(bytes, i)).collect()
}

/// Read record `index` from a packed buffer. Out-of-range reads decode as
/// untrusted.
pub fn read_packed(bytes: &[u8], index: usize) -> ChunkRecord {
    let byte = bytes.get(index / 2).copied().unwrap_or(0);
    let nibble = if index % 2 == 0 { byte & 0x0f } else { byte >> 4 };
    ChunkRecord::from_nibble(nibble)
}

/// Store record `index` into a packed buffer. Out-of-range writes are ignored.
pub fn write_packed(bytes: &mut [u8], index: usize, record: ChunkRecord) {
    let Some(byte) = bytes.get_mut(index / 2) else {
        return;
    };
    let nibble = record.to_nibble();
    *byte = if index % 2 == 0 {
        (*byte & 0xf0) | nibble
    } else {
        (*byte & 0x0f) | (nibble << 4)
    };
}
