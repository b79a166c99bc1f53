//! Block and chunk range arithmetic.

use serde::{Deserialize, Serialize};

use super::{ChunkIndex, Lba};

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub lba: Lba,
    pub blocks: u64,
}

impl BlockRange {
    pub fn new(lba: Lba, blocks: u64) -> Self {
        Self { lba, blocks }
    }

    /// One past the last block.
    pub fn end(&self) -> Lba {
        self.lba + self.blocks
    }

    pub fn contains(&self, lba: Lba) -> bool {
        lba >= self.lba && lba < self.end()
    }
}

/// A contiguous run of chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start: ChunkIndex,
    pub count: u64,
}

impl ChunkSpan {
    pub fn new(start: ChunkIndex, count: u64) -> Self {
        Self { start, count }
    }

    /// One past the last chunk.
    pub fn end(&self) -> ChunkIndex {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn overlaps(&self, other: &ChunkSpan) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// A block range split into partial leading and trailing edges and the whole
/// chunks between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeSplit {
    pub pre: Option<BlockRange>,
    pub whole: Option<ChunkSpan>,
    pub post: Option<BlockRange>,
}

/// Chunk size and metadata page layout of a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    chunk_size: u64,
    records_per_page: u64,
}

impl ChunkGeometry {
    /// Both values must be non-zero; `DriveOptions::validate` enforces it.
    pub fn new(chunk_size: u64, records_per_page: u64) -> Self {
        Self {
            chunk_size,
            records_per_page,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn records_per_page(&self) -> u64 {
        self.records_per_page
    }

    pub fn chunk_index(&self, lba: Lba) -> ChunkIndex {
        lba / self.chunk_size
    }

    pub fn chunk_start_lba(&self, chunk: ChunkIndex) -> Lba {
        chunk * self.chunk_size
    }

    /// Whole chunks covered by `blocks` (partial tail ignored).
    pub fn chunks_in(&self, blocks: u64) -> u64 {
        blocks / self.chunk_size
    }

    pub fn span_blocks(&self, span: ChunkSpan) -> BlockRange {
        BlockRange::new(
            self.chunk_start_lba(span.start),
            span.count * self.chunk_size,
        )
    }

    pub fn page_of(&self, chunk: ChunkIndex) -> u64 {
        chunk / self.records_per_page
    }

    pub fn page_start(&self, page: u64) -> ChunkIndex {
        page * self.records_per_page
    }

    /// First chunk of the next page after the one holding `chunk`.
    pub fn page_end(&self, chunk: ChunkIndex) -> ChunkIndex {
        self.page_start(self.page_of(chunk) + 1)
    }

    pub fn is_last_in_page(&self, chunk: ChunkIndex) -> bool {
        (chunk + 1) % self.records_per_page == 0
    }

    /// Chunks touched by any block of `range`, partial chunks included.
    pub fn covering_span(&self, range: BlockRange) -> ChunkSpan {
        if range.blocks == 0 {
            return ChunkSpan::new(self.chunk_index(range.lba), 0);
        }
        let first = self.chunk_index(range.lba);
        let last = self.chunk_index(range.end() - 1);
        ChunkSpan::new(first, last - first + 1)
    }

    /// Span starting at the chunk holding `lba`, limited to `max_chunks`, the
    /// end of that metadata page and `end_chunk`.
    pub fn unit_from(&self, lba: Lba, max_chunks: u64, end_chunk: ChunkIndex) -> ChunkSpan {
        let start = self.chunk_index(lba);
        let stop = (start + max_chunks).min(self.page_end(start)).min(end_chunk);
        ChunkSpan::new(start, stop.saturating_sub(start))
    }

    /// Cut `span` at metadata page boundaries.
    pub fn split_by_page(&self, span: ChunkSpan) -> Vec<ChunkSpan> {
        let mut parts = Vec::new();
        let mut start = span.start;
        while start < span.end() {
            let stop = self.page_end(start).min(span.end());
            parts.push(ChunkSpan::new(start, stop - start));
            start = stop;
        }
        parts
    }

    /// Split `range` into partial leading/trailing edges and whole chunks.
    pub fn split_edges(&self, range: BlockRange) -> EdgeSplit {
        let mut split = EdgeSplit::default();
        if range.blocks == 0 {
            return split;
        }

        let end = range.end();
        let first_boundary = range.lba.div_ceil(self.chunk_size) * self.chunk_size;
        let last_boundary = (end / self.chunk_size) * self.chunk_size;

        if first_boundary >= last_boundary {
            // No whole chunk inside the range.
            split.pre = Some(range);
            return split;
        }

        if range.lba < first_boundary {
            split.pre = Some(BlockRange::new(range.lba, first_boundary - range.lba));
        }
        split.whole = Some(ChunkSpan::new(
            self.chunk_index(first_boundary),
            (last_boundary - first_boundary) / self.chunk_size,
        ));
        if end > last_boundary {
            split.post = Some(BlockRange::new(last_boundary, end - last_boundary));
        }
        split
    }
}
