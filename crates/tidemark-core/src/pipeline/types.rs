use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::buffer::PooledBuffer;
use crate::compression::Codec;
use crate::filter::Filter;
use crate::format::SourceIndex;
use crate::index::BlockIndex;
use crate::record::{Record, Span};
use crate::store::StoreHandle;
use crate::types::{BlockBytes, Generation, Timestamp};

/// One log source to merge.
pub enum SourceInput {
    /// Seekable file; blocks can be re-read on demand. An accompanying
    /// persistent index enables block skipping and scheduled release.
    File {
        path: PathBuf,
        index: Option<SourceIndex>,
    },
    /// Non-seekable byte source, consumed once.
    Stream { reader: Box<dyn Read + Send> },
    /// Seekable tlc container; blocks are costly to decompress and are
    /// pre-filtered from their headers.
    Container { path: PathBuf },
}

impl SourceInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SourceInput::File {
            path: path.into(),
            index: None,
        }
    }

    pub fn indexed_file(path: impl Into<PathBuf>, index: SourceIndex) -> Self {
        SourceInput::File {
            path: path.into(),
            index: Some(index),
        }
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        SourceInput::Stream {
            reader: Box::new(reader),
        }
    }

    pub fn container(path: impl Into<PathBuf>) -> Self {
        SourceInput::Container { path: path.into() }
    }
}

impl fmt::Debug for SourceInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceInput::File { path, index } => f
                .debug_struct("File")
                .field("path", path)
                .field("indexed", &index.is_some())
                .finish(),
            SourceInput::Stream { .. } => f.debug_struct("Stream").finish_non_exhaustive(),
            SourceInput::Container { path } => {
                f.debug_struct("Container").field("path", path).finish()
            }
        }
    }
}

/// Where a block came from; decides archiving behavior in the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOrigin {
    File,
    Stream,
    Container,
}

/// A raw block emitted by the reader.
pub(crate) struct RawBlock {
    pub generation: Generation,
    pub origin: BlockOrigin,
    pub bytes: BlockBytes,
    /// Payload is still compressed with this codec (container mode).
    pub compressed: Option<Codec>,
    /// Index known before parsing (persistent index or container header).
    pub prior_index: Option<BlockIndex>,
    /// Schedule key when the run releases in pre-ordered generation order.
    pub floor: Option<Timestamp>,
}

/// Parser output: a parsed block, or a tombstone keeping the generation
/// sequence contiguous when a block was dropped or filtered out.
pub(crate) enum ParserOut {
    Block(ParsedBlock),
    Skip(Generation),
}

pub(crate) enum ParsedPayload {
    Inline(BlockBytes),
    Archived(StoreHandle),
}

/// A parsed block flowing from the parser pool to the pusher.
///
/// `records == None` is the fast path: the block's prior index admitted
/// every record, so the formatter re-derives them from the payload.
pub(crate) struct ParsedBlock {
    pub generation: Generation,
    pub floor: Option<Timestamp>,
    pub index: BlockIndex,
    pub payload: ParsedPayload,
    pub records: Option<Vec<Record>>,
}

/// A block released by the pusher, stamped with its watermark floor and a
/// dense release sequence number. Floors are non-decreasing in `seq`; the
/// merger reassembles release order from `seq` because formatter workers
/// complete out of order.
pub(crate) struct ReleasedBlock {
    pub seq: u64,
    pub block: ParsedBlock,
    pub floor: Timestamp,
}

/// One rendered record inside a formatted block's buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordSlot {
    pub span: Span,
    pub key: Timestamp,
}

/// A fully rendered block awaiting the merger.
pub(crate) struct FormattedBlock {
    pub seq: u64,
    pub generation: Generation,
    pub floor: Timestamp,
    pub buffer: PooledBuffer,
    pub slots: Vec<RecordSlot>,
}

/// Formatter output: a rendered block, or a tombstone for a released block
/// that produced no output. Tombstones keep the release sequence contiguous
/// and still advance the merger's watermark.
pub(crate) enum MergerIn {
    Block(FormattedBlock),
    Skip { seq: u64, floor: Timestamp },
}

impl MergerIn {
    pub fn seq(&self) -> u64 {
        match self {
            MergerIn::Block(block) => block.seq,
            MergerIn::Skip { seq, .. } => *seq,
        }
    }
}

/// Configuration of a merge run.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Target raw block size; blocks extend to the next line boundary.
    pub block_size: usize,
    /// Parser pool size.
    pub parser_workers: usize,
    /// Formatter pool size.
    pub formatter_workers: usize,
    /// BlockStore retention cap in bytes.
    pub store_cap: usize,
    /// Codec for archived blocks.
    pub codec: Codec,
    /// Level / time-window filter.
    pub filter: Filter,
}

impl Default for MergeOptions {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            block_size: 1024 * 1024,
            parser_workers: workers,
            formatter_workers: workers,
            store_cap: 256 * 1024 * 1024,
            codec: Codec::Lz4,
            filter: Filter::default(),
        }
    }
}

/// Outcome counters of a merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub blocks_read: u64,
    /// Blocks rejected by block-level filtering (index skip, container
    /// pre-filter, or empty after record filtering).
    pub blocks_skipped: u64,
    /// Blocks dropped as corrupt.
    pub blocks_dropped: u64,
    pub lines_valid: u64,
    pub lines_invalid: u64,
    pub records_emitted: u64,
    pub bytes_emitted: u64,
    /// High-water mark of BlockStore residency.
    pub store_peak_bytes: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub blocks_read: AtomicU64,
    pub blocks_skipped: AtomicU64,
    pub blocks_dropped: AtomicU64,
    pub lines_valid: AtomicU64,
    pub lines_invalid: AtomicU64,
    pub records_emitted: AtomicU64,
    pub bytes_emitted: AtomicU64,
}

impl RunCounters {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> MergeStats {
        MergeStats {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_skipped: self.blocks_skipped.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            lines_valid: self.lines_valid.load(Ordering::Relaxed),
            lines_invalid: self.lines_invalid.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            ..MergeStats::default()
        }
    }
}
