pub mod buffer;
pub mod compression;
pub mod error;
pub mod filter;
pub mod format;
pub mod index;
pub mod indexer;
pub mod io;
pub mod pipeline;
pub mod record;
pub mod store;
pub mod types;

pub use buffer::{BufferPool, PoolMetricsSnapshot, PooledBuffer};
pub use compression::Codec;
pub use error::{Result, TidemarkError};
pub use filter::{Filter, TimeWindow};
pub use format::{
    ContainerReader, ContainerWriter, SourceBlock, SourceFileMeta, SourceIndex, INDEX_MAGIC,
    INDEX_VERSION, TLC_MAGIC, TLC_VERSION,
};
pub use index::{
    BlockIndex, LineCounts, TsRange, FLAG_BINARY, FLAG_KNOWN_MASK, FLAG_LEVEL_DEBUG,
    FLAG_LEVEL_ERROR, FLAG_LEVEL_INFO, FLAG_LEVEL_MASK, FLAG_LEVEL_WARNING, FLAG_SORTED,
};
pub use indexer::Indexer;
pub use io::{BlockScanner, MmapInput};
pub use pipeline::{CancelToken, MergeOptions, MergePipeline, MergeStats, SourceInput};
pub use record::{
    JsonLineParser, ParsedLine, ParsedRecords, PlainFormatter, Record, RecordFormatter,
    RecordParser, Span,
};
pub use store::{BlockStore, CompressedPayload, StoreHandle};
pub use types::{BlockBytes, Generation, Level, LevelMask, Timestamp};
