//! On-disk frame formats: the persistent source index and the `tlc`
//! compressed log container. Both are little-endian, explicitly versioned,
//! and reject frames carrying bits outside the reserved ranges.

pub mod index_file;
pub mod tlc;

pub use index_file::{SourceBlock, SourceFileMeta, SourceIndex, INDEX_MAGIC, INDEX_VERSION};
pub use tlc::{
    ContainerBlockHeader, ContainerReader, ContainerWriter, GlobalHeader, BLOCK_HEADER_SIZE,
    FOOTER_SIZE, GLOBAL_HEADER_SIZE, TLC_END_MAGIC, TLC_MAGIC, TLC_VERSION,
};
