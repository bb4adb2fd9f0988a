pub mod mmap;
pub mod scanner;

pub use mmap::MmapInput;
pub use scanner::{BlockScanner, StreamChunk, StreamChunker};
